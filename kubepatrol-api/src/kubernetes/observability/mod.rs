//! Kubernetes observability
//!
//! Container logs and metrics-server usage.

pub mod logs;
pub mod metrics;
