//! KubePatrol API Library
//!
//! Cluster registry, cron-driven inspection engine and webhook notifications
//! for fleets of Kubernetes clusters, exposed for the daemon binary and for
//! integration tests.

// Core modules
pub mod config;
pub mod logging;

// Database
pub mod db;

// Cluster discovery and connections
pub mod registry;

// Cron scheduling
pub mod scheduler;

// Check scripts
pub mod script;

// Inspection runs and summaries
pub mod inspection;

// Webhooks
pub mod webhooks;

// Kubernetes integration
#[cfg(feature = "kubernetes")]
pub mod kubernetes;

// Graceful shutdown handling
pub mod shutdown;

pub use config::KubePatrolConfig;
pub use inspection::{InspectionEngine, InspectionError};
pub use registry::ClusterRegistry;
pub use scheduler::Scheduler;
