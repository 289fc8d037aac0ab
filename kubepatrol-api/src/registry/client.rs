//! Contract with the cluster wire-protocol client
//!
//! The registry never talks to an API server itself. It derives a
//! [`RestConfig`] and hands it to a [`ResourceClient`], which owns the live
//! per-cluster handles.

use super::error::K8sResult;
use async_trait::async_trait;
use kubepatrol_common::AwsCredentials;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Connection parameters derived from a cluster entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestConfig {
    /// API server URL
    pub host: String,
    /// Context the kubeconfig is pinned to
    pub context: Option<String>,
    /// Kubeconfig with `current-context` rewritten to `context`
    pub kubeconfig: Option<String>,
    /// Use the service account of the running pod
    pub in_cluster: bool,
}

impl RestConfig {
    pub fn from_kubeconfig(host: impl Into<String>, context: impl Into<String>, kubeconfig: String) -> Self {
        Self {
            host: host.into(),
            context: Some(context.into()),
            kubeconfig: Some(kubeconfig),
            in_cluster: false,
        }
    }

    pub fn in_cluster(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            context: None,
            kubeconfig: None,
            in_cluster: true,
        }
    }
}

/// Resource selector built up by the script bridge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceQuery {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub all_namespaces: bool,
    pub name: Option<String>,
    pub label_selector: Option<String>,
    /// Serve repeated reads from a cache for this long
    pub cache_ttl: Option<Duration>,
}

impl ResourceQuery {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            ..Default::default()
        }
    }

    /// `v1` for the core group, `group/version` otherwise
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Namespace to scope a request to; `None` means cluster-wide
    pub fn effective_namespace(&self) -> Option<&str> {
        if self.all_namespaces {
            None
        } else {
            self.namespace.as_deref()
        }
    }

    pub fn cache_key(&self, verb: &str) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            verb,
            self.api_version(),
            self.kind,
            self.effective_namespace().unwrap_or("*"),
            self.name.as_deref().unwrap_or(""),
            self.label_selector.as_deref().unwrap_or("")
        )
    }
}

/// Options for fetching container logs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub container: Option<String>,
    pub tail_lines: Option<i64>,
}

/// Raw log byte stream; callers read it to the end and drop it
pub type LogStream = Pin<Box<dyn futures::io::AsyncRead + Send>>;

/// Operations on one connected cluster
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list(&self, query: &ResourceQuery) -> K8sResult<Vec<serde_json::Value>>;

    async fn get(&self, query: &ResourceQuery) -> K8sResult<serde_json::Value>;

    /// Apply a strategic-merge patch to the named resource
    async fn patch(&self, query: &ResourceQuery, patch: &serde_json::Value) -> K8sResult<serde_json::Value>;

    /// Field documentation for a dotted path such as `spec.replicas`
    async fn field_doc(&self, query: &ResourceQuery, field: &str) -> K8sResult<String>;

    async fn logs(&self, query: &ResourceQuery, options: &LogOptions) -> K8sResult<LogStream>;

    async fn pod_resource_usage(&self, query: &ResourceQuery) -> K8sResult<serde_json::Value>;
}

/// Registers clusters and hands out live per-cluster handles
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Build a throwaway client and return the server's git version
    async fn server_version(&self, config: &RestConfig) -> K8sResult<String>;

    async fn register_by_config(&self, cluster_id: &str, config: &RestConfig) -> K8sResult<()>;

    async fn register_in_cluster(&self, cluster_id: &str, config: &RestConfig) -> K8sResult<()>;

    async fn register_aws(
        &self,
        cluster_id: &str,
        credentials: &AwsCredentials,
        config: &RestConfig,
    ) -> K8sResult<()>;

    /// Config of the cluster this process runs in
    async fn in_cluster_config(&self) -> K8sResult<RestConfig>;

    async fn remove_cluster(&self, cluster_id: &str);

    fn cluster(&self, cluster_id: &str) -> Option<Arc<dyn ClusterApi>>;
}
