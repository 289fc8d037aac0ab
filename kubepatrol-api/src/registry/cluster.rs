//! Per-cluster identity, connection state and watch bookkeeping

use super::client::RestConfig;
use super::kubeconfig::{self, ContextInfo};
use kubepatrol_common::{AwsCredentials, ClusterSource, ConnectStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::OnceLock;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;

/// Reserved identity of the cluster this process runs in
pub const IN_CLUSTER_ID: &str = "InCluster";

/// Cluster name reported for the in-cluster entry
pub const IN_CLUSTER_NAME: &str = "kubernetes";

/// Mutable connection state, guarded by the entry's lock
#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub status: ConnectStatus,
    pub server_version: Option<String>,
    pub error: Option<String>,
    pub rest_config: Option<RestConfig>,
}

/// Stops a running watch task
#[derive(Debug)]
pub struct WatchHandle {
    abort: AbortHandle,
}

impl WatchHandle {
    pub fn new(abort: AbortHandle) -> Self {
        Self { abort }
    }

    pub fn from_task<T>(task: &tokio::task::JoinHandle<T>) -> Self {
        Self::new(task.abort_handle())
    }

    /// Consumes the handle so a watch can only be stopped once
    pub fn stop(self) {
        self.abort.abort();
    }
}

#[derive(Debug)]
pub struct WatchStatus {
    pub started: bool,
    pub start_time: i64,
    handle: Option<WatchHandle>,
}

/// Read-only view of a cluster for reporting
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSnapshot {
    pub id: String,
    pub file_name: String,
    pub context_name: String,
    pub cluster_name: String,
    pub server: String,
    pub user_name: String,
    pub namespace: Option<String>,
    pub source: ClusterSource,
    pub status: ConnectStatus,
    pub server_version: Option<String>,
    pub error: Option<String>,
    pub not_after: i64,
    pub watches: Vec<String>,
}

/// A cluster identity known to the registry.
///
/// Identity fields are immutable after construction; connection state and
/// watches sit behind their own locks.
#[derive(Debug)]
pub struct ClusterConfig {
    pub file_name: String,
    pub context_name: String,
    pub cluster_name: String,
    pub server: String,
    pub user_name: String,
    pub namespace: Option<String>,
    pub source: ClusterSource,
    pub aws: Option<AwsCredentials>,
    kubeconfig: Vec<u8>,
    state: RwLock<ConnectionState>,
    watches: RwLock<HashMap<String, WatchStatus>>,
    not_after: OnceLock<i64>,
}

impl ClusterConfig {
    pub fn from_context(file_name: &str, info: &ContextInfo, kubeconfig: Vec<u8>, source: ClusterSource) -> Self {
        Self {
            file_name: file_name.to_string(),
            context_name: info.context_name.clone(),
            cluster_name: info.cluster_name.clone(),
            server: info.server.clone(),
            user_name: info.user_name.clone(),
            namespace: info.namespace.clone(),
            source,
            aws: None,
            kubeconfig,
            state: RwLock::new(ConnectionState::default()),
            watches: RwLock::new(HashMap::new()),
            not_after: OnceLock::new(),
        }
    }

    /// Entry for the ambient in-cluster environment
    pub fn in_cluster(server: &str) -> Self {
        Self {
            file_name: IN_CLUSTER_ID.to_string(),
            context_name: IN_CLUSTER_ID.to_string(),
            cluster_name: IN_CLUSTER_NAME.to_string(),
            server: server.to_string(),
            user_name: String::new(),
            namespace: None,
            source: ClusterSource::InCluster,
            aws: None,
            kubeconfig: Vec::new(),
            state: RwLock::new(ConnectionState::default()),
            watches: RwLock::new(HashMap::new()),
            not_after: OnceLock::new(),
        }
    }

    pub fn with_aws(mut self, credentials: AwsCredentials) -> Self {
        self.aws = Some(credentials);
        self
    }

    pub fn id(&self) -> String {
        if self.is_in_cluster() {
            IN_CLUSTER_ID.to_string()
        } else {
            format!("{}/{}", self.file_name, self.context_name)
        }
    }

    pub fn is_in_cluster(&self) -> bool {
        self.source == ClusterSource::InCluster
    }

    pub fn kubeconfig(&self) -> &[u8] {
        &self.kubeconfig
    }

    pub async fn state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    pub async fn status(&self) -> ConnectStatus {
        self.state.read().await.status
    }

    pub async fn is_connected(&self) -> bool {
        self.status().await == ConnectStatus::Connected
    }

    /// Client certificate expiry in unix seconds, 0 when it cannot be read.
    /// Parsed on first use.
    pub fn certificate_expiry(&self) -> i64 {
        *self.not_after.get_or_init(|| {
            if self.kubeconfig.is_empty() {
                return 0;
            }
            match kubeconfig::with_current_context(&self.kubeconfig, &self.context_name) {
                Ok(pinned) => kubeconfig::client_certificate_expiry(pinned.as_bytes()),
                Err(_) => kubeconfig::client_certificate_expiry(&self.kubeconfig),
            }
        })
    }

    /// Move to Connecting unless a connect is already underway or done.
    /// Clears the previous version, error and derived config.
    pub(crate) async fn begin_connect(&self) -> bool {
        let mut state = self.state.write().await;
        if state.status.is_busy() {
            return false;
        }
        *state = ConnectionState {
            status: ConnectStatus::Connecting,
            ..Default::default()
        };
        true
    }

    pub(crate) async fn mark_connected(&self, server_version: Option<String>, rest_config: RestConfig) {
        let mut state = self.state.write().await;
        state.status = ConnectStatus::Connected;
        state.server_version = server_version;
        state.error = None;
        state.rest_config = Some(rest_config);
    }

    pub(crate) async fn mark_failed(&self, error: String) {
        let mut state = self.state.write().await;
        state.status = ConnectStatus::Failed;
        state.error = Some(error);
        state.rest_config = None;
    }

    pub(crate) async fn reset(&self) {
        *self.state.write().await = ConnectionState::default();
    }

    /// Record a watch of `watch_type` as started. A handle already stored
    /// for the same type is stopped first.
    pub async fn set_watch_started(&self, watch_type: &str, handle: Option<WatchHandle>) {
        let mut watches = self.watches.write().await;
        let previous = watches.insert(
            watch_type.to_string(),
            WatchStatus {
                started: true,
                start_time: chrono::Utc::now().timestamp(),
                handle,
            },
        );
        if let Some(WatchStatus { handle: Some(old), .. }) = previous {
            old.stop();
        }
    }

    pub async fn is_watch_started(&self, watch_type: &str) -> bool {
        self.watches
            .read()
            .await
            .get(watch_type)
            .map(|w| w.started)
            .unwrap_or(false)
    }

    pub async fn watch_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.watches.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    /// Stop and forget every watch. Returns how many handles were stopped.
    pub(crate) async fn stop_watches(&self) -> usize {
        let drained: Vec<WatchStatus> = self.watches.write().await.drain().map(|(_, w)| w).collect();
        let mut stopped = 0;
        for handle in drained.into_iter().filter_map(|w| w.handle) {
            handle.stop();
            stopped += 1;
        }
        stopped
    }

    pub async fn snapshot(&self) -> ClusterSnapshot {
        let state = self.state().await;
        ClusterSnapshot {
            id: self.id(),
            file_name: self.file_name.clone(),
            context_name: self.context_name.clone(),
            cluster_name: self.cluster_name.clone(),
            server: self.server.clone(),
            user_name: self.user_name.clone(),
            namespace: self.namespace.clone(),
            source: self.source,
            status: state.status,
            server_version: state.server_version,
            error: state.error,
            not_after: self.certificate_expiry(),
            watches: self.watch_types().await,
        }
    }
}
