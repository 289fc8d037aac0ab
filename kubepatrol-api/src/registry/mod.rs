//! Cluster registry
//!
//! Reconciles cluster identities from a kubeconfig directory, the
//! `kube_configs` table (including AWS credential rows) and the in-cluster
//! environment, and drives each entry through
//! Disconnected -> Connecting -> Connected | Failed.

pub mod client;
pub mod cluster;
pub mod error;
pub mod kubeconfig;

pub use client::{ClusterApi, LogOptions, LogStream, ResourceClient, ResourceQuery, RestConfig};
pub use cluster::{ClusterConfig, ClusterSnapshot, ConnectionState, WatchHandle, IN_CLUSTER_ID};
pub use error::{K8sError, K8sResult};

use crate::db::{self, Database};
use kubeconfig::Kubeconfig;
use kubepatrol_common::{AwsCredentials, ClusterSource, KubeConfigRow};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// File name used for every AWS-sourced entry
pub const AWS_FILE_NAME: &str = "AWS";

/// Invoked after a cluster reaches Connected; typically starts watches
pub type ConnectedCallback = Arc<dyn Fn(Arc<ClusterConfig>) + Send + Sync>;

/// Entries added and removed by one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub from_files: usize,
    pub from_database: usize,
    pub removed: usize,
}

pub struct ClusterRegistry {
    clusters: RwLock<Vec<Arc<ClusterConfig>>>,
    client: Arc<dyn ResourceClient>,
    db: Option<Database>,
    kubeconfig_path: PathBuf,
    in_cluster: AtomicBool,
    on_connected: RwLock<Option<ConnectedCallback>>,
}

impl ClusterRegistry {
    pub fn new(client: Arc<dyn ResourceClient>, kubeconfig_path: impl Into<PathBuf>) -> Self {
        Self {
            clusters: RwLock::new(Vec::new()),
            client,
            db: None,
            kubeconfig_path: kubeconfig_path.into(),
            in_cluster: AtomicBool::new(false),
            on_connected: RwLock::new(None),
        }
    }

    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_in_cluster(self, enabled: bool) -> Self {
        self.in_cluster.store(enabled, Ordering::SeqCst);
        self
    }

    pub async fn set_on_connected(&self, callback: ConnectedCallback) {
        *self.on_connected.write().await = Some(callback);
    }

    pub fn in_cluster_enabled(&self) -> bool {
        self.in_cluster.load(Ordering::SeqCst)
    }

    pub fn resource_client(&self) -> &Arc<dyn ResourceClient> {
        &self.client
    }

    /// Sweep the kubeconfig directory and the database.
    ///
    /// Parse failures are logged and skipped; a database failure is logged
    /// and leaves database-sourced entries untouched.
    pub async fn scan(&self) -> ScanReport {
        let mut report = ScanReport {
            from_files: self.scan_dir().await,
            ..Default::default()
        };

        if self.db.is_some() {
            match self.scan_db().await {
                Ok((added, removed)) => {
                    report.from_database = added;
                    report.removed = removed;
                }
                Err(e) => warn!("Failed to scan kubeconfigs from database: {}", e),
            }
        }

        debug!(
            files = report.from_files,
            database = report.from_database,
            removed = report.removed,
            "Cluster scan finished"
        );
        report
    }

    /// Add one entry per context of every regular file in the directory
    /// holding the configured kubeconfig path.
    pub async fn scan_dir(&self) -> usize {
        let dir = match self.kubeconfig_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read kubeconfig directory {}: {}", dir.display(), e);
                return 0;
            }
        };

        let mut added = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read kubeconfig directory entry: {}", e);
                    break;
                }
            };

            let path = entry.path();
            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => {}
                _ => continue,
            }

            let file_name = entry.file_name().to_string_lossy().to_string();
            added += self.load_kubeconfig_file(&path, &file_name).await;
        }

        added
    }

    async fn load_kubeconfig_file(&self, path: &Path, file_name: &str) -> usize {
        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to read kubeconfig {}: {}", path.display(), e);
                return 0;
            }
        };

        let config = match Kubeconfig::from_slice(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!("Skipping kubeconfig {}: {}", path.display(), e);
                return 0;
            }
        };

        let mut added = 0;
        for info in config.context_infos() {
            let entry = ClusterConfig::from_context(file_name, &info, content.clone(), ClusterSource::File);
            if self.add_to_cluster_list(entry).await {
                added += 1;
            }
        }
        added
    }

    /// Reconcile against the kube_configs table. Returns (added, removed).
    pub async fn scan_db(&self) -> K8sResult<(usize, usize)> {
        let Some(ref db) = self.db else {
            return Ok((0, 0));
        };
        let rows = db::kube_configs::list(db.pool()).await?;

        let removed = self.remove_stale_db_entries(&rows).await;

        let mut added = 0;
        for row in &rows {
            added += self.add_db_row(row).await;
        }

        Ok((added, removed))
    }

    /// Force-disconnect and drop database-backed entries whose
    /// (server, user, cluster) triple no longer appears in `rows`.
    async fn remove_stale_db_entries(&self, rows: &[KubeConfigRow]) -> usize {
        let stale: Vec<Arc<ClusterConfig>> = self
            .clusters
            .read()
            .await
            .iter()
            .filter(|c| c.source.is_database_backed())
            .filter(|c| {
                !rows
                    .iter()
                    .any(|r| r.server == c.server && r.user == c.user_name && r.cluster == c.cluster_name)
            })
            .cloned()
            .collect();

        for entry in &stale {
            info!("Removing cluster {} no longer present in database", entry.id());
            self.disconnect_config(entry).await;
        }

        if !stale.is_empty() {
            self.clusters
                .write()
                .await
                .retain(|c| !stale.iter().any(|s| Arc::ptr_eq(s, c)));
        }

        stale.len()
    }

    async fn add_db_row(&self, row: &KubeConfigRow) -> usize {
        let config = match Kubeconfig::from_slice(row.content.as_bytes()) {
            Ok(config) => config,
            Err(e) => {
                warn!("Skipping database kubeconfig {}: {}", row.id, e);
                return 0;
            }
        };

        let mut added = 0;
        for info in config.context_infos().into_iter().filter(|i| i.user_name == row.user) {
            let (file_name, source) = if row.is_aws {
                (AWS_FILE_NAME.to_string(), ClusterSource::Aws)
            } else {
                let name = match row.display_name.as_deref().map(str::trim) {
                    Some(name) if !name.is_empty() => name.to_string(),
                    _ => format!("{}-{}", row.id, info.context_name),
                };
                (name, ClusterSource::Db)
            };

            let mut entry =
                ClusterConfig::from_context(&file_name, &info, row.content.clone().into_bytes(), source);
            if row.is_aws {
                entry = entry.with_aws(row.aws_credentials());
            }
            if self.add_to_cluster_list(entry).await {
                added += 1;
            }
        }
        added
    }

    /// Append unless an entry with the same ID exists. Returns whether it was added.
    pub async fn add_to_cluster_list(&self, entry: ClusterConfig) -> bool {
        let id = entry.id();
        let mut clusters = self.clusters.write().await;
        if clusters.iter().any(|c| c.id() == id) {
            return false;
        }
        debug!("Registered cluster {}", id);
        clusters.push(Arc::new(entry));
        true
    }

    /// Look up `"InCluster"` or `"<file>/<context>"`, splitting at the first `/`.
    pub async fn get_cluster_by_id(&self, id: &str) -> Option<Arc<ClusterConfig>> {
        let clusters = self.clusters.read().await;

        if id == IN_CLUSTER_ID || id == "InCluster/InCluster" {
            return clusters.iter().find(|c| c.is_in_cluster()).cloned();
        }

        let (file_name, context) = id.split_once('/')?;
        clusters
            .iter()
            .find(|c| !c.is_in_cluster() && c.file_name == file_name && c.context_name == context)
            .cloned()
    }

    pub async fn all_clusters(&self) -> Vec<Arc<ClusterConfig>> {
        self.clusters.read().await.clone()
    }

    pub async fn connected_clusters(&self) -> Vec<Arc<ClusterConfig>> {
        let mut connected = Vec::new();
        for entry in self.all_clusters().await {
            if entry.is_connected().await {
                connected.push(entry);
            }
        }
        connected
    }

    pub async fn first_cluster_id(&self) -> Option<String> {
        self.connected_clusters().await.first().map(|c| c.id())
    }

    pub async fn is_connected(&self, id: &str) -> bool {
        match self.get_cluster_by_id(id).await {
            Some(entry) => entry.is_connected().await,
            None => false,
        }
    }

    pub async fn snapshots(&self) -> Vec<ClusterSnapshot> {
        let mut snapshots = Vec::new();
        for entry in self.all_clusters().await {
            snapshots.push(entry.snapshot().await);
        }
        snapshots
    }

    /// Live resource handle for a connected cluster
    pub fn handle(&self, id: &str) -> Option<Arc<dyn ClusterApi>> {
        self.client.cluster(id)
    }

    /// Connect a cluster by ID. A request for an entry already Connecting or
    /// Connected is ignored. Failures are recorded on the entry and returned.
    pub async fn connect(&self, id: &str) -> K8sResult<()> {
        let entry = self
            .get_cluster_by_id(id)
            .await
            .ok_or_else(|| K8sError::ClusterNotFound(id.to_string()))?;
        self.connect_config(&entry).await
    }

    async fn connect_config(&self, entry: &Arc<ClusterConfig>) -> K8sResult<()> {
        let id = entry.id();
        if !entry.begin_connect().await {
            debug!("Cluster {} is already {}", id, entry.status().await);
            return Ok(());
        }

        info!(cluster = %id, "Connecting cluster");
        match self.establish(entry, &id).await {
            Ok((version, rest)) => {
                entry.mark_connected(version.clone(), rest).await;
                info!(
                    cluster = %id,
                    version = version.as_deref().unwrap_or("unknown"),
                    "Cluster connected"
                );
                let callback = self.on_connected.read().await.clone();
                if let Some(callback) = callback {
                    callback(entry.clone());
                }
                Ok(())
            }
            Err(e) => {
                warn!(cluster = %id, "Cluster connection failed: {}", e);
                entry.mark_failed(e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Derive the REST config, probe the server and register with the
    /// resource client.
    async fn establish(&self, entry: &ClusterConfig, id: &str) -> K8sResult<(Option<String>, RestConfig)> {
        match entry.source {
            ClusterSource::InCluster => {
                let rest = self.client.in_cluster_config().await?;
                let version = self.client.server_version(&rest).await?;
                self.client.register_in_cluster(id, &rest).await?;
                Ok((Some(version), rest))
            }
            ClusterSource::Aws => {
                let credentials = entry
                    .aws
                    .as_ref()
                    .ok_or_else(|| K8sError::InvalidKubeconfig(format!("AWS credentials missing for {}", id)))?;
                credentials.validate()?;
                let rest = Self::derive_rest_config(entry)?;
                self.client.register_aws(id, credentials, &rest).await?;
                Ok((None, rest))
            }
            ClusterSource::File | ClusterSource::Db => {
                let rest = Self::derive_rest_config(entry)?;
                let version = self.client.server_version(&rest).await?;
                self.client.register_by_config(id, &rest).await?;
                Ok((Some(version), rest))
            }
        }
    }

    fn derive_rest_config(entry: &ClusterConfig) -> K8sResult<RestConfig> {
        let pinned = kubeconfig::with_current_context(entry.kubeconfig(), &entry.context_name)?;
        Ok(RestConfig::from_kubeconfig(entry.server.clone(), entry.context_name.clone(), pinned))
    }

    /// Stop watches, deregister and reset to Disconnected. Unknown IDs are ignored.
    pub async fn disconnect(&self, id: &str) {
        if let Some(entry) = self.get_cluster_by_id(id).await {
            self.disconnect_config(&entry).await;
        }
    }

    async fn disconnect_config(&self, entry: &ClusterConfig) {
        let id = entry.id();
        let stopped = entry.stop_watches().await;
        self.client.remove_cluster(&id).await;
        entry.reset().await;
        info!(cluster = %id, watches = stopped, "Cluster disconnected");
    }

    /// Register the cluster this process runs in, when enabled. Failure to
    /// discover the environment disables in-cluster mode for the process.
    pub async fn register_in_cluster(&self) -> K8sResult<()> {
        if !self.in_cluster_enabled() {
            return Ok(());
        }

        let rest = match self.client.in_cluster_config().await {
            Ok(rest) => rest,
            Err(e) => {
                self.in_cluster.store(false, Ordering::SeqCst);
                warn!("In-cluster configuration unavailable, disabling in-cluster mode: {}", e);
                return Err(e);
            }
        };

        self.add_to_cluster_list(ClusterConfig::in_cluster(&rest.host)).await;
        self.connect(IN_CLUSTER_ID).await
    }

    /// Add the first context of `kubeconfig` as an AWS EKS entry and connect it
    pub async fn register_aws_eks_cluster(
        &self,
        credentials: AwsCredentials,
        kubeconfig: &[u8],
    ) -> K8sResult<String> {
        credentials.validate()?;

        let config = Kubeconfig::from_slice(kubeconfig)?;
        let info = config
            .context_infos()
            .into_iter()
            .next()
            .ok_or_else(|| K8sError::InvalidKubeconfig("kubeconfig has no contexts".to_string()))?;

        let entry = ClusterConfig::from_context(AWS_FILE_NAME, &info, kubeconfig.to_vec(), ClusterSource::Aws)
            .with_aws(credentials);
        let id = entry.id();
        self.add_to_cluster_list(entry).await;
        self.connect(&id).await?;
        Ok(id)
    }

    /// Register the current context of a single kubeconfig file and connect it
    pub async fn register_clusters_by_path(&self, path: &Path) -> K8sResult<String> {
        let content = tokio::fs::read(path)
            .await
            .map_err(|e| K8sError::InvalidKubeconfig(format!("Failed to read {}: {}", path.display(), e)))?;
        let config = Kubeconfig::from_slice(&content)?;
        let info = config
            .current_context_info()
            .ok_or_else(|| K8sError::InvalidKubeconfig("kubeconfig has no contexts".to_string()))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| K8sError::InvalidKubeconfig(format!("{} is not a file", path.display())))?;

        let entry = ClusterConfig::from_context(&file_name, &info, content, ClusterSource::File);
        let id = entry.id();
        self.add_to_cluster_list(entry).await;
        self.connect(&id).await?;
        Ok(id)
    }
}
