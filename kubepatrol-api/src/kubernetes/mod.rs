//! Kubernetes integration
//!
//! kube-rs implementation of the registry's [`ResourceClient`] contract:
//! - client construction from pinned kubeconfigs, in-cluster config and
//!   AWS EKS exec credentials
//! - dynamic list/get/patch through discovery
//! - field documentation, container logs and pod resource usage

pub mod client;
pub mod explain;
pub mod observability;
pub mod resources;

use crate::registry::{ClusterApi, K8sError, K8sResult, ResourceClient, RestConfig};
use async_trait::async_trait;
use client::K8sClient;
use kubepatrol_common::AwsCredentials;
use resources::KubeCluster;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Live kube-rs handles keyed by cluster ID
#[derive(Default)]
pub struct KubeResourceClient {
    clusters: RwLock<HashMap<String, Arc<KubeCluster>>>,
}

impl KubeResourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<KubeCluster>>> {
        self.clusters.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<KubeCluster>>> {
        self.clusters.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, cluster_id: &str, client: K8sClient) {
        self.write()
            .insert(cluster_id.to_string(), Arc::new(KubeCluster::new(client)));
        tracing::debug!(cluster = cluster_id, "Registered kube client");
    }

    pub fn cluster_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn server_version(&self, config: &RestConfig) -> K8sResult<String> {
        let probe = K8sClient::from_rest_config(config, "probe").await?;
        probe
            .git_version()
            .await
            .map_err(|e| K8sError::Connection(format!("{} is unreachable: {}", config.host, e)))
    }

    async fn register_by_config(&self, cluster_id: &str, config: &RestConfig) -> K8sResult<()> {
        let client = K8sClient::from_rest_config(config, cluster_id).await?;
        self.insert(cluster_id, client);
        Ok(())
    }

    async fn register_in_cluster(&self, cluster_id: &str, _config: &RestConfig) -> K8sResult<()> {
        let client = K8sClient::from_incluster(cluster_id)?;
        self.insert(cluster_id, client);
        Ok(())
    }

    async fn register_aws(
        &self,
        cluster_id: &str,
        credentials: &AwsCredentials,
        config: &RestConfig,
    ) -> K8sResult<()> {
        let kubeconfig = config
            .kubeconfig
            .as_deref()
            .ok_or_else(|| K8sError::InvalidKubeconfig(format!("No kubeconfig for cluster {}", cluster_id)))?;
        let client = K8sClient::from_aws(kubeconfig, config.context.as_deref(), credentials, cluster_id).await?;
        self.insert(cluster_id, client);
        Ok(())
    }

    async fn in_cluster_config(&self) -> K8sResult<RestConfig> {
        let config = kube::Config::incluster()
            .map_err(|e| K8sError::Connection(format!("Not running in a cluster: {}", e)))?;
        Ok(RestConfig::in_cluster(config.cluster_url.to_string()))
    }

    async fn remove_cluster(&self, cluster_id: &str) {
        if self.write().remove(cluster_id).is_some() {
            tracing::debug!(cluster = cluster_id, "Removed kube client");
        }
    }

    fn cluster(&self, cluster_id: &str) -> Option<Arc<dyn ClusterApi>> {
        self.read()
            .get(cluster_id)
            .map(|c| c.clone() as Arc<dyn ClusterApi>)
    }
}
