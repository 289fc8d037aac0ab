//! Common types shared between kubepatrol-api and its consumers

pub mod inspection;

pub use inspection::*;

use serde::{Deserialize, Serialize};

/// Connection state of a registered cluster
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectStatus::Disconnected => "disconnected",
            ConnectStatus::Connecting => "connecting",
            ConnectStatus::Connected => "connected",
            ConnectStatus::Failed => "failed",
        }
    }

    /// Connecting or Connected; a connect request is ignored in these states.
    pub fn is_busy(&self) -> bool {
        matches!(self, ConnectStatus::Connecting | ConnectStatus::Connected)
    }
}

impl std::fmt::Display for ConnectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a cluster identity was discovered
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ClusterSource {
    #[serde(rename = "File")]
    File,
    #[serde(rename = "DB")]
    Db,
    #[serde(rename = "InCluster")]
    InCluster,
    #[serde(rename = "AWS")]
    Aws,
}

impl ClusterSource {
    /// Sources whose entries are owned by the kube_configs table
    pub fn is_database_backed(&self) -> bool {
        matches!(self, ClusterSource::Db | ClusterSource::Aws)
    }
}

/// Credential block for an AWS EKS cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AwsCredentials {
    pub access_key: String,
    pub secret_access_key: String,
    pub region: String,
    pub cluster_name: String,
}

impl AwsCredentials {
    /// All four fields are required
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("access_key", &self.access_key),
            ("secret_access_key", &self.secret_access_key),
            ("region", &self.region),
            ("cluster_name", &self.cluster_name),
        ]
        .iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(k, _)| *k)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "AWS credentials incomplete, missing: {}",
                missing.join(", ")
            )))
        }
    }
}

/// Row of the kube_configs table, the database source of cluster identities
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KubeConfigRow {
    pub id: i64,
    pub server: String,
    pub user: String,
    pub cluster: String,
    pub content: String,
    pub display_name: Option<String>,
    pub is_aws: bool,
    pub access_key: Option<String>,
    pub secret_access_key: Option<String>,
    pub region: Option<String>,
    pub eks_cluster_name: Option<String>,
}

impl KubeConfigRow {
    pub fn aws_credentials(&self) -> AwsCredentials {
        AwsCredentials {
            access_key: self.access_key.clone().unwrap_or_default(),
            secret_access_key: self.secret_access_key.clone().unwrap_or_default(),
            region: self.region.clone().unwrap_or_default(),
            cluster_name: self.eks_cluster_name.clone().unwrap_or_default(),
        }
    }
}

/// Common error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("System error: {0}")]
    System(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
