//! Minimal kubeconfig model
//!
//! Only the fields the registry needs are modelled; everything else in the
//! document is left untouched when the current context is rewritten.

use super::error::{K8sError, K8sResult};
use base64::Engine;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Kubeconfig {
    #[serde(rename = "current-context", default)]
    pub current_context: Option<String>,
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    #[serde(default)]
    pub users: Vec<NamedAuthInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    #[serde(default)]
    pub cluster: Option<ClusterEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterEntry {
    #[serde(default)]
    pub server: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedContext {
    pub name: String,
    #[serde(default)]
    pub context: Option<ContextEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContextEntry {
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedAuthInfo {
    pub name: String,
    #[serde(default)]
    pub user: Option<AuthInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthInfo {
    #[serde(rename = "client-certificate-data", default)]
    pub client_certificate_data: Option<String>,
}

/// One context flattened with the cluster and user it references
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextInfo {
    pub context_name: String,
    pub cluster_name: String,
    pub user_name: String,
    pub namespace: Option<String>,
    pub server: String,
}

impl Kubeconfig {
    pub fn from_slice(content: &[u8]) -> K8sResult<Self> {
        if content.iter().all(u8::is_ascii_whitespace) {
            return Err(K8sError::InvalidKubeconfig("kubeconfig is empty".to_string()));
        }

        serde_yaml::from_slice(content)
            .map_err(|e| K8sError::InvalidKubeconfig(format!("Failed to parse kubeconfig: {}", e)))
    }

    pub fn server_of(&self, cluster_name: &str) -> Option<&str> {
        self.clusters
            .iter()
            .find(|c| c.name == cluster_name)
            .and_then(|c| c.cluster.as_ref())
            .and_then(|c| c.server.as_deref())
    }

    /// Every context, in document order
    pub fn context_infos(&self) -> Vec<ContextInfo> {
        self.contexts
            .iter()
            .map(|named| {
                let entry = named.context.clone().unwrap_or_default();
                ContextInfo {
                    server: self.server_of(&entry.cluster).unwrap_or_default().to_string(),
                    context_name: named.name.clone(),
                    cluster_name: entry.cluster,
                    user_name: entry.user,
                    namespace: entry.namespace.filter(|ns| !ns.is_empty()),
                }
            })
            .collect()
    }

    /// The context named by `current-context`, falling back to the first one
    pub fn current_context_info(&self) -> Option<ContextInfo> {
        let infos = self.context_infos();
        match self.current_context.as_deref().filter(|c| !c.is_empty()) {
            Some(current) => infos.into_iter().find(|i| i.context_name == current),
            None => infos.into_iter().next(),
        }
    }

    fn client_certificate_data(&self) -> Option<&str> {
        let current = self.current_context.as_deref()?;
        let context = self.contexts.iter().find(|c| c.name == current)?.context.as_ref()?;
        self.users
            .iter()
            .find(|u| u.name == context.user)?
            .user
            .as_ref()?
            .client_certificate_data
            .as_deref()
    }
}

/// Return `raw` with `current-context` forced to `context`.
///
/// The context must exist in the document.
pub fn with_current_context(raw: &[u8], context: &str) -> K8sResult<String> {
    let parsed = Kubeconfig::from_slice(raw)?;
    if !parsed.contexts.iter().any(|c| c.name == context) {
        return Err(K8sError::InvalidKubeconfig(format!("Context '{}' not found", context)));
    }

    let mut doc: serde_yaml::Value = serde_yaml::from_slice(raw)
        .map_err(|e| K8sError::InvalidKubeconfig(format!("Failed to parse kubeconfig: {}", e)))?;
    let mapping = doc
        .as_mapping_mut()
        .ok_or_else(|| K8sError::InvalidKubeconfig("kubeconfig is not a mapping".to_string()))?;
    mapping.insert(
        serde_yaml::Value::String("current-context".to_string()),
        serde_yaml::Value::String(context.to_string()),
    );

    serde_yaml::to_string(&doc)
        .map_err(|e| K8sError::Internal(format!("Failed to serialize kubeconfig: {}", e)))
}

/// Expiry (unix seconds) of the client certificate of the current context's
/// user. Any missing field or parse failure yields 0.
pub fn client_certificate_expiry(raw: &[u8]) -> i64 {
    let Ok(config) = Kubeconfig::from_slice(raw) else {
        return 0;
    };
    let Some(data) = config.client_certificate_data() else {
        return 0;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(data.trim()) else {
        return 0;
    };

    certificate_not_after(&decoded).unwrap_or(0)
}

fn certificate_not_after(bytes: &[u8]) -> Option<i64> {
    use x509_parser::prelude::*;

    if let Ok((_, pem)) = parse_x509_pem(bytes) {
        let cert = pem.parse_x509().ok()?;
        return Some(cert.validity().not_after.timestamp());
    }

    let (_, cert) = parse_x509_certificate(bytes).ok()?;
    Some(cert.validity().not_after.timestamp())
}
