//! Kubernetes client construction
//!
//! Builds kube-rs clients from the [`RestConfig`] the registry derives.

use crate::registry::{K8sError, K8sResult, RestConfig};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use kubepatrol_common::AwsCredentials;
use std::collections::HashMap;

/// Wrapper around kube-rs Client with cluster context
#[derive(Clone)]
pub struct K8sClient {
    inner: Client,
    cluster_id: String,
    api_server: String,
}

impl K8sClient {
    /// Create client from kubeconfig YAML pinned to a context
    pub async fn from_kubeconfig(kubeconfig_yaml: &str, context: Option<&str>, cluster_id: &str) -> K8sResult<Self> {
        let kubeconfig = Kubeconfig::from_yaml(kubeconfig_yaml)
            .map_err(|e| K8sError::InvalidKubeconfig(format!("Failed to parse kubeconfig: {}", e)))?;
        Self::from_parsed(kubeconfig, context, cluster_id).await
    }

    async fn from_parsed(kubeconfig: Kubeconfig, context: Option<&str>, cluster_id: &str) -> K8sResult<Self> {
        let config = Config::from_custom_kubeconfig(
            kubeconfig,
            &KubeConfigOptions {
                context: context.map(String::from),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| K8sError::InvalidKubeconfig(format!("Failed to create config: {}", e)))?;

        Self::from_config(config, cluster_id)
    }

    /// Create client from in-cluster configuration (for running inside K8s)
    pub fn from_incluster(cluster_id: &str) -> K8sResult<Self> {
        let config = Config::incluster()
            .map_err(|e| K8sError::Connection(format!("Failed to get in-cluster config: {}", e)))?;
        Self::from_config(config, cluster_id)
    }

    /// Client for an EKS kubeconfig whose exec plugin needs AWS credentials
    pub async fn from_aws(
        kubeconfig_yaml: &str,
        context: Option<&str>,
        credentials: &AwsCredentials,
        cluster_id: &str,
    ) -> K8sResult<Self> {
        let mut kubeconfig = Kubeconfig::from_yaml(kubeconfig_yaml)
            .map_err(|e| K8sError::InvalidKubeconfig(format!("Failed to parse kubeconfig: {}", e)))?;
        inject_aws_env(&mut kubeconfig, credentials);
        Self::from_parsed(kubeconfig, context, cluster_id).await
    }

    /// Client for any [`RestConfig`]
    pub async fn from_rest_config(config: &RestConfig, cluster_id: &str) -> K8sResult<Self> {
        if config.in_cluster {
            return Self::from_incluster(cluster_id);
        }
        let kubeconfig = config
            .kubeconfig
            .as_deref()
            .ok_or_else(|| K8sError::InvalidKubeconfig(format!("No kubeconfig for cluster {}", cluster_id)))?;
        Self::from_kubeconfig(kubeconfig, config.context.as_deref(), cluster_id).await
    }

    fn from_config(config: Config, cluster_id: &str) -> K8sResult<Self> {
        let api_server = config.cluster_url.to_string();
        let client = Client::try_from(config)
            .map_err(|e| K8sError::Connection(format!("Failed to create client: {}", e)))?;

        Ok(Self {
            inner: client,
            cluster_id: cluster_id.to_string(),
            api_server,
        })
    }

    /// Get the inner kube-rs Client
    pub fn inner(&self) -> &Client {
        &self.inner
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn api_server(&self) -> &str {
        &self.api_server
    }

    /// API server git version, e.g. `v1.30.2`
    pub async fn git_version(&self) -> K8sResult<String> {
        let version = self.inner.apiserver_version().await?;
        Ok(version.git_version)
    }
}

impl std::fmt::Debug for K8sClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("K8sClient")
            .field("cluster_id", &self.cluster_id)
            .field("api_server", &self.api_server)
            .finish()
    }
}

/// Add AWS credentials to every exec-based user so `aws eks get-token` runs
/// with them
fn inject_aws_env(kubeconfig: &mut Kubeconfig, credentials: &AwsCredentials) {
    let vars = [
        ("AWS_ACCESS_KEY_ID", credentials.access_key.as_str()),
        ("AWS_SECRET_ACCESS_KEY", credentials.secret_access_key.as_str()),
        ("AWS_REGION", credentials.region.as_str()),
        ("AWS_DEFAULT_REGION", credentials.region.as_str()),
    ];

    for named in kubeconfig.auth_infos.iter_mut() {
        let Some(exec) = named.auth_info.as_mut().and_then(|a| a.exec.as_mut()) else {
            continue;
        };
        let env = exec.env.get_or_insert_with(Vec::new);
        env.retain(|entry| {
            entry
                .get("name")
                .map(|name| !vars.iter().any(|(k, _)| *k == name.as_str()))
                .unwrap_or(true)
        });
        for (name, value) in vars {
            env.push(HashMap::from([
                ("name".to_string(), name.to_string()),
                ("value".to_string(), value.to_string()),
            ]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EKS: &str = r#"
apiVersion: v1
kind: Config
current-context: eks
clusters:
- name: eks
  cluster:
    server: https://eks.example.com
contexts:
- name: eks
  context:
    cluster: eks
    user: eks
users:
- name: eks
  user:
    exec:
      apiVersion: client.authentication.k8s.io/v1beta1
      command: aws
      args: ["eks", "get-token", "--cluster-name", "prod"]
      env:
      - name: AWS_REGION
        value: us-west-2
"#;

    #[test]
    fn test_inject_aws_env_replaces_existing() {
        let mut kubeconfig = Kubeconfig::from_yaml(EKS).unwrap();
        let credentials = AwsCredentials {
            access_key: "AKIA".to_string(),
            secret_access_key: "secret".to_string(),
            region: "eu-central-1".to_string(),
            cluster_name: "prod".to_string(),
        };

        inject_aws_env(&mut kubeconfig, &credentials);

        let env = kubeconfig.auth_infos[0]
            .auth_info
            .as_ref()
            .and_then(|a| a.exec.as_ref())
            .and_then(|e| e.env.clone())
            .unwrap();
        let regions: Vec<&String> = env
            .iter()
            .filter(|e| e.get("name").map(String::as_str) == Some("AWS_REGION"))
            .filter_map(|e| e.get("value"))
            .collect();
        assert_eq!(regions, vec!["eu-central-1"]);
        assert_eq!(env.len(), 4);
    }
}
