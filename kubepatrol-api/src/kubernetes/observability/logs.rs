//! Container log retrieval

use crate::kubernetes::client::K8sClient;
use crate::registry::{K8sResult, LogOptions};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, LogParams};

fn log_params(options: &LogOptions) -> LogParams {
    LogParams {
        container: options.container.clone(),
        tail_lines: options.tail_lines,
        ..Default::default()
    }
}

/// Get logs from a container in a pod
pub async fn get_pod_logs(
    client: &K8sClient,
    namespace: &str,
    pod_name: &str,
    options: &LogOptions,
) -> K8sResult<String> {
    let pods: Api<Pod> = Api::namespaced(client.inner().clone(), namespace);
    let logs = pods.logs(pod_name, &log_params(options)).await?;
    Ok(logs)
}
