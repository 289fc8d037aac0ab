//! Pod resource usage from metrics-server

use crate::kubernetes::client::K8sClient;
use crate::registry::{K8sError, K8sResult};
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use serde_json::{json, Value};

async fn get_json(client: &K8sClient, uri: String) -> K8sResult<Value> {
    let request = http::Request::builder()
        .method(http::Method::GET)
        .uri(uri)
        .body(vec![])
        .map_err(|e| K8sError::Internal(e.to_string()))?;

    let response: Value = client.inner().request(request).await?;
    Ok(response)
}

/// Requests, limits and live usage for every container of a pod.
///
/// Usage is empty when metrics-server has no sample for the pod.
pub async fn get_pod_resource_usage(client: &K8sClient, namespace: &str, name: &str) -> K8sResult<Value> {
    let pods: Api<Pod> = Api::namespaced(client.inner().clone(), namespace);
    let pod = pods.get(name).await?;
    let pod = serde_json::to_value(&pod).map_err(|e| K8sError::Internal(e.to_string()))?;

    let metrics = match get_json(
        client,
        format!("/apis/metrics.k8s.io/v1beta1/namespaces/{}/pods/{}", namespace, name),
    )
    .await
    {
        Ok(metrics) => metrics,
        Err(e) => {
            tracing::debug!(namespace, name, "No pod metrics available: {}", e);
            Value::Null
        }
    };

    Ok(merge_usage(namespace, name, &pod, &metrics))
}

fn merge_usage(namespace: &str, name: &str, pod: &Value, metrics: &Value) -> Value {
    let usage_of = |container: &str| -> Value {
        metrics["containers"]
            .as_array()
            .and_then(|cs| cs.iter().find(|c| c["name"] == container))
            .map(|c| {
                json!({
                    "cpu": c["usage"]["cpu"].as_str().unwrap_or("0"),
                    "memory": c["usage"]["memory"].as_str().unwrap_or("0"),
                })
            })
            .unwrap_or_else(|| json!({}))
    };

    let containers: Vec<Value> = pod["spec"]["containers"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|c| {
            let container = c["name"].as_str()?.to_string();
            Some(json!({
                "name": container,
                "requests": c["resources"]["requests"].clone(),
                "limits": c["resources"]["limits"].clone(),
                "usage": usage_of(&container),
            }))
        })
        .collect();

    json!({
        "namespace": namespace,
        "name": name,
        "timestamp": metrics["timestamp"].as_str().unwrap_or(""),
        "containers": containers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_usage() {
        let pod = json!({
            "spec": {"containers": [
                {"name": "app", "resources": {"requests": {"cpu": "100m"}, "limits": {"memory": "256Mi"}}},
                {"name": "sidecar", "resources": {}}
            ]}
        });
        let metrics = json!({
            "timestamp": "2024-05-01T00:00:00Z",
            "containers": [{"name": "app", "usage": {"cpu": "12m", "memory": "80Mi"}}]
        });

        let merged = merge_usage("default", "web-0", &pod, &metrics);
        assert_eq!(merged["containers"][0]["usage"]["cpu"], "12m");
        assert_eq!(merged["containers"][0]["requests"]["cpu"], "100m");
        assert_eq!(merged["containers"][1]["usage"], json!({}));
        assert_eq!(merged["timestamp"], "2024-05-01T00:00:00Z");
    }
}
