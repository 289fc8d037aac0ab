//! Dynamic resource access for one connected cluster

use super::client::K8sClient;
use super::explain;
use super::observability::{logs, metrics};
use crate::registry::{ClusterApi, K8sError, K8sResult, LogOptions, LogStream, ResourceQuery};
use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::{self, Scope};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const DEFAULT_NAMESPACE: &str = "default";

struct CacheEntry {
    expires: Instant,
    value: Value,
}

/// Responses keyed by query, each kept for the TTL its query asked for
#[derive(Default)]
struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    async fn get(&self, key: &str, ttl: Option<Duration>) -> Option<Value> {
        ttl?;
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|entry| entry.expires > Instant::now())
            .map(|entry| entry.value.clone())
    }

    /// A TTL that overflows the clock is not cached at all
    async fn store(&self, key: String, ttl: Option<Duration>, value: &Value) {
        let Some(ttl) = ttl else {
            return;
        };
        let now = Instant::now();
        let Some(expires) = now.checked_add(ttl) else {
            return;
        };
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.expires > now);
        entries.insert(
            key,
            CacheEntry {
                expires,
                value: value.clone(),
            },
        );
    }

    async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

/// [`ClusterApi`] backed by kube-rs with a per-query TTL cache
pub struct KubeCluster {
    client: K8sClient,
    cache: ResponseCache,
}

impl KubeCluster {
    pub fn new(client: K8sClient) -> Self {
        Self {
            client,
            cache: ResponseCache::default(),
        }
    }

    pub fn client(&self) -> &K8sClient {
        &self.client
    }

    async fn dynamic_api(&self, query: &ResourceQuery) -> K8sResult<Api<DynamicObject>> {
        let gvk = GroupVersionKind::gvk(&query.group, &query.version, &query.kind);
        let (resource, capabilities) = discovery::pinned_kind(self.client.inner(), &gvk).await?;

        let client = self.client.inner().clone();
        let api = if capabilities.scope == Scope::Namespaced && !query.all_namespaces {
            let namespace = query.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
            Api::namespaced_with(client, namespace, &resource)
        } else {
            Api::all_with(client, &resource)
        };
        Ok(api)
    }

    fn required_name<'a>(query: &'a ResourceQuery) -> K8sResult<&'a str> {
        query
            .name
            .as_deref()
            .ok_or_else(|| K8sError::Internal(format!("{} name is required", query.kind)))
    }

    fn not_found(query: &ResourceQuery, err: kube::Error) -> K8sError {
        match err {
            kube::Error::Api(ref response) if response.code == 404 => K8sError::ResourceNotFound {
                kind: query.kind.clone(),
                name: query.name.clone().unwrap_or_default(),
                namespace: query.namespace.clone().unwrap_or_default(),
            },
            other => K8sError::KubeError(other),
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> K8sResult<Value> {
    serde_json::to_value(value).map_err(|e| K8sError::Internal(format!("Failed to encode object: {}", e)))
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn list(&self, query: &ResourceQuery) -> K8sResult<Vec<Value>> {
        let key = query.cache_key("list");
        if let Some(Value::Array(items)) = self.cache.get(&key, query.cache_ttl).await {
            return Ok(items);
        }

        let api = self.dynamic_api(query).await?;
        let mut params = ListParams::default();
        if let Some(selector) = query.label_selector.as_deref() {
            params = params.labels(selector);
        }

        let list = api.list(&params).await?;
        let items = list.items.iter().map(to_json).collect::<K8sResult<Vec<_>>>()?;

        self.cache.store(key, query.cache_ttl, &Value::Array(items.clone())).await;
        Ok(items)
    }

    async fn get(&self, query: &ResourceQuery) -> K8sResult<Value> {
        let key = query.cache_key("get");
        if let Some(value) = self.cache.get(&key, query.cache_ttl).await {
            return Ok(value);
        }

        let name = Self::required_name(query)?;
        let api = self.dynamic_api(query).await?;
        let object = api.get(name).await.map_err(|e| Self::not_found(query, e))?;
        let value = to_json(&object)?;

        self.cache.store(key, query.cache_ttl, &value).await;
        Ok(value)
    }

    async fn patch(&self, query: &ResourceQuery, patch: &Value) -> K8sResult<Value> {
        let name = Self::required_name(query)?;
        let api = self.dynamic_api(query).await?;
        let object = api
            .patch(name, &PatchParams::default(), &Patch::Strategic(patch.clone()))
            .await
            .map_err(|e| Self::not_found(query, e))?;

        // Anything cached may now be stale
        self.cache.clear().await;
        to_json(&object)
    }

    async fn field_doc(&self, query: &ResourceQuery, field: &str) -> K8sResult<String> {
        let key = query.cache_key(&format!("doc:{}", field));
        if let Some(Value::String(text)) = self.cache.get(&key, query.cache_ttl).await {
            return Ok(text);
        }

        let text = explain::explain(&self.client, query, field).await?;
        self.cache.store(key, query.cache_ttl, &Value::String(text.clone())).await;
        Ok(text)
    }

    async fn logs(&self, query: &ResourceQuery, options: &LogOptions) -> K8sResult<LogStream> {
        let name = Self::required_name(query)?;
        let namespace = query.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
        let text = logs::get_pod_logs(&self.client, namespace, name, options)
            .await
            .map_err(|e| match e {
                K8sError::KubeError(err) => Self::not_found(query, err),
                other => other,
            })?;
        Ok(Box::pin(futures::io::Cursor::new(text.into_bytes())))
    }

    async fn pod_resource_usage(&self, query: &ResourceQuery) -> K8sResult<Value> {
        let name = Self::required_name(query)?;
        let namespace = query.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE);
        metrics::get_pod_resource_usage(&self.client, namespace, name).await
    }
}
