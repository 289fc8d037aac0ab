//! The `kubectl` capability exposed to check scripts
//!
//! A handle carries a resource selector for one cluster. Selector methods
//! consume and return the handle; `gvk` starts a fresh chain. Every fallible
//! call returns a `(value, error)` pair where exactly one side is non-null.

use super::value::ScriptValue;
use crate::registry::{ClusterApi, LogOptions, ResourceQuery};
use futures::io::AsyncReadExt;
use std::sync::Arc;
use std::time::Duration;

/// `(value, Null)` on success, `(Null, message)` on failure
pub type ScriptReturn = (ScriptValue, ScriptValue);

pub fn ok(value: ScriptValue) -> ScriptReturn {
    (value, ScriptValue::Null)
}

pub fn fail(message: impl Into<String>) -> ScriptReturn {
    (ScriptValue::Null, ScriptValue::String(message.into()))
}

#[derive(Clone)]
pub struct Kubectl {
    cluster: String,
    api: Arc<dyn ClusterApi>,
    query: ResourceQuery,
}

impl std::fmt::Debug for Kubectl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kubectl")
            .field("cluster", &self.cluster)
            .field("query", &self.query)
            .finish()
    }
}

impl Kubectl {
    pub fn new(cluster: impl Into<String>, api: Arc<dyn ClusterApi>) -> Self {
        Self {
            cluster: cluster.into(),
            api,
            query: ResourceQuery::default(),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn query(&self) -> &ResourceQuery {
        &self.query
    }

    /// Fresh handle for a group/version/kind; shares nothing with `self`
    /// beyond the cluster connection.
    pub fn gvk(&self, group: &str, version: &str, kind: &str) -> Kubectl {
        Kubectl {
            cluster: self.cluster.clone(),
            api: self.api.clone(),
            query: ResourceQuery::new(group, version, kind),
        }
    }

    pub fn with_label_selector(mut self, selector: &str) -> Self {
        if !selector.is_empty() {
            self.query.label_selector = Some(selector.to_string());
        }
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        if !name.is_empty() {
            self.query.name = Some(name.to_string());
        }
        self
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        if !namespace.is_empty() {
            self.query.namespace = Some(namespace.to_string());
        }
        self
    }

    pub fn all_namespaces(mut self) -> Self {
        self.query.all_namespaces = true;
        self
    }

    /// Serve reads from cache for `seconds`. Non-positive or unrepresentable
    /// values are ignored.
    pub fn with_cache(mut self, seconds: f64) -> Self {
        if seconds > 0.0 {
            if let Ok(ttl) = Duration::try_from_secs_f64(seconds) {
                self.query.cache_ttl = Some(ttl);
            }
        }
        self
    }

    pub async fn list(&self) -> ScriptReturn {
        match self.api.list(&self.query).await {
            Ok(items) => ok(ScriptValue::Sequence(items.into_iter().map(ScriptValue::from).collect())),
            Err(e) => fail(e.to_string()),
        }
    }

    pub async fn get(&self) -> ScriptReturn {
        if self.query.name.is_none() {
            return fail("get requires a resource name");
        }
        match self.api.get(&self.query).await {
            Ok(item) => ok(ScriptValue::from(item)),
            Err(e) => fail(e.to_string()),
        }
    }

    /// Field documentation, e.g. `doc("spec.replicas")`
    pub async fn doc(&self, field: &str) -> ScriptReturn {
        match self.api.field_doc(&self.query, field).await {
            Ok(text) => ok(ScriptValue::String(text)),
            Err(e) => fail(e.to_string()),
        }
    }

    /// Container logs. `options` may carry `container`/`Container` and
    /// `tailLines`/`TailLines`. The stream is drained and closed before
    /// returning.
    pub async fn get_logs(&self, options: &ScriptValue) -> ScriptReturn {
        let log_options = LogOptions {
            container: options
                .get_any(&["container", "Container"])
                .and_then(|v| v.as_str())
                .filter(|c| !c.is_empty())
                .map(String::from),
            tail_lines: options
                .get_any(&["tailLines", "TailLines"])
                .and_then(|v| v.as_f64())
                .filter(|n| *n > 0.0)
                .map(|n| n as i64),
        };

        let mut stream = match self.api.logs(&self.query, &log_options).await {
            Ok(stream) => stream,
            Err(e) => return fail(e.to_string()),
        };

        let mut buf = Vec::new();
        let read = stream.read_to_end(&mut buf).await;
        drop(stream);

        match read {
            Ok(_) => ok(ScriptValue::String(String::from_utf8_lossy(&buf).into_owned())),
            Err(e) => fail(format!("failed to read log stream: {}", e)),
        }
    }

    pub async fn get_pod_resource_usage(&self) -> ScriptReturn {
        match self.api.pod_resource_usage(&self.query).await {
            Ok(usage) => ok(ScriptValue::from(usage)),
            Err(e) => fail(e.to_string()),
        }
    }
}
