//! Common test utilities and helpers
//!
//! In-process fakes for the cluster client contract and the script runtime,
//! plus kubeconfig fixtures on disk.

#![allow(dead_code)]

use async_trait::async_trait;
use kubepatrol_api::registry::{
    ClusterApi, K8sError, K8sResult, LogOptions, LogStream, ResourceClient, ResourceQuery, RestConfig,
};
use kubepatrol_api::script::{ScriptEnv, ScriptRuntime, ScriptValue};
use kubepatrol_common::AwsCredentials;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SERVER_VERSION: &str = "v1.32.1";

/// Render a kubeconfig with one cluster, user and context per entry of
/// `contexts` (context name, server URL). The first context is current.
pub fn kubeconfig_yaml(contexts: &[(&str, &str)]) -> String {
    let mut clusters = String::new();
    let mut users = String::new();
    let mut ctxs = String::new();
    for (i, (context, server)) in contexts.iter().enumerate() {
        clusters.push_str(&format!(
            "- name: cluster-{i}\n  cluster:\n    server: {server}\n"
        ));
        users.push_str(&format!("- name: user-{i}\n  user:\n    token: token-{i}\n"));
        ctxs.push_str(&format!(
            "- name: {context}\n  context:\n    cluster: cluster-{i}\n    user: user-{i}\n"
        ));
    }
    let current = contexts.first().map(|(c, _)| *c).unwrap_or("");
    format!(
        "apiVersion: v1\nkind: Config\ncurrent-context: {current}\nclusters:\n{clusters}contexts:\n{ctxs}users:\n{users}"
    )
}

pub fn write_kubeconfig(dir: &Path, file_name: &str, contexts: &[(&str, &str)]) -> PathBuf {
    let path = dir.join(file_name);
    std::fs::write(&path, kubeconfig_yaml(contexts)).expect("write kubeconfig");
    path
}

/// Canned cluster contents; records every query it serves
#[derive(Default)]
pub struct FakeClusterApi {
    pub items: Vec<Value>,
    pub logs: String,
    pub usage: Value,
    pub fail_with: Option<String>,
    pub queries: Mutex<Vec<ResourceQuery>>,
    pub log_requests: Mutex<Vec<LogOptions>>,
}

impl FakeClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pods(names: &[&str]) -> Self {
        Self {
            items: names.iter().map(|name| pod(name, "default")).collect(),
            ..Default::default()
        }
    }

    pub fn with_logs(mut self, logs: &str) -> Self {
        self.logs = logs.to_string();
        self
    }

    pub fn with_usage(mut self, usage: Value) -> Self {
        self.usage = usage;
        self
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn last_query(&self) -> Option<ResourceQuery> {
        self.queries.lock().unwrap().last().cloned()
    }

    fn record(&self, query: &ResourceQuery) -> K8sResult<()> {
        self.queries.lock().unwrap().push(query.clone());
        match self.fail_with {
            Some(ref message) => Err(K8sError::Connection(message.clone())),
            None => Ok(()),
        }
    }
}

pub fn pod(name: &str, namespace: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": name, "namespace": namespace},
        "status": {"phase": "Running"}
    })
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn list(&self, query: &ResourceQuery) -> K8sResult<Vec<Value>> {
        self.record(query)?;
        Ok(self.items.clone())
    }

    async fn get(&self, query: &ResourceQuery) -> K8sResult<Value> {
        self.record(query)?;
        let name = query.name.clone().unwrap_or_default();
        self.items
            .iter()
            .find(|item| item["metadata"]["name"] == name.as_str())
            .cloned()
            .ok_or_else(|| K8sError::ResourceNotFound {
                kind: query.kind.clone(),
                name,
                namespace: query.namespace.clone().unwrap_or_default(),
            })
    }

    async fn patch(&self, _query: &ResourceQuery, _patch: &Value) -> K8sResult<Value> {
        Err(K8sError::Unsupported("patch".to_string()))
    }

    async fn field_doc(&self, query: &ResourceQuery, field: &str) -> K8sResult<String> {
        self.record(query)?;
        Ok(format!("{}.{}", query.kind, field))
    }

    async fn logs(&self, query: &ResourceQuery, options: &LogOptions) -> K8sResult<LogStream> {
        self.record(query)?;
        self.log_requests.lock().unwrap().push(options.clone());
        Ok(Box::pin(futures::io::Cursor::new(self.logs.clone().into_bytes())))
    }

    async fn pod_resource_usage(&self, query: &ResourceQuery) -> K8sResult<Value> {
        self.record(query)?;
        Ok(self.usage.clone())
    }
}

/// Resource client whose API servers answer unless their host is marked
/// unreachable. Every registered cluster shares one [`FakeClusterApi`].
pub struct FakeResourceClient {
    api: Arc<FakeClusterApi>,
    unreachable: Mutex<HashSet<String>>,
    registered: Mutex<HashMap<String, RestConfig>>,
    in_cluster_host: Option<String>,
    pub probes: AtomicUsize,
}

impl FakeResourceClient {
    pub fn new(api: FakeClusterApi) -> Self {
        Self {
            api: Arc::new(api),
            unreachable: Mutex::new(HashSet::new()),
            registered: Mutex::new(HashMap::new()),
            in_cluster_host: None,
            probes: AtomicUsize::new(0),
        }
    }

    pub fn with_in_cluster(mut self, host: &str) -> Self {
        self.in_cluster_host = Some(host.to_string());
        self
    }

    pub fn api(&self) -> Arc<FakeClusterApi> {
        self.api.clone()
    }

    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut hosts = self.unreachable.lock().unwrap();
        if unreachable {
            hosts.insert(host.to_string());
        } else {
            hosts.remove(host);
        }
    }

    pub fn registered_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.registered.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn registered_config(&self, id: &str) -> Option<RestConfig> {
        self.registered.lock().unwrap().get(id).cloned()
    }

    fn register(&self, id: &str, config: &RestConfig) {
        self.registered.lock().unwrap().insert(id.to_string(), config.clone());
    }
}

#[async_trait]
impl ResourceClient for FakeResourceClient {
    async fn server_version(&self, config: &RestConfig) -> K8sResult<String> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.lock().unwrap().contains(&config.host) {
            return Err(K8sError::Connection(format!("{} is unreachable", config.host)));
        }
        Ok(SERVER_VERSION.to_string())
    }

    async fn register_by_config(&self, cluster_id: &str, config: &RestConfig) -> K8sResult<()> {
        self.register(cluster_id, config);
        Ok(())
    }

    async fn register_in_cluster(&self, cluster_id: &str, config: &RestConfig) -> K8sResult<()> {
        self.register(cluster_id, config);
        Ok(())
    }

    async fn register_aws(
        &self,
        cluster_id: &str,
        _credentials: &AwsCredentials,
        config: &RestConfig,
    ) -> K8sResult<()> {
        self.register(cluster_id, config);
        Ok(())
    }

    async fn in_cluster_config(&self) -> K8sResult<RestConfig> {
        match self.in_cluster_host {
            Some(ref host) => Ok(RestConfig::in_cluster(host.clone())),
            None => Err(K8sError::Connection("not running in a cluster".to_string())),
        }
    }

    async fn remove_cluster(&self, cluster_id: &str) {
        self.registered.lock().unwrap().remove(cluster_id);
    }

    fn cluster(&self, cluster_id: &str) -> Option<Arc<dyn ClusterApi>> {
        if self.registered.lock().unwrap().contains_key(cluster_id) {
            Some(self.api.clone() as Arc<dyn ClusterApi>)
        } else {
            None
        }
    }
}

/// Script runtime driven by a tiny command language in the script source:
///
/// - `events:pass,fail,ok` emits one check event per status
/// - `error:<message>` fails the script
/// - `sleep:<millis>` sleeps before returning
/// - `list` lists through kubectl and prints the item count
#[derive(Default)]
pub struct FakeRuntime {
    pub executions: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScriptRuntime for FakeRuntime {
    async fn execute(&self, source: &str, env: ScriptEnv) -> Result<(), String> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let (command, arg) = source.split_once(':').unwrap_or((source, ""));
        match command.trim() {
            "events" => {
                for (i, status) in arg.split(',').map(str::trim).enumerate() {
                    let extra = ScriptValue::from(json!({
                        "namespace": "default",
                        "name": format!("pod-{}", i),
                    }));
                    env.check_event(status, &format!("check {}", i), extra);
                }
                env.print(&format!("{} checks", arg.split(',').count()));
                Ok(())
            }
            "error" => Err(arg.to_string()),
            "panic" => panic!("{}", arg),
            "sleep" => {
                let millis = arg.trim().parse::<u64>().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(())
            }
            "list" => {
                let (items, err) = env.kubectl().gvk("", "v1", "Pod").list().await;
                if !err.is_null() {
                    return Err(err.display());
                }
                let count = match items {
                    ScriptValue::Sequence(items) => items.len(),
                    _ => 0,
                };
                env.print(&format!("{} items", count));
                Ok(())
            }
            other => Err(format!("unknown command {}", other)),
        }
    }
}
