//! Sandbox bridge for inspection scripts
//!
//! A [`ScriptRuntime`] executes one script source against a [`ScriptEnv`].
//! The environment is the only surface the script sees: cluster identity,
//! its own metadata, a `kubectl` handle, `print` and `check_event`.
//! Everything the script reports is buffered in the environment and read
//! back by the inspection engine once the run finishes.

pub mod kubectl;
pub mod rules;
pub mod value;

pub use kubectl::{Kubectl, ScriptReturn};
pub use rules::RuleRuntime;
pub use value::ScriptValue;

use async_trait::async_trait;
use kubepatrol_common::InspectionScript;
use std::sync::{Arc, Mutex, MutexGuard};

/// Executes script sources
#[async_trait]
pub trait ScriptRuntime: Send + Sync {
    /// Run `source` to completion. An `Err` carries the runtime's own
    /// message (syntax error, raised error) and is recorded on the result.
    async fn execute(&self, source: &str, env: ScriptEnv) -> Result<(), String>;
}

/// Identity of the running script as seen from inside it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptMeta {
    pub code: String,
    pub name: String,
    pub kind: String,
    pub description: String,
}

impl From<&InspectionScript> for ScriptMeta {
    fn from(script: &InspectionScript) -> Self {
        Self {
            code: script.code.clone(),
            name: script.name.clone(),
            kind: script.kind.clone(),
            description: script.description.clone(),
        }
    }
}

/// A `check_event` call as the script made it
#[derive(Debug, Clone, PartialEq)]
pub struct RawCheckEvent {
    pub status: String,
    pub msg: String,
    pub extra: ScriptValue,
    pub namespace: String,
    pub name: String,
}

/// Per-run environment handed to the runtime. Cheap to clone; clones share
/// the output and event buffers.
#[derive(Clone)]
pub struct ScriptEnv {
    inner: Arc<EnvInner>,
}

struct EnvInner {
    cluster: String,
    meta: ScriptMeta,
    kubectl: Kubectl,
    output: Mutex<String>,
    events: Mutex<Vec<RawCheckEvent>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptEnv {
    pub fn new(cluster: impl Into<String>, meta: ScriptMeta, kubectl: Kubectl) -> Self {
        Self {
            inner: Arc::new(EnvInner {
                cluster: cluster.into(),
                meta,
                kubectl,
                output: Mutex::new(String::new()),
                events: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.inner.cluster
    }

    pub fn meta(&self) -> &ScriptMeta {
        &self.inner.meta
    }

    /// Fresh `kubectl` handle bound to this run's cluster
    pub fn kubectl(&self) -> Kubectl {
        self.inner.kubectl.clone()
    }

    /// Append a line to the run's output
    pub fn print(&self, line: &str) {
        let mut output = lock(&self.inner.output);
        output.push_str(line);
        output.push('\n');
    }

    /// Record a check result. `namespace` and `name` are lifted from
    /// `extra` when it is a mapping carrying them.
    pub fn check_event(&self, status: &str, msg: &str, extra: ScriptValue) {
        let field = |key: &str| {
            extra
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let event = RawCheckEvent {
            status: status.to_string(),
            msg: msg.to_string(),
            namespace: field("namespace"),
            name: field("name"),
            extra,
        };
        lock(&self.inner.events).push(event);
    }

    pub fn output(&self) -> String {
        lock(&self.inner.output).clone()
    }

    pub fn events(&self) -> Vec<RawCheckEvent> {
        lock(&self.inner.events).clone()
    }
}

impl std::fmt::Debug for ScriptEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEnv")
            .field("cluster", &self.inner.cluster)
            .field("script", &self.inner.meta.code)
            .finish()
    }
}
