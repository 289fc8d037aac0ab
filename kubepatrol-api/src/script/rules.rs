//! Declarative rule runtime
//!
//! Script sources are YAML documents naming a resource kind and a list of
//! field checks. Every listed object is checked against every rule and one
//! check event is emitted per (object, rule) pair.
//!
//! ```yaml
//! group: apps
//! version: v1
//! kind: Deployment
//! namespace: default        # omit for all namespaces
//! labelSelector: tier=web
//! checks:
//!   - field: spec.replicas
//!     op: gte
//!     value: 2
//!     message: fewer than two replicas
//! ```

use super::{ScriptEnv, ScriptRuntime, ScriptValue};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDocument {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub label_selector: Option<String>,
    #[serde(default)]
    pub cache_seconds: Option<f64>,
    #[serde(default)]
    pub checks: Vec<FieldCheck>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldCheck {
    pub field: String,
    pub op: CheckOp,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckOp {
    Exists,
    Absent,
    Eq,
    Ne,
    Gte,
    Lte,
}

impl CheckOp {
    fn as_str(&self) -> &'static str {
        match self {
            CheckOp::Exists => "exists",
            CheckOp::Absent => "absent",
            CheckOp::Eq => "eq",
            CheckOp::Ne => "ne",
            CheckOp::Gte => "gte",
            CheckOp::Lte => "lte",
        }
    }
}

impl FieldCheck {
    /// Evaluate against one object's field value
    pub fn evaluate(&self, actual: Option<&ScriptValue>) -> Result<bool, String> {
        let expected = self.value.clone().map(ScriptValue::from);
        let present = actual.filter(|v| !v.is_null());

        let numeric = |cmp: fn(f64, f64) -> bool| -> Result<bool, String> {
            let want = expected
                .as_ref()
                .and_then(|v| v.as_f64())
                .ok_or_else(|| format!("{} on {} needs a numeric value", self.op.as_str(), self.field))?;
            Ok(present.and_then(|v| v.as_f64()).map(|got| cmp(got, want)).unwrap_or(false))
        };

        match self.op {
            CheckOp::Exists => Ok(present.is_some()),
            CheckOp::Absent => Ok(present.is_none()),
            CheckOp::Eq => Ok(present == expected.as_ref()),
            CheckOp::Ne => Ok(present != expected.as_ref()),
            CheckOp::Gte => numeric(|got, want| got >= want),
            CheckOp::Lte => numeric(|got, want| got <= want),
        }
    }
}

pub fn parse_rules(source: &str) -> Result<RuleDocument, String> {
    serde_yaml::from_str(source).map_err(|e| format!("invalid rule document: {}", e))
}

/// [`ScriptRuntime`] for rule documents
#[derive(Debug, Default, Clone)]
pub struct RuleRuntime;

impl RuleRuntime {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ScriptRuntime for RuleRuntime {
    async fn execute(&self, source: &str, env: ScriptEnv) -> Result<(), String> {
        let rules = parse_rules(source)?;

        let mut kubectl = env.kubectl().gvk(&rules.group, &rules.version, &rules.kind);
        kubectl = match rules.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => kubectl.with_namespace(ns),
            _ => kubectl.all_namespaces(),
        };
        if let Some(selector) = rules.label_selector.as_deref() {
            kubectl = kubectl.with_label_selector(selector);
        }
        if let Some(seconds) = rules.cache_seconds {
            kubectl = kubectl.with_cache(seconds);
        }

        let (items, err) = kubectl.list().await;
        if let Some(message) = err.as_str() {
            return Err(format!("list {} failed: {}", rules.kind, message));
        }
        let items = match items {
            ScriptValue::Sequence(items) => items,
            _ => Vec::new(),
        };

        env.print(&format!(
            "{}: checking {} {} object(s) against {} rule(s)",
            env.meta().code,
            items.len(),
            rules.kind,
            rules.checks.len()
        ));

        for item in &items {
            let namespace = item
                .path("metadata.namespace")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let name = item
                .path("metadata.name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            for check in &rules.checks {
                let actual = item.path(&check.field);
                let passed = check.evaluate(actual)?;
                let msg = if passed {
                    format!("{}/{} {} {}", namespace, name, check.field, check.op.as_str())
                } else {
                    check.message.clone().unwrap_or_else(|| {
                        format!(
                            "{}/{} {} = {} fails {}",
                            namespace,
                            name,
                            check.field,
                            actual.map(|v| v.display()).unwrap_or_else(|| "nil".to_string()),
                            check.op.as_str()
                        )
                    })
                };

                let extra = ScriptValue::Mapping(
                    [
                        ("namespace".to_string(), ScriptValue::from(namespace.as_str())),
                        ("name".to_string(), ScriptValue::from(name.as_str())),
                        ("field".to_string(), ScriptValue::from(check.field.as_str())),
                        ("actual".to_string(), actual.cloned().unwrap_or_default()),
                    ]
                    .into_iter()
                    .collect(),
                );
                env.check_event(if passed { "pass" } else { "fail" }, &msg, extra);
            }
        }

        debug!(script = %env.meta().code, cluster = %env.cluster(), "Rule document evaluated");
        Ok(())
    }
}
