//! Values exchanged with the script runtime
//!
//! The set is closed: anything crossing the boundary is one of these six
//! shapes, converted losslessly from JSON (integers become floats).

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ScriptValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Sequence(Vec<ScriptValue>),
    Mapping(BTreeMap<String, ScriptValue>),
}

impl ScriptValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ScriptValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&ScriptValue> {
        match self {
            ScriptValue::Mapping(map) => map.get(key),
            _ => None,
        }
    }

    /// First present key among `keys`, for options accepting several spellings
    pub fn get_any(&self, keys: &[&str]) -> Option<&ScriptValue> {
        keys.iter().find_map(|k| self.get(k).filter(|v| !v.is_null()))
    }

    /// Walk a dotted path; numeric segments index sequences
    pub fn path(&self, path: &str) -> Option<&ScriptValue> {
        path.split('.')
            .filter(|s| !s.is_empty())
            .try_fold(self, |current, segment| match current {
                ScriptValue::Mapping(map) => map.get(segment),
                ScriptValue::Sequence(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
    }

    /// Short human form used in messages
    pub fn display(&self) -> String {
        match self {
            ScriptValue::Null => "nil".to_string(),
            ScriptValue::Bool(b) => b.to_string(),
            ScriptValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            ScriptValue::Number(n) => n.to_string(),
            ScriptValue::String(s) => s.clone(),
            other => serde_json::Value::from(other.clone()).to_string(),
        }
    }
}

impl From<serde_json::Value> for ScriptValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ScriptValue::Null,
            serde_json::Value::Bool(b) => ScriptValue::Bool(b),
            serde_json::Value::Number(n) => n.as_f64().map(ScriptValue::Number).unwrap_or(ScriptValue::Null),
            serde_json::Value::String(s) => ScriptValue::String(s),
            serde_json::Value::Array(items) => ScriptValue::Sequence(items.into_iter().map(Self::from).collect()),
            serde_json::Value::Object(map) => {
                ScriptValue::Mapping(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<ScriptValue> for serde_json::Value {
    fn from(value: ScriptValue) -> Self {
        match value {
            ScriptValue::Null => serde_json::Value::Null,
            ScriptValue::Bool(b) => serde_json::Value::Bool(b),
            ScriptValue::Number(n) if n.fract() == 0.0 && n.abs() <= i64::MAX as f64 => {
                serde_json::Value::from(n as i64)
            }
            ScriptValue::Number(n) => serde_json::Number::from_f64(n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ScriptValue::String(s) => serde_json::Value::String(s),
            ScriptValue::Sequence(items) => serde_json::Value::Array(items.into_iter().map(Into::into).collect()),
            ScriptValue::Mapping(map) => {
                serde_json::Value::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::String(s.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(s: String) -> Self {
        ScriptValue::String(s)
    }
}

impl From<f64> for ScriptValue {
    fn from(n: f64) -> Self {
        ScriptValue::Number(n)
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        ScriptValue::Bool(b)
    }
}
