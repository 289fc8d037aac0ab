//! Inspection schedules, run records and check results

use serde::{Deserialize, Serialize};

/// Raw statuses a check script may report for a passing check
pub const PASS_STATUSES: &[&str] = &["正常", "pass", "ok", "success", "通过"];

/// What started an inspection run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Manual,
    Cron,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Cron => "cron",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(TriggerType::Manual),
            "cron" => Some(TriggerType::Cron),
            _ => None,
        }
    }
}

/// Inspection run status; a run never ends in a failed state, failed checks
/// are counted instead.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            _ => None,
        }
    }
}

/// Normalized outcome of a single check
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventStatus {
    #[serde(rename = "正常")]
    Normal,
    #[serde(rename = "失败")]
    Failed,
}

impl EventStatus {
    /// Collapse a free-form script status. Only the pass set maps to Normal.
    pub fn normalize(raw: &str) -> Self {
        if is_event_status_pass(raw) {
            EventStatus::Normal
        } else {
            EventStatus::Failed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Normal => "正常",
            EventStatus::Failed => "失败",
        }
    }

    pub fn parse(s: &str) -> Self {
        Self::normalize(s)
    }
}

pub fn is_event_status_pass(raw: &str) -> bool {
    PASS_STATUSES.contains(&raw)
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

/// A persisted inspection schedule
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InspectionSchedule {
    pub id: i64,
    pub name: String,
    pub description: String,
    /// Cron expression; empty means manual only
    pub cron: String,
    /// Comma-separated cluster IDs
    pub clusters: String,
    /// Comma-separated script codes
    pub script_codes: String,
    /// Comma-separated webhook receiver IDs
    pub webhooks: String,
    pub enabled: bool,
    pub last_run_time: Option<i64>,
    pub error_count: i64,
}

impl InspectionSchedule {
    pub fn cluster_list(&self) -> Vec<String> {
        split_list(&self.clusters)
    }

    pub fn script_code_list(&self) -> Vec<String> {
        split_list(&self.script_codes)
    }

    pub fn webhook_ids(&self) -> Vec<i64> {
        split_list(&self.webhooks)
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect()
    }
}

/// A check script
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InspectionScript {
    pub id: i64,
    pub code: String,
    pub name: String,
    /// Resource kind the script inspects
    pub kind: String,
    pub description: String,
    pub source: String,
}

/// One run of a schedule against one cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectionRecord {
    pub id: i64,
    pub schedule_id: i64,
    pub schedule_name: String,
    pub cluster: String,
    pub trigger: TriggerType,
    pub status: RunStatus,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub error_count: i64,
    pub summary: Option<String>,
    pub result_raw: Option<String>,
}

/// Output captured from one script within a run
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InspectionScriptResult {
    pub id: i64,
    pub record_id: i64,
    pub schedule_id: i64,
    pub cluster: String,
    pub script_name: String,
    pub start_time: i64,
    pub end_time: i64,
    pub output: String,
    pub error: Option<String>,
}

/// A single normalized check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectionCheckEvent {
    pub id: i64,
    pub record_id: i64,
    pub schedule_id: i64,
    pub cluster: String,
    pub status: EventStatus,
    pub msg: String,
    /// Opaque JSON payload supplied by the script
    pub extra: Option<String>,
    pub script_name: String,
    pub kind: String,
    pub check_desc: String,
    pub namespace: String,
    pub name: String,
}

/// Notification target
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhookReceiver {
    pub id: i64,
    pub name: String,
    /// feishu, dingtalk, wechat or anything else for generic JSON
    pub platform: String,
    pub target_url: String,
}

/// Outcome of one delivery attempt
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhookLogRecord {
    pub id: i64,
    pub receiver_id: i64,
    pub record_id: i64,
    pub status_code: Option<i64>,
    pub response_body: String,
    pub error: Option<String>,
    pub created_at: i64,
}
