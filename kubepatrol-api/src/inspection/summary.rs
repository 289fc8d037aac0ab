//! Run summaries and per-schedule statistics

use crate::db::{self, records::RecordFilter, Database};
use kubepatrol_common::{EventStatus, InspectionCheckEvent, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

/// Failed checks listed individually; the rest are only counted
pub const MAX_LISTED_FAILURES: usize = 50;

/// Pass/fail counts for one resource kind
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct KindCount {
    pub kind: String,
    pub normal_count: usize,
    pub error_count: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FailedCheck {
    pub script_name: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub msg: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ScriptFailure {
    pub script_name: String,
    pub error: String,
}

/// Everything worth reporting about one run
#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    pub record_id: i64,
    pub schedule_id: i64,
    pub schedule_name: String,
    pub cluster: String,
    pub trigger: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub total_checks: usize,
    pub error_count: usize,
    pub kinds: Vec<KindCount>,
    pub failed: Vec<FailedCheck>,
    pub script_errors: Vec<ScriptFailure>,
}

fn kind_counts(events: &[&InspectionCheckEvent]) -> Vec<KindCount> {
    let mut kinds: BTreeMap<&str, KindCount> = BTreeMap::new();
    for event in events {
        let entry = kinds.entry(event.kind.as_str()).or_insert_with(|| KindCount {
            kind: event.kind.clone(),
            ..Default::default()
        });
        match event.status {
            EventStatus::Normal => entry.normal_count += 1,
            EventStatus::Failed => entry.error_count += 1,
        }
    }
    kinds.into_values().collect()
}

pub async fn build_summary(db: &Database, record_id: i64) -> Result<RecordSummary> {
    let record = db::records::get(db.pool(), record_id).await?;
    let events = db::records::list_events(db.pool(), record_id).await?;
    let results = db::records::list_script_results(db.pool(), record_id).await?;

    let all: Vec<&InspectionCheckEvent> = events.iter().collect();
    let error_count = events.iter().filter(|e| e.status == EventStatus::Failed).count();
    let failed: Vec<FailedCheck> = events
        .iter()
        .filter(|e| e.status == EventStatus::Failed)
        .take(MAX_LISTED_FAILURES)
        .map(|e| FailedCheck {
            script_name: e.script_name.clone(),
            kind: e.kind.clone(),
            namespace: e.namespace.clone(),
            name: e.name.clone(),
            msg: e.msg.clone(),
        })
        .collect();

    Ok(RecordSummary {
        record_id: record.id,
        schedule_id: record.schedule_id,
        schedule_name: record.schedule_name,
        cluster: record.cluster,
        trigger: record.trigger.as_str().to_string(),
        start_time: record.start_time,
        end_time: record.end_time,
        total_checks: events.len(),
        error_count,
        kinds: kind_counts(&all),
        failed,
        script_errors: results
            .into_iter()
            .filter_map(|r| {
                r.error.map(|error| ScriptFailure {
                    script_name: r.script_name,
                    error,
                })
            })
            .collect(),
    })
}

/// Plain-text rendering used for the stored summary and webhook bodies
pub fn render_text(summary: &RecordSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Inspection [{}] on cluster {} ({})",
        summary.schedule_name, summary.cluster, summary.trigger
    );
    let _ = writeln!(
        out,
        "Checks: {}, failed: {}",
        summary.total_checks, summary.error_count
    );

    for kind in &summary.kinds {
        let _ = writeln!(
            out,
            "  {}: {} normal, {} failed",
            kind.kind, kind.normal_count, kind.error_count
        );
    }

    if !summary.failed.is_empty() {
        let _ = writeln!(out, "Failed checks:");
        for check in &summary.failed {
            let target = match (check.namespace.is_empty(), check.name.is_empty()) {
                (_, true) => String::new(),
                (true, false) => format!(" {}", check.name),
                (false, false) => format!(" {}/{}", check.namespace, check.name),
            };
            let _ = writeln!(out, "  - [{}]{} {}", check.kind, target, check.msg);
        }
        let unlisted = summary.error_count.saturating_sub(summary.failed.len());
        if unlisted > 0 {
            let _ = writeln!(out, "  ... and {} more", unlisted);
        }
    }

    for failure in &summary.script_errors {
        let _ = writeln!(out, "Script {} failed: {}", failure.script_name, failure.error);
    }

    if summary.total_checks == 0 && summary.script_errors.is_empty() {
        let _ = writeln!(out, "No checks reported");
    }

    out.trim_end().to_string()
}

/// Build, render and store the summary of a run. Returns the text.
pub async fn generate(db: &Database, record_id: i64) -> Result<String> {
    let summary = build_summary(db, record_id).await?;
    let text = render_text(&summary);
    let raw = serde_json::to_string(&summary).unwrap_or_else(|_| "{}".to_string());
    db::records::save_summary(db.pool(), record_id, &text, &raw).await?;
    Ok(text)
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct KindStats {
    pub kind: String,
    pub count: usize,
    pub error_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ClusterStats {
    pub cluster: String,
    pub run_count: usize,
    pub kinds: Vec<KindStats>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LatestRun {
    pub record_id: i64,
    pub schedule_id: i64,
    pub run_time: i64,
    pub kinds: Vec<KindCount>,
}

/// Aggregate over the records a filter selects
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ScheduleSummary {
    pub total_clusters: usize,
    pub total_runs: usize,
    /// Distinct schedules among the records; only set when the filter does
    /// not pin a schedule
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_schedules: Option<usize>,
    pub clusters: Vec<ClusterStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_run: Option<LatestRun>,
}

pub async fn summary_by_schedule(db: &Database, filter: &RecordFilter) -> Result<ScheduleSummary> {
    let records = db::records::list(db.pool(), filter).await?;
    let record_ids: Vec<i64> = records.iter().map(|r| r.id).collect();
    let events = db::records::list_events_for(db.pool(), &record_ids).await?;

    let mut clusters: BTreeMap<String, (usize, BTreeMap<String, KindStats>)> = BTreeMap::new();
    for record in &records {
        clusters.entry(record.cluster.clone()).or_default().0 += 1;
    }
    for event in &events {
        let (_, kinds) = clusters.entry(event.cluster.clone()).or_default();
        let stats = kinds.entry(event.kind.clone()).or_insert_with(|| KindStats {
            kind: event.kind.clone(),
            ..Default::default()
        });
        stats.count += 1;
        if event.status == EventStatus::Failed {
            stats.error_count += 1;
        }
    }

    let total_schedules = filter.schedule_id.is_none().then(|| {
        records
            .iter()
            .map(|r| r.schedule_id)
            .collect::<BTreeSet<_>>()
            .len()
    });

    // Records come back newest first
    let latest_run = records.first().map(|latest| {
        let latest_events: Vec<&InspectionCheckEvent> =
            events.iter().filter(|e| e.record_id == latest.id).collect();
        LatestRun {
            record_id: latest.id,
            schedule_id: latest.schedule_id,
            run_time: latest.start_time,
            kinds: kind_counts(&latest_events),
        }
    });

    Ok(ScheduleSummary {
        total_clusters: records.iter().map(|r| r.cluster.as_str()).collect::<BTreeSet<_>>().len(),
        total_runs: records.len(),
        total_schedules,
        clusters: clusters
            .into_iter()
            .map(|(cluster, (run_count, kinds))| ClusterStats {
                cluster,
                run_count,
                kinds: kinds.into_values().collect(),
            })
            .collect(),
        latest_run,
    })
}
