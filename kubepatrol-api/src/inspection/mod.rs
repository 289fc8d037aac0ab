//! Inspection engine
//!
//! Runs a schedule's check scripts against one cluster, persists what they
//! report and wires enabled schedules into the cron scheduler. A run moves
//! Running -> Success; script failures are recorded on the run rather than
//! failing it.

pub mod summary;

use crate::config::InspectionSettings;
use crate::db::{self, batch, Database};
use crate::registry::{ClusterApi, ClusterRegistry};
use crate::scheduler::{job_fn, CancellationToken, Scheduler};
use crate::script::{Kubectl, RawCheckEvent, ScriptEnv, ScriptMeta, ScriptRuntime, ScriptValue};
use crate::webhooks::WebhookDispatcher;
use chrono::Utc;
use futures::FutureExt;
use kubepatrol_common::{
    EventStatus, InspectionCheckEvent, InspectionRecord, InspectionSchedule, InspectionScript,
    InspectionScriptResult, RunStatus, TriggerType,
};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum InspectionError {
    #[error("Cluster {0} is not connected and could not be connected")]
    ClusterUnavailable(String),

    #[error("Inspection schedule {0} not found")]
    ScheduleNotFound(i64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Scheduling error: {0}")]
    Schedule(String),
}

impl From<kubepatrol_common::Error> for InspectionError {
    fn from(err: kubepatrol_common::Error) -> Self {
        InspectionError::Persistence(err.to_string())
    }
}

pub type InspectionResult<T> = std::result::Result<T, InspectionError>;

/// Outcome of one script inside a run
#[derive(Debug, Clone)]
pub struct ScriptRun {
    pub script: ScriptMeta,
    pub start_time: i64,
    pub end_time: i64,
    pub output: String,
    pub error: Option<String>,
    pub events: Vec<RawCheckEvent>,
}

pub struct InspectionEngine {
    db: Database,
    registry: Arc<ClusterRegistry>,
    scheduler: Arc<Scheduler>,
    runtime: Arc<dyn ScriptRuntime>,
    webhooks: Option<Arc<WebhookDispatcher>>,
    batch_size: usize,
    script_timeout: Duration,
}

impl InspectionEngine {
    pub fn new(
        db: Database,
        registry: Arc<ClusterRegistry>,
        scheduler: Arc<Scheduler>,
        runtime: Arc<dyn ScriptRuntime>,
    ) -> Self {
        let defaults = InspectionSettings::default();
        Self {
            db,
            registry,
            scheduler,
            runtime,
            webhooks: None,
            batch_size: defaults.batch_size,
            script_timeout: Duration::from_secs(defaults.script_timeout_secs),
        }
    }

    pub fn with_settings(mut self, settings: &InspectionSettings) -> Self {
        self.batch_size = settings.batch_size.max(1);
        self.script_timeout = Duration::from_secs(settings.script_timeout_secs.max(1));
        self
    }

    pub fn with_script_timeout(mut self, timeout: Duration) -> Self {
        self.script_timeout = timeout;
        self
    }

    pub fn with_webhooks(mut self, dispatcher: Arc<WebhookDispatcher>) -> Self {
        self.webhooks = Some(dispatcher);
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Run every script of `schedule_id` against `cluster` and persist the
    /// outcome. Returns the finished record.
    pub async fn run_by_cluster(
        &self,
        cancel: &CancellationToken,
        schedule_id: i64,
        cluster: &str,
        trigger: TriggerType,
    ) -> InspectionResult<InspectionRecord> {
        let api = self.resolve_cluster(cluster).await?;

        let schedule = self.load_schedule(schedule_id).await?;
        info!(schedule_id, cluster, trigger = trigger.as_str(), "Starting inspection");

        let mut record = InspectionRecord {
            id: 0,
            schedule_id,
            schedule_name: schedule.name.clone(),
            cluster: cluster.to_string(),
            trigger,
            status: RunStatus::Running,
            start_time: Utc::now().timestamp(),
            end_time: None,
            error_count: 0,
            summary: None,
            result_raw: None,
        };
        record.id = db::records::create(self.db.pool(), &record).await?;

        let scripts = db::scripts::get_by_codes(self.db.pool(), &schedule.script_code_list()).await?;
        let runs = self.execute_scripts(cancel, cluster, &api, &scripts).await;

        let (events, results, error_count) = Self::collect(&record, &runs);

        if let Err(e) = batch::batch_save(self.db.pool(), &events, self.batch_size).await {
            error!(record_id = record.id, "Failed to save check events: {}", e);
        }
        if let Err(e) = batch::batch_save(self.db.pool(), &results, self.batch_size).await {
            error!(record_id = record.id, "Failed to save script results: {}", e);
        }

        let end_time = Utc::now().timestamp();
        if let Err(e) = db::records::finish(self.db.pool(), record.id, end_time, error_count).await {
            error!(record_id = record.id, "Failed to finalise inspection record: {}", e);
        }
        record.status = RunStatus::Success;
        record.end_time = Some(end_time);
        record.error_count = error_count;

        if let Err(e) = db::schedules::update_run_stats(self.db.pool(), schedule_id, end_time, error_count).await {
            warn!(schedule_id, "Failed to update schedule run stats: {}", e);
        }

        info!(
            record_id = record.id,
            cluster,
            scripts = runs.len(),
            error_count,
            "Inspection finished"
        );

        match summary::generate(&self.db, record.id).await {
            Ok(text) => record.summary = Some(text),
            Err(e) => warn!(record_id = record.id, "Failed to generate summary: {}", e),
        }

        if let Some(dispatcher) = self.webhooks.clone() {
            let record_id = record.id;
            tokio::spawn(async move {
                if let Err(e) = dispatcher.push_by_record_id(record_id).await {
                    warn!(record_id, "Webhook push failed: {}", e);
                }
            });
        }

        Ok(record)
    }

    /// Manual trigger; errors go back to the caller
    pub async fn trigger_manual(&self, schedule_id: i64, cluster: &str) -> InspectionResult<InspectionRecord> {
        let cluster = cluster.trim();
        if cluster.is_empty() {
            return Err(InspectionError::InvalidArgument("cluster must not be empty".to_string()));
        }
        self.run_by_cluster(&CancellationToken::new(), schedule_id, cluster, TriggerType::Manual)
            .await
    }

    /// Walk `clusters` in order. Stops at the first cancellation check that
    /// fails; a failing cluster is logged and skipped. Returns the number of
    /// completed runs.
    pub async fn run_clusters(
        &self,
        cancel: &CancellationToken,
        schedule_id: i64,
        clusters: &[String],
        trigger: TriggerType,
    ) -> usize {
        let mut completed = 0;
        for cluster in clusters {
            if cancel.is_cancelled() {
                info!(schedule_id, "Inspection cancelled, skipping remaining clusters");
                break;
            }
            let cluster = cluster.trim();
            if cluster.is_empty() {
                continue;
            }
            let run = AssertUnwindSafe(self.run_by_cluster(cancel, schedule_id, cluster, trigger));
            match run.catch_unwind().await {
                Ok(Ok(_)) => completed += 1,
                Ok(Err(e)) => warn!(schedule_id, cluster, "Inspection failed: {}", e),
                Err(payload) => error!(
                    schedule_id,
                    cluster,
                    "Inspection panicked: {}",
                    panic_message(payload.as_ref())
                ),
            }
        }
        completed
    }

    /// Install the cron job for an enabled schedule. Returns `false` when
    /// nothing was installed (disabled or no cron expression).
    pub async fn add(self: &Arc<Self>, schedule_id: i64) -> InspectionResult<bool> {
        let schedule = self.load_schedule(schedule_id).await?;
        if !schedule.enabled {
            debug!(schedule_id, "Schedule disabled, not installing");
            return Ok(false);
        }
        let cron = schedule.cron.trim();
        if cron.is_empty() {
            debug!(schedule_id, "Schedule has no cron expression");
            return Ok(false);
        }

        let clusters = schedule.cluster_list();
        let name = schedule.name.clone();
        let engine: Weak<Self> = Arc::downgrade(self);

        let job = job_fn(move |cancel| {
            let engine = engine.clone();
            let clusters = clusters.clone();
            let name = name.clone();
            async move {
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                info!(schedule_id, schedule = %name, "Scheduled inspection starting");
                let completed = engine
                    .run_clusters(&cancel, schedule_id, &clusters, TriggerType::Cron)
                    .await;
                info!(schedule_id, schedule = %name, completed, "Scheduled inspection done");
            }
        });

        self.scheduler
            .add(&schedule_key(schedule_id), cron, job)
            .await
            .map_err(|e| InspectionError::Schedule(e.to_string()))?;
        Ok(true)
    }

    /// Reinstall after an edit; a schedule that is now disabled or has no
    /// cron expression is uninstalled
    pub async fn update(self: &Arc<Self>, schedule_id: i64) -> InspectionResult<bool> {
        let installed = self.add(schedule_id).await?;
        if !installed {
            self.remove(schedule_id).await;
        }
        Ok(installed)
    }

    pub async fn remove(&self, schedule_id: i64) {
        self.scheduler.remove(&schedule_key(schedule_id)).await;
    }

    /// Install every enabled schedule. Safe to call repeatedly.
    pub async fn add_cron_jobs_from_db(self: &Arc<Self>) -> InspectionResult<usize> {
        let schedules = db::schedules::list_enabled(self.db.pool()).await?;
        let mut installed = 0;
        for schedule in &schedules {
            match self.add(schedule.id).await {
                Ok(true) => installed += 1,
                Ok(false) => {}
                Err(e) => error!(schedule_id = schedule.id, "Failed to install schedule: {}", e),
            }
        }
        info!(installed, "Inspection schedules loaded");
        Ok(installed)
    }

    async fn resolve_cluster(&self, cluster: &str) -> InspectionResult<Arc<dyn ClusterApi>> {
        if let Some(api) = self.registry.handle(cluster) {
            return Ok(api);
        }

        debug!(cluster, "Cluster not connected, connecting for inspection");
        if let Err(e) = self.registry.connect(cluster).await {
            warn!(cluster, "On-demand connect failed: {}", e);
        }
        self.registry
            .handle(cluster)
            .ok_or_else(|| InspectionError::ClusterUnavailable(cluster.to_string()))
    }

    async fn load_schedule(&self, schedule_id: i64) -> InspectionResult<InspectionSchedule> {
        match db::schedules::get(self.db.pool(), schedule_id).await {
            Ok(schedule) => Ok(schedule),
            Err(kubepatrol_common::Error::NotFound(_)) => Err(InspectionError::ScheduleNotFound(schedule_id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn execute_scripts(
        &self,
        cancel: &CancellationToken,
        cluster: &str,
        api: &Arc<dyn ClusterApi>,
        scripts: &[InspectionScript],
    ) -> Vec<ScriptRun> {
        let mut runs = Vec::with_capacity(scripts.len());

        for script in scripts {
            if cancel.is_cancelled() {
                info!(cluster, "Inspection cancelled before script {}", script.code);
                break;
            }

            let meta = ScriptMeta::from(script);
            let env = ScriptEnv::new(cluster, meta.clone(), Kubectl::new(cluster, api.clone()));
            let start_time = Utc::now().timestamp();

            // A panicking script becomes that script's error
            let execution = AssertUnwindSafe(self.runtime.execute(&script.source, env.clone())).catch_unwind();
            let error = match tokio::time::timeout(self.script_timeout, execution).await {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(message))) => Some(message),
                Ok(Err(payload)) => Some(format!("script panicked: {}", panic_message(payload.as_ref()))),
                Err(_) => Some(format!("script timed out after {}s", self.script_timeout.as_secs())),
            };
            if let Some(ref message) = error {
                warn!(cluster, script = %script.code, "Script failed: {}", message);
            }

            runs.push(ScriptRun {
                script: meta,
                start_time,
                end_time: Utc::now().timestamp(),
                output: env.output(),
                error,
                events: env.events(),
            });
        }

        runs
    }

    /// Turn script runs into rows. Statuses are normalised; every non-pass
    /// event counts as one error.
    fn collect(
        record: &InspectionRecord,
        runs: &[ScriptRun],
    ) -> (Vec<InspectionCheckEvent>, Vec<InspectionScriptResult>, i64) {
        let mut events = Vec::new();
        let mut results = Vec::with_capacity(runs.len());
        let mut error_count = 0;

        for run in runs {
            results.push(InspectionScriptResult {
                id: 0,
                record_id: record.id,
                schedule_id: record.schedule_id,
                cluster: record.cluster.clone(),
                script_name: run.script.name.clone(),
                start_time: run.start_time,
                end_time: run.end_time,
                output: run.output.clone(),
                error: run.error.clone(),
            });

            for raw in &run.events {
                let status = EventStatus::normalize(&raw.status);
                if status == EventStatus::Failed {
                    error_count += 1;
                }
                events.push(InspectionCheckEvent {
                    id: 0,
                    record_id: record.id,
                    schedule_id: record.schedule_id,
                    cluster: record.cluster.clone(),
                    status,
                    msg: raw.msg.clone(),
                    extra: encode_extra(&raw.extra),
                    script_name: run.script.name.clone(),
                    kind: run.script.kind.clone(),
                    check_desc: run.script.description.clone(),
                    namespace: raw.namespace.clone(),
                    name: raw.name.clone(),
                });
            }
        }

        (events, results, error_count)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn schedule_key(schedule_id: i64) -> String {
    schedule_id.to_string()
}

fn encode_extra(extra: &ScriptValue) -> Option<String> {
    if extra.is_null() {
        None
    } else {
        Some(serde_json::Value::from(extra.clone()).to_string())
    }
}
