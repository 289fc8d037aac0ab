//! In-memory cron scheduler
//!
//! Jobs are keyed by a caller-chosen string. Adding a key that already
//! exists cancels and replaces the previous job. Every firing runs on its own
//! task and receives the job's [`CancellationToken`].

pub mod cancel;
pub mod cron;

pub use cancel::CancellationToken;
pub use cron::{CronSchedule, JobSchedule};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use kubepatrol_common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Job body. Called once per firing with the job's cancellation token.
pub type JobFn = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

struct JobEntry {
    expr: String,
    schedule: JobSchedule,
    func: JobFn,
    cancel: CancellationToken,
    next_run: Option<DateTime<Utc>>,
    /// Held for the duration of a firing; overlapping firings are skipped
    run_lock: Arc<Mutex<()>>,
}

/// Cron scheduler with one dispatch loop
pub struct Scheduler {
    jobs: Arc<RwLock<HashMap<String, JobEntry>>>,
    running: Arc<RwLock<Option<CancellationToken>>>,
    tick: Duration,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_tick(Duration::from_secs(1))
    }

    /// Scheduler whose dispatch loop wakes every `tick`
    pub fn with_tick(tick: Duration) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(RwLock::new(None)),
            tick,
        }
    }

    /// Install `func` under `key`, replacing and cancelling any previous job
    /// with that key. An unparseable expression is rejected and leaves the
    /// table untouched.
    pub async fn add(&self, key: &str, expr: &str, func: JobFn) -> Result<()> {
        let schedule = JobSchedule::parse(expr)?;
        let next_run = schedule.next_after(&Utc::now());

        let entry = JobEntry {
            expr: expr.to_string(),
            schedule,
            func,
            cancel: CancellationToken::new(),
            next_run,
            run_lock: Arc::new(Mutex::new(())),
        };

        let mut jobs = self.jobs.write().await;
        if let Some(previous) = jobs.insert(key.to_string(), entry) {
            previous.cancel.cancel();
            debug!(key, "Replaced scheduled job");
        }
        info!(key, expr, "Scheduled job installed");
        Ok(())
    }

    /// Cancel and delete the job; unknown keys are ignored
    pub async fn remove(&self, key: &str) {
        if let Some(entry) = self.jobs.write().await.remove(key) {
            entry.cancel.cancel();
            info!(key, "Scheduled job removed");
        }
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.jobs.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.jobs.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn next_run(&self, key: &str) -> Option<DateTime<Utc>> {
        self.jobs.read().await.get(key).and_then(|e| e.next_run)
    }

    pub async fn expression(&self, key: &str) -> Option<String> {
        self.jobs.read().await.get(key).map(|e| e.expr.clone())
    }

    /// Start the dispatch loop
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if running.is_some() {
            return Err(Error::Validation("Scheduler is already running".to_string()));
        }

        let stop = CancellationToken::new();
        *running = Some(stop.clone());

        // Jobs cancelled by a previous stop() get a fresh token
        {
            let now = Utc::now();
            let mut jobs = self.jobs.write().await;
            for (key, entry) in jobs.iter_mut() {
                if entry.cancel.is_cancelled() {
                    entry.cancel = CancellationToken::new();
                    entry.next_run = entry.schedule.next_after(&now);
                    debug!(key = %key, "Re-armed scheduled job");
                }
            }
        }

        let jobs = self.jobs.clone();
        let tick = self.tick;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        Self::dispatch(&jobs, Utc::now()).await;
                    }
                }
            }

            info!("Scheduler stopped");
        });

        info!("Scheduler started");
        Ok(())
    }

    /// Stop the dispatch loop and cancel every job's token. Jobs stay
    /// installed and resume on the next [`start`](Self::start).
    pub async fn stop(&self) {
        if let Some(stop) = self.running.write().await.take() {
            stop.cancel();
        }
        for entry in self.jobs.read().await.values() {
            entry.cancel.cancel();
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.read().await.is_some()
    }

    /// Fire every job due at `now`. Returns the number of firings spawned.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> usize {
        Self::dispatch(&self.jobs, now).await
    }

    async fn dispatch(jobs: &RwLock<HashMap<String, JobEntry>>, now: DateTime<Utc>) -> usize {
        let due: Vec<(String, JobFn, CancellationToken, Arc<Mutex<()>>)> = {
            let mut jobs = jobs.write().await;
            jobs.iter_mut()
                .filter(|(_, e)| e.next_run.map(|t| t <= now).unwrap_or(false))
                .map(|(key, e)| {
                    e.next_run = e.schedule.next_after(&now);
                    (key.clone(), e.func.clone(), e.cancel.clone(), e.run_lock.clone())
                })
                .collect()
        };

        let fired = due.len();
        for (key, func, cancel, run_lock) in due {
            if cancel.is_cancelled() {
                continue;
            }
            tokio::spawn(Self::fire(key, func, cancel, run_lock));
        }
        fired
    }

    async fn fire(key: String, func: JobFn, cancel: CancellationToken, run_lock: Arc<Mutex<()>>) {
        let Ok(_guard) = run_lock.try_lock_owned() else {
            warn!(key = %key, "Previous run still in progress, skipping");
            return;
        };

        debug!(key = %key, "Running scheduled job");
        // Run in a nested task so a panic is contained and reported here
        let task = tokio::spawn(func(cancel));
        match task.await {
            Ok(()) => debug!(key = %key, "Scheduled job finished"),
            Err(e) if e.is_panic() => error!(key = %key, "Scheduled job panicked"),
            Err(e) => warn!(key = %key, "Scheduled job aborted: {}", e),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap an async closure as a [`JobFn`]
pub fn job_fn<F, Fut>(f: F) -> JobFn
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |cancel| Box::pin(f(cancel)))
}
