//! Inspection Engine Tests
//! Tests for run execution, persistence, cron wiring and per-schedule statistics

mod common;

use common::{write_kubeconfig, FakeClusterApi, FakeResourceClient, FakeRuntime};
use kubepatrol_api::db::{self, records::RecordFilter, Database};
use kubepatrol_api::inspection::summary::{self, KindCount};
use kubepatrol_api::registry::ClusterRegistry;
use kubepatrol_api::scheduler::{CancellationToken, Scheduler};
use kubepatrol_api::{InspectionEngine, InspectionError};
use kubepatrol_common::{EventStatus, InspectionSchedule, InspectionScript, RunStatus, TriggerType};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const DEV: &str = "config/dev";
const PROD: &str = "config/prod";

struct Fixture {
    _dir: TempDir,
    db: Database,
    client: Arc<FakeResourceClient>,
    runtime: Arc<FakeRuntime>,
    scheduler: Arc<Scheduler>,
    engine: Arc<InspectionEngine>,
}

async fn fixture() -> Fixture {
    fixture_with(|engine| engine).await
}

async fn fixture_with(configure: impl FnOnce(InspectionEngine) -> InspectionEngine) -> Fixture {
    let dir = TempDir::new().unwrap();
    write_kubeconfig(
        dir.path(),
        "config",
        &[("dev", "https://dev.example.com:6443"), ("prod", "https://prod.example.com:6443")],
    );

    let db = Database::in_memory().await.unwrap();
    let client = Arc::new(FakeResourceClient::new(FakeClusterApi::with_pods(&["web-0", "web-1"])));
    let registry = Arc::new(ClusterRegistry::new(client.clone(), dir.path().join("config")));
    registry.scan().await;

    let runtime = Arc::new(FakeRuntime::new());
    let scheduler = Arc::new(Scheduler::new());
    let engine = InspectionEngine::new(db.clone(), registry, scheduler.clone(), runtime.clone());

    Fixture {
        _dir: dir,
        db,
        client,
        runtime,
        scheduler,
        engine: Arc::new(configure(engine)),
    }
}

async fn create_script(db: &Database, code: &str, kind: &str, source: &str) {
    let script = InspectionScript {
        code: code.to_string(),
        name: format!("{} check", code),
        kind: kind.to_string(),
        description: format!("Checks {}", kind),
        source: source.to_string(),
        ..Default::default()
    };
    db::scripts::create(db.pool(), &script).await.unwrap();
}

async fn create_schedule(db: &Database, script_codes: &str, cron: &str, enabled: bool) -> i64 {
    let schedule = InspectionSchedule {
        name: "nightly".to_string(),
        cron: cron.to_string(),
        clusters: format!("{}, {}", DEV, PROD),
        script_codes: script_codes.to_string(),
        enabled,
        ..Default::default()
    };
    db::schedules::create(db.pool(), &schedule).await.unwrap()
}

// ============== Runs ==============

#[tokio::test]
async fn test_run_without_scripts() {
    let f = fixture().await;
    let schedule_id = create_schedule(&f.db, "", "", true).await;

    let record = f
        .engine
        .run_by_cluster(&CancellationToken::new(), schedule_id, DEV, TriggerType::Manual)
        .await
        .unwrap();

    assert_eq!(record.status, RunStatus::Success);
    assert_eq!(record.error_count, 0);
    assert!(record.end_time.is_some());
    assert!(record.summary.unwrap().contains("No checks reported"));
    assert!(db::records::list_events(f.db.pool(), record.id).await.unwrap().is_empty());
    assert!(db::records::list_script_results(f.db.pool(), record.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_run_counts_failed_events() {
    let f = fixture().await;
    // Seven pass spellings, three failures; status matching is case-sensitive
    create_script(&f.db, "pods", "Pod", "events:pass,ok,正常,success,通过,pass,ok,fail,error,Pass").await;
    let schedule_id = create_schedule(&f.db, "pods", "", true).await;

    let record = f
        .engine
        .run_by_cluster(&CancellationToken::new(), schedule_id, DEV, TriggerType::Manual)
        .await
        .unwrap();
    assert_eq!(record.error_count, 3);
    assert_eq!(record.cluster, DEV);
    assert_eq!(record.schedule_name, "nightly");

    let stored = db::records::get(f.db.pool(), record.id).await.unwrap();
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(stored.error_count, 3);
    assert!(stored.summary.as_deref().unwrap().contains("Checks: 10, failed: 3"));
    assert!(stored.result_raw.is_some());

    let events = db::records::list_events(f.db.pool(), record.id).await.unwrap();
    assert_eq!(events.len(), 10);
    assert_eq!(events.iter().filter(|e| e.status == EventStatus::Failed).count(), 3);
    assert_eq!(events[0].namespace, "default");
    assert_eq!(events[0].name, "pod-0");
    assert_eq!(events[0].kind, "Pod");
    assert_eq!(events[0].script_name, "pods check");
    assert_eq!(events[0].check_desc, "Checks Pod");
    assert!(events[0].extra.as_deref().unwrap().contains("pod-0"));

    let results = db::records::list_script_results(f.db.pool(), record.id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].output, "10 checks\n");
    assert!(results[0].error.is_none());

    let schedule = db::schedules::get(f.db.pool(), schedule_id).await.unwrap();
    assert_eq!(schedule.error_count, 3);
    assert_eq!(schedule.last_run_time, record.end_time);
}

#[tokio::test]
async fn test_script_failure_does_not_fail_run() {
    let f = fixture().await;
    create_script(&f.db, "broken", "Node", "error:lookup failed").await;
    create_script(&f.db, "pods", "Pod", "list").await;
    let schedule_id = create_schedule(&f.db, "broken,missing,pods", "", true).await;

    let record = f.engine.trigger_manual(schedule_id, DEV).await.unwrap();
    assert_eq!(record.status, RunStatus::Success);
    assert_eq!(record.error_count, 0);
    assert_eq!(record.trigger, TriggerType::Manual);

    // Unknown script codes are skipped; the rest run in listed order
    let results = db::records::list_script_results(f.db.pool(), record.id).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].error.as_deref(), Some("lookup failed"));
    assert_eq!(results[1].output, "2 items\n");
    assert!(record.summary.unwrap().contains("lookup failed"));
}

#[tokio::test]
async fn test_script_timeout_is_recorded() {
    let f = fixture_with(|engine| engine.with_script_timeout(Duration::from_millis(50))).await;
    create_script(&f.db, "slow", "Pod", "sleep:5000").await;
    let schedule_id = create_schedule(&f.db, "slow", "", true).await;

    let record = f.engine.trigger_manual(schedule_id, DEV).await.unwrap();
    let results = db::records::list_script_results(f.db.pool(), record.id).await.unwrap();
    assert!(results[0].error.as_deref().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_missing_schedule() {
    let f = fixture().await;
    let err = f
        .engine
        .run_by_cluster(&CancellationToken::new(), 999, DEV, TriggerType::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, InspectionError::ScheduleNotFound(999)));
}

#[tokio::test]
async fn test_unavailable_cluster() {
    let f = fixture().await;
    let schedule_id = create_schedule(&f.db, "", "", true).await;

    let err = f.engine.trigger_manual(schedule_id, "nowhere/ctx").await.unwrap_err();
    assert!(matches!(err, InspectionError::ClusterUnavailable(_)));

    f.client.set_unreachable("https://prod.example.com:6443", true);
    let err = f.engine.trigger_manual(schedule_id, PROD).await.unwrap_err();
    assert!(matches!(err, InspectionError::ClusterUnavailable(_)));

    let records = db::records::list(f.db.pool(), &RecordFilter::default()).await.unwrap();
    assert!(records.is_empty());
}

#[tokio::test]
async fn test_manual_trigger_requires_cluster() {
    let f = fixture().await;
    let schedule_id = create_schedule(&f.db, "", "", true).await;
    let err = f.engine.trigger_manual(schedule_id, "  ").await.unwrap_err();
    assert!(matches!(err, InspectionError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_cancelled_run_skips_scripts() {
    let f = fixture().await;
    create_script(&f.db, "pods", "Pod", "events:fail").await;
    let schedule_id = create_schedule(&f.db, "pods", "", true).await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let record = f
        .engine
        .run_by_cluster(&cancel, schedule_id, DEV, TriggerType::Cron)
        .await
        .unwrap();
    assert_eq!(record.error_count, 0);
    assert_eq!(f.runtime.executions(), 0);

    let clusters = vec![DEV.to_string(), PROD.to_string()];
    let completed = f.engine.run_clusters(&cancel, schedule_id, &clusters, TriggerType::Cron).await;
    assert_eq!(completed, 0);
}

#[tokio::test]
async fn test_run_clusters_isolates_failures() {
    let f = fixture().await;
    create_script(&f.db, "pods", "Pod", "events:pass,fail").await;
    let schedule_id = create_schedule(&f.db, "pods", "", true).await;

    let clusters: Vec<String> = [DEV, " ", "nowhere/ctx", PROD].iter().map(|c| c.to_string()).collect();
    let completed = f
        .engine
        .run_clusters(&CancellationToken::new(), schedule_id, &clusters, TriggerType::Cron)
        .await;
    assert_eq!(completed, 2);

    let records = db::records::list(f.db.pool(), &RecordFilter::default()).await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.trigger == TriggerType::Cron));
}

#[tokio::test]
async fn test_panicking_script_is_recorded_and_run_continues() {
    let f = fixture().await;
    create_script(&f.db, "explode", "Node", "panic:runtime exploded").await;
    create_script(&f.db, "pods", "Pod", "events:pass,fail").await;
    let schedule_id = create_schedule(&f.db, "explode,pods", "", true).await;

    let clusters = vec![DEV.to_string(), PROD.to_string()];
    let completed = f
        .engine
        .run_clusters(&CancellationToken::new(), schedule_id, &clusters, TriggerType::Cron)
        .await;
    assert_eq!(completed, 2);
    assert_eq!(f.runtime.executions(), 4);

    let records = db::records::list(f.db.pool(), &RecordFilter::default()).await.unwrap();
    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.error_count, 1);

        let results = db::records::list_script_results(f.db.pool(), record.id).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].error.as_deref().unwrap().contains("panicked: runtime exploded"));
        assert!(results[1].error.is_none());
    }
}

#[tokio::test]
async fn test_summary_lists_bounded_failures() {
    let f = fixture().await;
    let source = format!("events:{}", vec!["fail"; 120].join(","));
    create_script(&f.db, "pods", "Pod", &source).await;
    let schedule_id = create_schedule(&f.db, "pods", "", true).await;

    let record = f.engine.trigger_manual(schedule_id, DEV).await.unwrap();
    assert_eq!(record.error_count, 120);

    let built = summary::build_summary(&f.db, record.id).await.unwrap();
    assert_eq!(built.error_count, 120);
    assert_eq!(built.failed.len(), summary::MAX_LISTED_FAILURES);

    let text = record.summary.unwrap();
    assert!(text.contains("Checks: 120, failed: 120"));
    assert!(text.contains("... and 70 more"));
}

// ============== Cron wiring ==============

#[tokio::test]
async fn test_add_update_remove_jobs() {
    let f = fixture().await;
    let enabled = create_schedule(&f.db, "", "*/5 * * * *", true).await;
    let disabled = create_schedule(&f.db, "", "*/5 * * * *", false).await;
    let no_cron = create_schedule(&f.db, "", " ", true).await;

    assert!(f.engine.add(enabled).await.unwrap());
    assert!(!f.engine.add(disabled).await.unwrap());
    assert!(!f.engine.add(no_cron).await.unwrap());
    assert_eq!(f.scheduler.keys().await, vec![enabled.to_string()]);
    assert_eq!(f.scheduler.expression(&enabled.to_string()).await.as_deref(), Some("*/5 * * * *"));

    // Editing the expression replaces the job
    let mut schedule = db::schedules::get(f.db.pool(), enabled).await.unwrap();
    schedule.cron = "0 3 * * *".to_string();
    db::schedules::update(f.db.pool(), &schedule).await.unwrap();
    assert!(f.engine.update(enabled).await.unwrap());
    assert_eq!(f.scheduler.expression(&enabled.to_string()).await.as_deref(), Some("0 3 * * *"));

    // Disabling uninstalls it
    schedule.enabled = false;
    db::schedules::update(f.db.pool(), &schedule).await.unwrap();
    assert!(!f.engine.update(enabled).await.unwrap());
    assert!(f.scheduler.is_empty().await);

    assert!(matches!(
        f.engine.add(12345).await.unwrap_err(),
        InspectionError::ScheduleNotFound(12345)
    ));
}

#[tokio::test]
async fn test_invalid_cron_is_rejected() {
    let f = fixture().await;
    let schedule_id = create_schedule(&f.db, "", "not a cron", true).await;
    assert!(matches!(
        f.engine.add(schedule_id).await.unwrap_err(),
        InspectionError::Schedule(_)
    ));
    assert!(f.scheduler.is_empty().await);
}

#[tokio::test]
async fn test_add_cron_jobs_from_db() {
    let f = fixture().await;
    let first = create_schedule(&f.db, "", "0 * * * *", true).await;
    create_schedule(&f.db, "", "", true).await;
    create_schedule(&f.db, "", "0 * * * *", false).await;
    let second = create_schedule(&f.db, "", "@daily", true).await;

    assert_eq!(f.engine.add_cron_jobs_from_db().await.unwrap(), 2);
    // Reloading upserts rather than duplicating
    assert_eq!(f.engine.add_cron_jobs_from_db().await.unwrap(), 2);

    let mut expected = vec![first.to_string(), second.to_string()];
    expected.sort();
    assert_eq!(f.scheduler.keys().await, expected);

    f.engine.remove(first).await;
    assert!(!f.scheduler.contains(&first.to_string()).await);
}

#[tokio::test]
async fn test_cron_firing_runs_every_cluster() {
    let f = fixture().await;
    create_script(&f.db, "pods", "Pod", "events:pass").await;
    let schedule_id = create_schedule(&f.db, "pods", "* * * * *", true).await;
    assert!(f.engine.add(schedule_id).await.unwrap());

    let fired = f
        .scheduler
        .dispatch_due(chrono::Utc::now() + chrono::Duration::hours(1))
        .await;
    assert_eq!(fired, 1);

    let mut records = Vec::new();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        records = db::records::list(f.db.pool(), &RecordFilter::default()).await.unwrap();
        if records.len() == 2 {
            break;
        }
    }
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.trigger == TriggerType::Cron));
    assert_eq!(f.runtime.executions(), 2);
}

// ============== Statistics ==============

#[tokio::test]
async fn test_summary_by_schedule() {
    let f = fixture().await;
    create_script(&f.db, "pods", "Pod", "events:pass,fail").await;
    create_script(&f.db, "nodes", "Node", "events:ok").await;
    let schedule_id = create_schedule(&f.db, "pods,nodes", "", true).await;
    let other_id = create_schedule(&f.db, "nodes", "", true).await;

    f.engine.trigger_manual(schedule_id, DEV).await.unwrap();
    f.engine.trigger_manual(schedule_id, DEV).await.unwrap();
    f.engine.trigger_manual(other_id, PROD).await.unwrap();
    let latest = f.engine.trigger_manual(schedule_id, PROD).await.unwrap();

    let filter = RecordFilter {
        schedule_id: Some(schedule_id),
        ..Default::default()
    };
    let stats = summary::summary_by_schedule(&f.db, &filter).await.unwrap();
    assert_eq!(stats.total_runs, 3);
    assert_eq!(stats.total_clusters, 2);
    assert_eq!(stats.total_schedules, None);

    let dev = stats.clusters.iter().find(|c| c.cluster == DEV).unwrap();
    assert_eq!(dev.run_count, 2);
    let pods = dev.kinds.iter().find(|k| k.kind == "Pod").unwrap();
    assert_eq!((pods.count, pods.error_count), (4, 2));

    let latest_run = stats.latest_run.unwrap();
    assert_eq!(latest_run.record_id, latest.id);
    assert_eq!(
        latest_run.kinds,
        vec![
            KindCount {
                kind: "Node".to_string(),
                normal_count: 1,
                error_count: 0,
            },
            KindCount {
                kind: "Pod".to_string(),
                normal_count: 1,
                error_count: 1,
            },
        ]
    );

    let all = summary::summary_by_schedule(&f.db, &RecordFilter::default()).await.unwrap();
    assert_eq!(all.total_runs, 4);
    assert_eq!(all.total_schedules, Some(2));

    let by_cluster = RecordFilter {
        cluster: Some(PROD.to_string()),
        ..Default::default()
    };
    let prod = summary::summary_by_schedule(&f.db, &by_cluster).await.unwrap();
    assert_eq!(prod.total_clusters, 1);
    assert_eq!(prod.total_runs, 2);
}

#[tokio::test]
async fn test_summary_of_empty_history() {
    let f = fixture().await;
    let stats = summary::summary_by_schedule(&f.db, &RecordFilter::default()).await.unwrap();
    assert_eq!(stats.total_runs, 0);
    assert_eq!(stats.total_schedules, Some(0));
    assert!(stats.latest_run.is_none());
}
