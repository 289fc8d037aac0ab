use kubepatrol_api::config::KubePatrolConfig;
use kubepatrol_api::db::Database;
use kubepatrol_api::inspection::InspectionEngine;
use kubepatrol_api::kubernetes::KubeResourceClient;
use kubepatrol_api::registry::ClusterRegistry;
use kubepatrol_api::scheduler::Scheduler;
use kubepatrol_api::script::RuleRuntime;
use kubepatrol_api::shutdown::{
    CleanupRunner, DatabaseCleanup, GracefulShutdown, RegistryCleanup, SchedulerCleanup, ShutdownCoordinator,
    TaskShutdown,
};
use kubepatrol_api::webhooks::{HttpWebhookSender, WebhookDispatcher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "--sample-config") {
        println!("{}", KubePatrolConfig::generate_sample());
        return Ok(());
    }

    // Load configuration
    let config = KubePatrolConfig::load();
    if let Err(e) = config.validate() {
        return Err(anyhow::anyhow!("Invalid configuration: {}", e));
    }

    // Initialize logging; the guard flushes the file writer on exit
    let _log_guard = config
        .logging
        .init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
    info!("Configuration loaded successfully");

    // Initialize database
    let database = Database::new(&config.database.url, config.database.max_connections).await?;
    database.migrate().await?;
    info!("Database initialized");

    // Cluster registry
    let registry = Arc::new(
        ClusterRegistry::new(Arc::new(KubeResourceClient::new()), config.cluster.kubeconfig_path())
            .with_database(database.clone())
            .with_in_cluster(config.cluster.in_cluster),
    );
    let report = registry.scan().await;
    info!(
        from_files = report.from_files,
        from_database = report.from_database,
        removed = report.removed,
        "Cluster scan complete"
    );
    if let Err(e) = registry.register_in_cluster().await {
        warn!("In-cluster registration failed: {}", e);
    }

    // Scheduler and inspection engine
    let scheduler = Arc::new(Scheduler::with_tick(Duration::from_millis(
        config.inspection.scheduler_tick_ms,
    )));
    scheduler.start().await?;

    let sender = HttpWebhookSender::new(Duration::from_secs(config.webhook.timeout_seconds))?;
    let dispatcher = Arc::new(WebhookDispatcher::new(database.clone(), Arc::new(sender)));

    let engine = Arc::new(
        InspectionEngine::new(
            database.clone(),
            registry.clone(),
            scheduler.clone(),
            Arc::new(RuleRuntime::new()),
        )
        .with_settings(&config.inspection)
        .with_webhooks(dispatcher),
    );
    match engine.add_cron_jobs_from_db().await {
        Ok(installed) => info!("{} inspection schedule(s) installed", installed),
        Err(e) => error!("Failed to load inspection schedules: {}", e),
    }

    // Periodic rescans pick up new kubeconfig files and database rows
    let mut tasks = TaskShutdown::new();
    if config.cluster.rescan_interval_secs > 0 {
        let registry = registry.clone();
        let interval = Duration::from_secs(config.cluster.rescan_interval_secs);
        tasks.register(
            "cluster_rescan",
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let report = registry.scan().await;
                    if report != Default::default() {
                        info!(
                            from_files = report.from_files,
                            from_database = report.from_database,
                            removed = report.removed,
                            "Cluster rescan applied changes"
                        );
                    }
                }
            }),
        );
    }

    let mut cleanup = CleanupRunner::new();
    cleanup.add(SchedulerCleanup::new(scheduler));
    cleanup.add(RegistryCleanup::new(registry));
    cleanup.add(DatabaseCleanup::new(database));

    info!("KubePatrol started");

    let coordinator = ShutdownCoordinator::new();
    let task_timeout = coordinator.timeout();
    GracefulShutdown::new(coordinator)
        .run(|| async move {
            tasks.abort_all(task_timeout).await;
            cleanup.run_all().await;
        })
        .await;

    Ok(())
}
