//! Database migrations

use kubepatrol_common::{Error, Result};
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            executed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| Error::Database(format!("Failed to create migrations table: {}", e)))?;

    // Run migrations in order
    run_migration(pool, "001_create_kube_configs_table", MIGRATION_001_CREATE_KUBE_CONFIGS).await?;
    run_migration(pool, "002_create_inspection_scripts_table", MIGRATION_002_CREATE_SCRIPTS).await?;
    run_migration(pool, "003_create_inspection_schedules_table", MIGRATION_003_CREATE_SCHEDULES).await?;
    run_migration(pool, "004_create_inspection_records_table", MIGRATION_004_CREATE_RECORDS).await?;
    run_migration(pool, "005_create_inspection_script_results_table", MIGRATION_005_CREATE_SCRIPT_RESULTS).await?;
    run_migration(pool, "006_create_inspection_check_events_table", MIGRATION_006_CREATE_CHECK_EVENTS).await?;
    run_migration(pool, "007_create_webhook_receivers_table", MIGRATION_007_CREATE_WEBHOOK_RECEIVERS).await?;
    run_migration(pool, "008_create_webhook_log_records_table", MIGRATION_008_CREATE_WEBHOOK_LOGS).await?;

    Ok(())
}

async fn run_migration(pool: &SqlitePool, name: &str, sql: &str) -> Result<()> {
    use sqlx::Row;

    let row = sqlx::query("SELECT COUNT(*) as count FROM migrations WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await
        .map_err(|e| Error::Database(format!("Migration check failed: {}", e)))?;

    let count: i64 = row.get("count");
    if count > 0 {
        tracing::debug!("Migration {} already applied", name);
        return Ok(());
    }

    tracing::info!("Running migration: {}", name);

    // Each migration may hold several statements
    for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| Error::Database(format!("Migration {} failed: {}", name, e)))?;
    }

    sqlx::query("INSERT INTO migrations (name) VALUES (?)")
        .bind(name)
        .execute(pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to record migration: {}", e)))?;

    Ok(())
}

const MIGRATION_001_CREATE_KUBE_CONFIGS: &str = "
CREATE TABLE kube_configs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    server TEXT NOT NULL DEFAULT '',
    user TEXT NOT NULL DEFAULT '',
    cluster TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL DEFAULT '',
    display_name TEXT,
    is_aws INTEGER NOT NULL DEFAULT 0,
    access_key TEXT,
    secret_access_key TEXT,
    region TEXT,
    eks_cluster_name TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
)
";

const MIGRATION_002_CREATE_SCRIPTS: &str = "
CREATE TABLE inspection_scripts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    code TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    source TEXT NOT NULL DEFAULT ''
)
";

const MIGRATION_003_CREATE_SCHEDULES: &str = "
CREATE TABLE inspection_schedules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    cron TEXT NOT NULL DEFAULT '',
    clusters TEXT NOT NULL DEFAULT '',
    script_codes TEXT NOT NULL DEFAULT '',
    webhooks TEXT NOT NULL DEFAULT '',
    enabled INTEGER NOT NULL DEFAULT 1,
    last_run_time INTEGER,
    error_count INTEGER NOT NULL DEFAULT 0
)
";

const MIGRATION_004_CREATE_RECORDS: &str = "
CREATE TABLE inspection_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    schedule_id INTEGER NOT NULL,
    schedule_name TEXT NOT NULL DEFAULT '',
    cluster TEXT NOT NULL,
    trigger_type TEXT NOT NULL,
    status TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER,
    error_count INTEGER NOT NULL DEFAULT 0,
    summary TEXT,
    result_raw TEXT
);
CREATE INDEX idx_inspection_records_schedule ON inspection_records(schedule_id);
CREATE INDEX idx_inspection_records_cluster ON inspection_records(cluster)
";

const MIGRATION_005_CREATE_SCRIPT_RESULTS: &str = "
CREATE TABLE inspection_script_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id INTEGER NOT NULL,
    schedule_id INTEGER NOT NULL,
    cluster TEXT NOT NULL,
    script_name TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER NOT NULL,
    output TEXT NOT NULL DEFAULT '',
    error TEXT
);
CREATE INDEX idx_inspection_script_results_record ON inspection_script_results(record_id)
";

const MIGRATION_006_CREATE_CHECK_EVENTS: &str = "
CREATE TABLE inspection_check_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id INTEGER NOT NULL,
    schedule_id INTEGER NOT NULL,
    cluster TEXT NOT NULL,
    status TEXT NOT NULL,
    msg TEXT NOT NULL DEFAULT '',
    extra TEXT,
    script_name TEXT NOT NULL DEFAULT '',
    kind TEXT NOT NULL DEFAULT '',
    check_desc TEXT NOT NULL DEFAULT '',
    namespace TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL DEFAULT ''
);
CREATE INDEX idx_inspection_check_events_record ON inspection_check_events(record_id)
";

const MIGRATION_007_CREATE_WEBHOOK_RECEIVERS: &str = "
CREATE TABLE webhook_receivers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    platform TEXT NOT NULL DEFAULT '',
    target_url TEXT NOT NULL
)
";

const MIGRATION_008_CREATE_WEBHOOK_LOGS: &str = "
CREATE TABLE webhook_log_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    receiver_id INTEGER NOT NULL,
    record_id INTEGER NOT NULL,
    status_code INTEGER,
    response_body TEXT NOT NULL DEFAULT '',
    error TEXT,
    created_at INTEGER NOT NULL
)
";
