//! Database layer using SQLite
//!
//! Persistent storage for cluster sources, inspection schedules, scripts,
//! run records and webhook deliveries.

pub mod batch;
pub mod migrations;

use kubepatrol_common::{Error, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;

/// Database connection pool
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        // Create parent directory if needed
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(path).parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    Error::System(format!("Failed to create DB directory: {}", e))
                })?;
            }
        }

        let url = if database_url.contains('?') || database_url.contains(":memory:") {
            database_url.to_string()
        } else {
            format!("{}?mode=rwc", database_url)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(&url)
            .await
            .map_err(|e| Error::Database(format!("Database connection failed: {}", e)))?;

        tracing::info!("Database connection established");

        Ok(Self { pool })
    }

    /// Migrated in-memory database on a single connection
    pub async fn in_memory() -> Result<Self> {
        let db = Self::new("sqlite::memory:", 1).await?;
        db.migrate().await?;
        Ok(db)
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        migrations::run_migrations(&self.pool).await?;
        tracing::info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection
    pub async fn close(self) {
        self.pool.close().await;
        tracing::info!("Database connection closed");
    }
}

fn db_err(context: &str) -> impl Fn(sqlx::Error) -> Error + '_ {
    move |e| Error::Database(format!("{}: {}", context, e))
}

/// Kubeconfig rows stored in the database
pub mod kube_configs {
    use super::*;
    use kubepatrol_common::KubeConfigRow;
    use sqlx::Row;

    pub async fn create(pool: &SqlitePool, row: &KubeConfigRow) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO kube_configs (server, user, cluster, content, display_name, is_aws,
                                       access_key, secret_access_key, region, eks_cluster_name)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.server)
        .bind(&row.user)
        .bind(&row.cluster)
        .bind(&row.content)
        .bind(&row.display_name)
        .bind(row.is_aws)
        .bind(&row.access_key)
        .bind(&row.secret_access_key)
        .bind(&row.region)
        .bind(&row.eks_cluster_name)
        .execute(pool)
        .await
        .map_err(db_err("Failed to save kubeconfig"))?;

        Ok(result.last_insert_rowid())
    }

    pub async fn list(pool: &SqlitePool) -> Result<Vec<KubeConfigRow>> {
        let rows = sqlx::query("SELECT * FROM kube_configs ORDER BY id")
            .fetch_all(pool)
            .await
            .map_err(db_err("Failed to list kubeconfigs"))?;

        Ok(rows
            .iter()
            .map(|row| KubeConfigRow {
                id: row.get("id"),
                server: row.get("server"),
                user: row.get("user"),
                cluster: row.get("cluster"),
                content: row.get("content"),
                display_name: row.get("display_name"),
                is_aws: row.get("is_aws"),
                access_key: row.get("access_key"),
                secret_access_key: row.get("secret_access_key"),
                region: row.get("region"),
                eks_cluster_name: row.get("eks_cluster_name"),
            })
            .collect())
    }

    pub async fn delete(pool: &SqlitePool, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM kube_configs WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(db_err("Failed to delete kubeconfig"))?;
        Ok(())
    }
}

/// Check scripts
pub mod scripts {
    use super::*;
    use kubepatrol_common::InspectionScript;
    use sqlx::Row;

    pub async fn create(pool: &SqlitePool, script: &InspectionScript) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO inspection_scripts (code, name, kind, description, source)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&script.code)
        .bind(&script.name)
        .bind(&script.kind)
        .bind(&script.description)
        .bind(&script.source)
        .execute(pool)
        .await
        .map_err(db_err("Failed to create script"))?;

        Ok(result.last_insert_rowid())
    }

    /// Scripts for the given codes, in the order the codes are listed.
    /// Unknown codes are skipped.
    pub async fn get_by_codes(pool: &SqlitePool, codes: &[String]) -> Result<Vec<InspectionScript>> {
        let mut scripts = Vec::with_capacity(codes.len());
        for code in codes {
            let row = sqlx::query("SELECT * FROM inspection_scripts WHERE code = ?")
                .bind(code)
                .fetch_optional(pool)
                .await
                .map_err(db_err("Failed to load script"))?;

            match row {
                Some(row) => scripts.push(InspectionScript {
                    id: row.get("id"),
                    code: row.get("code"),
                    name: row.get("name"),
                    kind: row.get("kind"),
                    description: row.get("description"),
                    source: row.get("source"),
                }),
                None => tracing::warn!("Inspection script {} not found", code),
            }
        }
        Ok(scripts)
    }
}

/// Inspection schedules
pub mod schedules {
    use super::*;
    use kubepatrol_common::InspectionSchedule;
    use sqlx::sqlite::SqliteRow;
    use sqlx::Row;

    pub async fn create(pool: &SqlitePool, schedule: &InspectionSchedule) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO inspection_schedules (name, description, cron, clusters, script_codes,
                                               webhooks, enabled, last_run_time, error_count)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&schedule.name)
        .bind(&schedule.description)
        .bind(&schedule.cron)
        .bind(&schedule.clusters)
        .bind(&schedule.script_codes)
        .bind(&schedule.webhooks)
        .bind(schedule.enabled)
        .bind(schedule.last_run_time)
        .bind(schedule.error_count)
        .execute(pool)
        .await
        .map_err(db_err("Failed to create schedule"))?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get(pool: &SqlitePool, id: i64) -> Result<InspectionSchedule> {
        let row = sqlx::query("SELECT * FROM inspection_schedules WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(db_err("Failed to load schedule"))?
            .ok_or_else(|| Error::NotFound(format!("inspection schedule {}", id)))?;

        Ok(row_to_schedule(&row))
    }

    pub async fn list_enabled(pool: &SqlitePool) -> Result<Vec<InspectionSchedule>> {
        let rows = sqlx::query("SELECT * FROM inspection_schedules WHERE enabled = 1 ORDER BY id")
            .fetch_all(pool)
            .await
            .map_err(db_err("Failed to list schedules"))?;

        Ok(rows.iter().map(row_to_schedule).collect())
    }

    pub async fn update(pool: &SqlitePool, schedule: &InspectionSchedule) -> Result<()> {
        sqlx::query(
            "UPDATE inspection_schedules SET name = ?, description = ?, cron = ?, clusters = ?,
                    script_codes = ?, webhooks = ?, enabled = ?
             WHERE id = ?",
        )
        .bind(&schedule.name)
        .bind(&schedule.description)
        .bind(&schedule.cron)
        .bind(&schedule.clusters)
        .bind(&schedule.script_codes)
        .bind(&schedule.webhooks)
        .bind(schedule.enabled)
        .bind(schedule.id)
        .execute(pool)
        .await
        .map_err(db_err("Failed to update schedule"))?;
        Ok(())
    }

    /// Touches only the run statistics; other columns may be edited concurrently.
    pub async fn update_run_stats(pool: &SqlitePool, id: i64, last_run_time: i64, error_count: i64) -> Result<()> {
        sqlx::query("UPDATE inspection_schedules SET last_run_time = ?, error_count = ? WHERE id = ?")
            .bind(last_run_time)
            .bind(error_count)
            .bind(id)
            .execute(pool)
            .await
            .map_err(db_err("Failed to update schedule run stats"))?;
        Ok(())
    }

    pub async fn delete(pool: &SqlitePool, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM inspection_schedules WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(db_err("Failed to delete schedule"))?;
        Ok(())
    }

    fn row_to_schedule(row: &SqliteRow) -> InspectionSchedule {
        InspectionSchedule {
            id: row.get("id"),
            name: row.get("name"),
            description: row.get("description"),
            cron: row.get("cron"),
            clusters: row.get("clusters"),
            script_codes: row.get("script_codes"),
            webhooks: row.get("webhooks"),
            enabled: row.get("enabled"),
            last_run_time: row.get("last_run_time"),
            error_count: row.get("error_count"),
        }
    }
}

/// Run records, script results and check events
pub mod records {
    use super::*;
    use kubepatrol_common::{
        EventStatus, InspectionCheckEvent, InspectionRecord, InspectionScriptResult, RunStatus, TriggerType,
    };
    use sqlx::sqlite::SqliteRow;
    use sqlx::{QueryBuilder, Row, Sqlite};

    /// Record query filter; unset fields match everything
    #[derive(Debug, Clone, Default)]
    pub struct RecordFilter {
        pub schedule_id: Option<i64>,
        pub cluster: Option<String>,
        pub start_time: Option<i64>,
        pub end_time: Option<i64>,
    }

    pub async fn create(pool: &SqlitePool, record: &InspectionRecord) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO inspection_records (schedule_id, schedule_name, cluster, trigger_type, status,
                                             start_time, end_time, error_count)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.schedule_id)
        .bind(&record.schedule_name)
        .bind(&record.cluster)
        .bind(record.trigger.as_str())
        .bind(record.status.as_str())
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(record.error_count)
        .execute(pool)
        .await
        .map_err(db_err("Failed to create inspection record"))?;

        Ok(result.last_insert_rowid())
    }

    pub async fn finish(pool: &SqlitePool, id: i64, end_time: i64, error_count: i64) -> Result<()> {
        sqlx::query("UPDATE inspection_records SET status = ?, end_time = ?, error_count = ? WHERE id = ?")
            .bind(RunStatus::Success.as_str())
            .bind(end_time)
            .bind(error_count)
            .bind(id)
            .execute(pool)
            .await
            .map_err(db_err("Failed to finish inspection record"))?;
        Ok(())
    }

    pub async fn save_summary(pool: &SqlitePool, id: i64, summary: &str, result_raw: &str) -> Result<()> {
        sqlx::query("UPDATE inspection_records SET summary = ?, result_raw = ? WHERE id = ?")
            .bind(summary)
            .bind(result_raw)
            .bind(id)
            .execute(pool)
            .await
            .map_err(db_err("Failed to save summary"))?;
        Ok(())
    }

    pub async fn get(pool: &SqlitePool, id: i64) -> Result<InspectionRecord> {
        let row = sqlx::query("SELECT * FROM inspection_records WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(db_err("Failed to load inspection record"))?
            .ok_or_else(|| Error::NotFound(format!("inspection record {}", id)))?;

        Ok(row_to_record(&row))
    }

    /// Records matching the filter, newest first
    pub async fn list(pool: &SqlitePool, filter: &RecordFilter) -> Result<Vec<InspectionRecord>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM inspection_records WHERE 1 = 1");
        if let Some(schedule_id) = filter.schedule_id {
            builder.push(" AND schedule_id = ").push_bind(schedule_id);
        }
        if let Some(ref cluster) = filter.cluster {
            builder.push(" AND cluster = ").push_bind(cluster.clone());
        }
        if let Some(start) = filter.start_time {
            builder.push(" AND start_time >= ").push_bind(start);
        }
        if let Some(end) = filter.end_time {
            builder.push(" AND start_time <= ").push_bind(end);
        }
        builder.push(" ORDER BY start_time DESC, id DESC");

        let rows = builder
            .build()
            .fetch_all(pool)
            .await
            .map_err(db_err("Failed to list inspection records"))?;

        Ok(rows.iter().map(row_to_record).collect())
    }

    pub async fn list_events(pool: &SqlitePool, record_id: i64) -> Result<Vec<InspectionCheckEvent>> {
        list_events_for(pool, &[record_id]).await
    }

    pub async fn list_events_for(pool: &SqlitePool, record_ids: &[i64]) -> Result<Vec<InspectionCheckEvent>> {
        if record_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM inspection_check_events WHERE record_id IN (");
        let mut ids = builder.separated(", ");
        for id in record_ids {
            ids.push_bind(*id);
        }
        builder.push(") ORDER BY id");

        let rows = builder
            .build()
            .fetch_all(pool)
            .await
            .map_err(db_err("Failed to list check events"))?;

        Ok(rows.iter().map(row_to_event).collect())
    }

    pub async fn list_script_results(pool: &SqlitePool, record_id: i64) -> Result<Vec<InspectionScriptResult>> {
        let rows = sqlx::query("SELECT * FROM inspection_script_results WHERE record_id = ? ORDER BY id")
            .bind(record_id)
            .fetch_all(pool)
            .await
            .map_err(db_err("Failed to list script results"))?;

        Ok(rows
            .iter()
            .map(|row| InspectionScriptResult {
                id: row.get("id"),
                record_id: row.get("record_id"),
                schedule_id: row.get("schedule_id"),
                cluster: row.get("cluster"),
                script_name: row.get("script_name"),
                start_time: row.get("start_time"),
                end_time: row.get("end_time"),
                output: row.get("output"),
                error: row.get("error"),
            })
            .collect())
    }

    fn row_to_record(row: &SqliteRow) -> InspectionRecord {
        let trigger: String = row.get("trigger_type");
        let status: String = row.get("status");

        InspectionRecord {
            id: row.get("id"),
            schedule_id: row.get("schedule_id"),
            schedule_name: row.get("schedule_name"),
            cluster: row.get("cluster"),
            trigger: TriggerType::parse(&trigger).unwrap_or(TriggerType::Manual),
            status: RunStatus::parse(&status).unwrap_or(RunStatus::Running),
            start_time: row.get("start_time"),
            end_time: row.get("end_time"),
            error_count: row.get("error_count"),
            summary: row.get("summary"),
            result_raw: row.get("result_raw"),
        }
    }

    fn row_to_event(row: &SqliteRow) -> InspectionCheckEvent {
        let status: String = row.get("status");

        InspectionCheckEvent {
            id: row.get("id"),
            record_id: row.get("record_id"),
            schedule_id: row.get("schedule_id"),
            cluster: row.get("cluster"),
            status: EventStatus::parse(&status),
            msg: row.get("msg"),
            extra: row.get("extra"),
            script_name: row.get("script_name"),
            kind: row.get("kind"),
            check_desc: row.get("check_desc"),
            namespace: row.get("namespace"),
            name: row.get("name"),
        }
    }
}

/// Webhook receivers and delivery logs
pub mod webhooks {
    use super::*;
    use kubepatrol_common::{WebhookLogRecord, WebhookReceiver};
    use sqlx::sqlite::SqliteRow;
    use sqlx::Row;

    pub async fn create_receiver(pool: &SqlitePool, receiver: &WebhookReceiver) -> Result<i64> {
        let result = sqlx::query("INSERT INTO webhook_receivers (name, platform, target_url) VALUES (?, ?, ?)")
            .bind(&receiver.name)
            .bind(&receiver.platform)
            .bind(&receiver.target_url)
            .execute(pool)
            .await
            .map_err(db_err("Failed to create webhook receiver"))?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_receiver(pool: &SqlitePool, id: i64) -> Result<WebhookReceiver> {
        let row = sqlx::query("SELECT * FROM webhook_receivers WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(db_err("Failed to load webhook receiver"))?
            .ok_or_else(|| Error::NotFound(format!("webhook receiver {}", id)))?;

        Ok(row_to_receiver(&row))
    }

    /// Receivers for the given ids; unknown ids are skipped
    pub async fn get_receivers(pool: &SqlitePool, ids: &[i64]) -> Result<Vec<WebhookReceiver>> {
        let mut receivers = Vec::with_capacity(ids.len());
        for id in ids {
            match get_receiver(pool, *id).await {
                Ok(receiver) => receivers.push(receiver),
                Err(Error::NotFound(_)) => tracing::warn!("Webhook receiver {} not found", id),
                Err(e) => return Err(e),
            }
        }
        Ok(receivers)
    }

    pub async fn insert_log(pool: &SqlitePool, log: &WebhookLogRecord) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO webhook_log_records (receiver_id, record_id, status_code, response_body, error, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(log.receiver_id)
        .bind(log.record_id)
        .bind(log.status_code)
        .bind(&log.response_body)
        .bind(&log.error)
        .bind(log.created_at)
        .execute(pool)
        .await
        .map_err(db_err("Failed to record webhook delivery"))?;

        Ok(result.last_insert_rowid())
    }

    pub async fn list_logs(pool: &SqlitePool, record_id: i64) -> Result<Vec<WebhookLogRecord>> {
        let rows = sqlx::query("SELECT * FROM webhook_log_records WHERE record_id = ? ORDER BY id")
            .bind(record_id)
            .fetch_all(pool)
            .await
            .map_err(db_err("Failed to list webhook deliveries"))?;

        Ok(rows
            .iter()
            .map(|row| WebhookLogRecord {
                id: row.get("id"),
                receiver_id: row.get("receiver_id"),
                record_id: row.get("record_id"),
                status_code: row.get("status_code"),
                response_body: row.get("response_body"),
                error: row.get("error"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    fn row_to_receiver(row: &SqliteRow) -> WebhookReceiver {
        WebhookReceiver {
            id: row.get("id"),
            name: row.get("name"),
            platform: row.get("platform"),
            target_url: row.get("target_url"),
        }
    }
}
