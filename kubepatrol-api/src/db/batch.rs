//! Bounded multi-row inserts

use kubepatrol_common::{Error, InspectionCheckEvent, InspectionScriptResult, Result};
use sqlx::query_builder::Separated;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

/// A row that can be appended to a multi-row INSERT
pub trait BatchRow {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];

    fn push_binds(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>);
}

/// Insert `rows` in chunks of at most `batch_size` rows per statement.
///
/// Returns the number of INSERT statements issued: 0 for an empty slice,
/// otherwise `ceil(len / batch_size)`. A failing chunk aborts the remaining
/// ones.
pub async fn batch_save<T: BatchRow>(pool: &SqlitePool, rows: &[T], batch_size: usize) -> Result<usize> {
    let mut writes = 0;

    for chunk in rows.chunks(batch_size.max(1)) {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "INSERT INTO {} ({}) ",
            T::TABLE,
            T::COLUMNS.join(", ")
        ));
        builder.push_values(chunk, |mut b, row| row.push_binds(&mut b));

        builder
            .build()
            .execute(pool)
            .await
            .map_err(|e| Error::Database(format!("Batch insert into {} failed: {}", T::TABLE, e)))?;
        writes += 1;
    }

    Ok(writes)
}

impl BatchRow for InspectionCheckEvent {
    const TABLE: &'static str = "inspection_check_events";
    const COLUMNS: &'static [&'static str] = &[
        "record_id",
        "schedule_id",
        "cluster",
        "status",
        "msg",
        "extra",
        "script_name",
        "kind",
        "check_desc",
        "namespace",
        "name",
    ];

    fn push_binds(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.record_id)
            .push_bind(self.schedule_id)
            .push_bind(self.cluster.clone())
            .push_bind(self.status.as_str())
            .push_bind(self.msg.clone())
            .push_bind(self.extra.clone())
            .push_bind(self.script_name.clone())
            .push_bind(self.kind.clone())
            .push_bind(self.check_desc.clone())
            .push_bind(self.namespace.clone())
            .push_bind(self.name.clone());
    }
}

impl BatchRow for InspectionScriptResult {
    const TABLE: &'static str = "inspection_script_results";
    const COLUMNS: &'static [&'static str] = &[
        "record_id",
        "schedule_id",
        "cluster",
        "script_name",
        "start_time",
        "end_time",
        "output",
        "error",
    ];

    fn push_binds(&self, row: &mut Separated<'_, '_, Sqlite, &'static str>) {
        row.push_bind(self.record_id)
            .push_bind(self.schedule_id)
            .push_bind(self.cluster.clone())
            .push_bind(self.script_name.clone())
            .push_bind(self.start_time)
            .push_bind(self.end_time)
            .push_bind(self.output.clone())
            .push_bind(self.error.clone());
    }
}
