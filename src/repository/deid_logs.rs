//! De-identification log mapper.

use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use super::error::Result;
use super::models::{DeidLogRecord, NewDeidLogRecord};
use super::pool::DbPool;
use super::store::Column;
use super::util::now_timestamp;
use crate::models::{DeidLog, NewDeidLog};
use crate::schema::deid_logs;
use crate::with_conn;

#[derive(Clone)]
pub struct DeidLogRepository {
    pool: DbPool,
}

impl DeidLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        self.pool
            .create_autoincrement_table(
                "deid_logs",
                "log_id",
                &[
                    Column::bigint("ingest_id"),
                    Column::text("path"),
                    Column::text("log_type"),
                    Column::text("field_values"),
                    Column::text("created"),
                ],
            )
            .await?;
        self.pool
            .create_index("deid_logs", &["ingest_id"], false)
            .await
    }

    pub async fn insert(&self, entry: &NewDeidLog) -> Result<()> {
        self.insert_many(std::slice::from_ref(entry)).await
    }

    /// Append several records over one connection.
    pub async fn insert_many(&self, entries: &[NewDeidLog]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let created = now_timestamp();
        let records = entries
            .iter()
            .map(|e| {
                Ok(NewDeidLogRecord {
                    ingest_id: e.ingest_id,
                    path: e.path.clone(),
                    log_type: e.log_type.clone(),
                    field_values: serde_json::to_string(&e.field_values)?,
                    created: created.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        with_conn!(self.pool, conn => {
            for record in &records {
                diesel::insert_into(deid_logs::table)
                    .values(record)
                    .execute(&mut conn)
                    .await?;
            }
        });
        Ok(())
    }

    pub async fn list_for_ingest(&self, ingest_id: i64) -> Result<Vec<DeidLog>> {
        let records = with_conn!(self.pool, conn => {
            deid_logs::table
                .filter(deid_logs::ingest_id.eq(ingest_id))
                .order(deid_logs::log_id.asc())
                .select(DeidLogRecord::as_select())
                .load(&mut conn)
                .await
        })?;
        records.into_iter().map(DeidLog::try_from).collect()
    }
}
