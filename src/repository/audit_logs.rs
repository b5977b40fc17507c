//! Audit log mapper.

use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use super::error::Result;
use super::models::{AuditLogRecord, NewAuditLogRecord};
use super::pool::DbPool;
use super::store::Column;
use crate::models::{AuditLog, NewAuditLog};
use crate::schema::audit_logs;
use crate::with_conn;

#[derive(Clone)]
pub struct AuditLogRepository {
    pool: DbPool,
}

impl AuditLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        self.pool
            .create_autoincrement_table(
                "audit_logs",
                "log_id",
                &[
                    Column::bigint("ingest_id"),
                    Column::text("src_path"),
                    Column::text("fw_path").nullable(),
                    Column::boolean("failed"),
                    Column::text("message").nullable(),
                ],
            )
            .await?;
        self.pool
            .create_index("audit_logs", &["ingest_id"], false)
            .await
    }

    pub async fn insert(&self, entry: &NewAuditLog) -> Result<i64> {
        let record = NewAuditLogRecord {
            ingest_id: entry.ingest_id,
            src_path: &entry.src_path,
            fw_path: entry.fw_path.as_deref(),
            failed: entry.failed,
            message: entry.message.as_deref(),
        };
        let log_id = with_conn!(self.pool, conn => {
            diesel::insert_into(audit_logs::table)
                .values(&record)
                .returning(audit_logs::log_id)
                .get_result::<i64>(&mut conn)
                .await
        })?;
        Ok(log_id)
    }

    pub async fn list_for_ingest(&self, ingest_id: i64) -> Result<Vec<AuditLog>> {
        let records = with_conn!(self.pool, conn => {
            audit_logs::table
                .filter(audit_logs::ingest_id.eq(ingest_id))
                .order(audit_logs::log_id.asc())
                .select(AuditLogRecord::as_select())
                .load(&mut conn)
                .await
        })?;
        Ok(records.into_iter().map(AuditLog::from).collect())
    }

    pub async fn count_failed(&self, ingest_id: i64) -> Result<u64> {
        let count: i64 = with_conn!(self.pool, conn => {
            audit_logs::table
                .filter(audit_logs::ingest_id.eq(ingest_id))
                .filter(audit_logs::failed.eq(true))
                .count()
                .get_result(&mut conn)
                .await
        })?;
        Ok(count.max(0) as u64)
    }
}
