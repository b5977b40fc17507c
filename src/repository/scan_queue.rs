//! Scan task queue mapper.

use std::collections::HashSet;

use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use super::error::{RepositoryError, Result};
use super::models::{NewScanTaskRecord, ScanTaskChangeset, ScanTaskRecord};
use super::pool::DbPool;
use super::queue::{QueueTable, TaskUpdate};
use super::store::Column;
use crate::models::{NewScanTask, QueueKind, ScanTask, TaskStatus};
use crate::schema::scan_queue;
use crate::with_conn;

/// Directories waiting for a format-specific scanner.
#[derive(Clone)]
pub struct ScanQueue {
    pool: DbPool,
    queue: QueueTable,
}

impl ScanQueue {
    pub fn new(pool: DbPool) -> Self {
        let queue = QueueTable::new(pool.clone(), QueueKind::Scan);
        Self { pool, queue }
    }

    /// Status/claim operations shared with the other queues.
    pub fn queue(&self) -> &QueueTable {
        &self.queue
    }

    pub async fn initialize(&self) -> Result<()> {
        self.pool
            .create_autoincrement_table(
                "scan_queue",
                "task_id",
                &[
                    Column::bigint("ingest_id"),
                    Column::text("path"),
                    Column::text("context"),
                    Column::text("scanner_type"),
                    Column::text("actor_id").nullable(),
                    Column::text("status"),
                    Column::text("claimed_at").nullable(),
                    Column::bigint("discover_task_id").nullable(),
                ],
            )
            .await?;
        self.pool
            .create_index("scan_queue", &["discover_task_id"], false)
            .await?;
        self.queue.create_indexes().await
    }

    /// Queue a directory for scanning. Returns the new task id.
    pub async fn insert(&self, task: &NewScanTask) -> Result<i64> {
        if task.ingest_id <= 0 {
            return Err(RepositoryError::Validation(
                "scan task requires an ingest_id".to_string(),
            ));
        }
        if task.scanner_type.trim().is_empty() {
            return Err(RepositoryError::Validation(
                "scan task requires a scanner_type".to_string(),
            ));
        }

        let context = task.context.to_json()?;
        let record = NewScanTaskRecord {
            ingest_id: task.ingest_id,
            path: &task.path,
            context: &context,
            scanner_type: &task.scanner_type,
            status: TaskStatus::Waiting.as_str(),
            discover_task_id: task.discover_task_id,
        };

        let task_id = with_conn!(self.pool, conn => {
            diesel::insert_into(scan_queue::table)
                .values(&record)
                .returning(scan_queue::task_id)
                .get_result::<i64>(&mut conn)
                .await
        })?;
        Ok(task_id)
    }

    /// Paths already queued by a discover task.
    pub async fn paths_from_discover_task(&self, discover_task_id: i64) -> Result<HashSet<String>> {
        let paths: Vec<String> = with_conn!(self.pool, conn => {
            scan_queue::table
                .filter(scan_queue::discover_task_id.eq(discover_task_id))
                .select(scan_queue::path)
                .load(&mut conn)
                .await
        })?;
        Ok(paths.into_iter().collect())
    }

    pub async fn find(&self, task_id: i64) -> Result<Option<ScanTask>> {
        let record = with_conn!(self.pool, conn => {
            scan_queue::table
                .find(task_id)
                .select(ScanTaskRecord::as_select())
                .first(&mut conn)
                .await
                .optional()
        })?;
        record.map(ScanTask::try_from).transpose()
    }

    pub async fn update(&self, task_id: i64, update: TaskUpdate) -> Result<()> {
        update.check_allowed(true)?;
        if update.is_empty() {
            return Ok(());
        }

        let changeset = ScanTaskChangeset {
            status: update.status.map(|s| s.as_str().to_string()),
            actor_id: update.actor_id.clone(),
            claimed_at: update.claimed_at_change(),
            context: update.context.as_ref().map(|c| c.to_json()).transpose()?,
        };

        let updated = with_conn!(self.pool, conn => {
            diesel::update(scan_queue::table.find(task_id))
                .set(&changeset)
                .execute(&mut conn)
                .await
        })?;
        if updated == 0 {
            return Err(RepositoryError::NotFound(format!("scan task {task_id}")));
        }
        Ok(())
    }

    /// Claim the oldest waiting scan task for `actor_id`.
    pub async fn get(&self, actor_id: &str) -> Result<Option<ScanTask>> {
        match self.queue.claim(actor_id).await? {
            Some(task_id) => self.find(task_id).await,
            None => Ok(None),
        }
    }

    pub async fn list_for_ingest(
        &self,
        ingest_id: i64,
        status: Option<TaskStatus>,
    ) -> Result<Vec<ScanTask>> {
        let records = with_conn!(self.pool, conn => {
            let mut query = scan_queue::table
                .filter(scan_queue::ingest_id.eq(ingest_id))
                .order(scan_queue::task_id.asc())
                .select(ScanTaskRecord::as_select())
                .into_boxed();
            if let Some(status) = status {
                query = query.filter(scan_queue::status.eq(status.as_str()));
            }
            query.load(&mut conn).await
        })?;
        records.into_iter().map(ScanTask::try_from).collect()
    }

    pub async fn is_complete(&self) -> Result<bool> {
        self.queue.is_complete().await
    }

    pub async fn is_complete_for_ingest(&self, ingest_id: i64) -> Result<bool> {
        self.queue.is_complete_for_ingest(ingest_id).await
    }
}
