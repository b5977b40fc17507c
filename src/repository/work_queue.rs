//! Work (upload) task queue mapper.

use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use super::error::{RepositoryError, Result};
use super::models::{NewWorkTaskRecord, WorkTaskChangeset, WorkTaskRecord};
use super::pool::DbPool;
use super::queue::{QueueTable, TaskUpdate};
use super::store::Column;
use crate::models::{NewWorkTask, QueueKind, TaskStatus, WorkTask};
use crate::schema::work_queue;
use crate::with_conn;

/// One upload per ingest item.
#[derive(Clone)]
pub struct WorkQueue {
    pool: DbPool,
    queue: QueueTable,
}

impl WorkQueue {
    pub fn new(pool: DbPool) -> Self {
        let queue = QueueTable::new(pool.clone(), QueueKind::Work);
        Self { pool, queue }
    }

    pub fn queue(&self) -> &QueueTable {
        &self.queue
    }

    pub async fn initialize(&self) -> Result<()> {
        self.pool
            .create_autoincrement_table(
                "work_queue",
                "task_id",
                &[
                    Column::bigint("item_id"),
                    Column::bigint("ingest_id"),
                    Column::text("context"),
                    Column::text("actor_id").nullable(),
                    Column::text("status"),
                    Column::text("claimed_at").nullable(),
                ],
            )
            .await?;
        self.queue.create_indexes().await?;
        self.pool.create_index("work_queue", &["item_id"], false).await
    }

    pub async fn insert(&self, task: &NewWorkTask) -> Result<i64> {
        if task.ingest_id <= 0 || task.item_id <= 0 {
            return Err(RepositoryError::Validation(
                "work task requires an ingest_id and an item_id".to_string(),
            ));
        }

        let context = task.context.to_json()?;
        let record = NewWorkTaskRecord {
            item_id: task.item_id,
            ingest_id: task.ingest_id,
            context: &context,
            status: TaskStatus::Waiting.as_str(),
        };

        let task_id = with_conn!(self.pool, conn => {
            diesel::insert_into(work_queue::table)
                .values(&record)
                .returning(work_queue::task_id)
                .get_result::<i64>(&mut conn)
                .await
        })?;
        Ok(task_id)
    }

    pub async fn find(&self, task_id: i64) -> Result<Option<WorkTask>> {
        let record = with_conn!(self.pool, conn => {
            work_queue::table
                .find(task_id)
                .select(WorkTaskRecord::as_select())
                .first(&mut conn)
                .await
                .optional()
        })?;
        record.map(WorkTask::try_from).transpose()
    }

    pub async fn update(&self, task_id: i64, update: TaskUpdate) -> Result<()> {
        update.check_allowed(true)?;
        if update.is_empty() {
            return Ok(());
        }

        let changeset = WorkTaskChangeset {
            status: update.status.map(|s| s.as_str().to_string()),
            actor_id: update.actor_id.clone(),
            claimed_at: update.claimed_at_change(),
            context: update.context.as_ref().map(|c| c.to_json()).transpose()?,
        };

        let updated = with_conn!(self.pool, conn => {
            diesel::update(work_queue::table.find(task_id))
                .set(&changeset)
                .execute(&mut conn)
                .await
        })?;
        if updated == 0 {
            return Err(RepositoryError::NotFound(format!("work task {task_id}")));
        }
        Ok(())
    }

    /// Claim the oldest waiting work task for `actor_id`.
    pub async fn get(&self, actor_id: &str) -> Result<Option<WorkTask>> {
        match self.queue.claim(actor_id).await? {
            Some(task_id) => self.find(task_id).await,
            None => Ok(None),
        }
    }

    pub async fn list_for_ingest(
        &self,
        ingest_id: i64,
        status: Option<TaskStatus>,
    ) -> Result<Vec<WorkTask>> {
        let records = with_conn!(self.pool, conn => {
            let mut query = work_queue::table
                .filter(work_queue::ingest_id.eq(ingest_id))
                .order(work_queue::task_id.asc())
                .select(WorkTaskRecord::as_select())
                .into_boxed();
            if let Some(status) = status {
                query = query.filter(work_queue::status.eq(status.as_str()));
            }
            query.load(&mut conn).await
        })?;
        records.into_iter().map(WorkTask::try_from).collect()
    }

    pub async fn is_complete(&self) -> Result<bool> {
        self.queue.is_complete().await
    }

    pub async fn is_complete_for_ingest(&self, ingest_id: i64) -> Result<bool> {
        self.queue.is_complete_for_ingest(ingest_id).await
    }
}
