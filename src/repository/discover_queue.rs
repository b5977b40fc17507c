//! Discover task queue mapper.

use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use super::error::{RepositoryError, Result};
use super::models::{DiscoverTaskChangeset, DiscoverTaskRecord, NewDiscoverTaskRecord};
use super::pool::DbPool;
use super::queue::{QueueTable, TaskUpdate};
use super::store::Column;
use crate::models::{DiscoverTask, QueueKind, TaskStatus};
use crate::schema::discover_queue;
use crate::with_conn;

#[derive(Clone)]
pub struct DiscoverQueue {
    pool: DbPool,
    queue: QueueTable,
}

impl DiscoverQueue {
    pub fn new(pool: DbPool) -> Self {
        let queue = QueueTable::new(pool.clone(), QueueKind::Discover);
        Self { pool, queue }
    }

    pub fn queue(&self) -> &QueueTable {
        &self.queue
    }

    pub async fn initialize(&self) -> Result<()> {
        self.pool
            .create_autoincrement_table(
                "discover_queue",
                "task_id",
                &[
                    Column::bigint("ingest_id"),
                    Column::text("actor_id").nullable(),
                    Column::text("status"),
                    Column::text("claimed_at").nullable(),
                ],
            )
            .await?;
        self.queue.create_indexes().await
    }

    pub async fn insert(&self, ingest_id: i64) -> Result<i64> {
        if ingest_id <= 0 {
            return Err(RepositoryError::Validation(
                "discover task requires an ingest_id".to_string(),
            ));
        }

        let record = NewDiscoverTaskRecord {
            ingest_id,
            status: TaskStatus::Waiting.as_str(),
        };
        let task_id = with_conn!(self.pool, conn => {
            diesel::insert_into(discover_queue::table)
                .values(&record)
                .returning(discover_queue::task_id)
                .get_result::<i64>(&mut conn)
                .await
        })?;
        Ok(task_id)
    }

    pub async fn find(&self, task_id: i64) -> Result<Option<DiscoverTask>> {
        let record = with_conn!(self.pool, conn => {
            discover_queue::table
                .find(task_id)
                .select(DiscoverTaskRecord::as_select())
                .first(&mut conn)
                .await
                .optional()
        })?;
        record.map(DiscoverTask::try_from).transpose()
    }

    pub async fn update(&self, task_id: i64, update: TaskUpdate) -> Result<()> {
        update.check_allowed(false)?;
        if update.is_empty() {
            return Ok(());
        }

        let changeset = DiscoverTaskChangeset {
            status: update.status.map(|s| s.as_str().to_string()),
            actor_id: update.actor_id.clone(),
            claimed_at: update.claimed_at_change(),
        };

        let updated = with_conn!(self.pool, conn => {
            diesel::update(discover_queue::table.find(task_id))
                .set(&changeset)
                .execute(&mut conn)
                .await
        })?;
        if updated == 0 {
            return Err(RepositoryError::NotFound(format!("discover task {task_id}")));
        }
        Ok(())
    }

    pub async fn get(&self, actor_id: &str) -> Result<Option<DiscoverTask>> {
        match self.queue.claim(actor_id).await? {
            Some(task_id) => self.find(task_id).await,
            None => Ok(None),
        }
    }

    pub async fn list_for_ingest(
        &self,
        ingest_id: i64,
        status: Option<TaskStatus>,
    ) -> Result<Vec<DiscoverTask>> {
        let records = with_conn!(self.pool, conn => {
            let mut query = discover_queue::table
                .filter(discover_queue::ingest_id.eq(ingest_id))
                .order(discover_queue::task_id.asc())
                .select(DiscoverTaskRecord::as_select())
                .into_boxed();
            if let Some(status) = status {
                query = query.filter(discover_queue::status.eq(status.as_str()));
            }
            query.load(&mut conn).await
        })?;
        records.into_iter().map(DiscoverTask::try_from).collect()
    }

    pub async fn is_complete(&self) -> Result<bool> {
        self.queue.is_complete().await
    }

    pub async fn is_complete_for_ingest(&self, ingest_id: i64) -> Result<bool> {
        self.queue.is_complete_for_ingest(ingest_id).await
    }
}
