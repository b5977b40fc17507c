//! Operations shared by the three task queue tables.
//!
//! The typed mappers (`discover`, `scan`, `work`) own insert/find/update with
//! the Diesel DSL; everything that only touches `status`, `actor_id` and
//! `claimed_at` lives here once, parameterized by table name and claim
//! strategy.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use diesel::sql_types::{BigInt, Text};
use diesel::QueryableByName;
use diesel_async::RunQueryDsl;

use super::claim::ClaimStrategy;
use super::error::{RepositoryError, Result};
use super::pool::DbPool;
use super::util::format_timestamp;
use crate::models::{ItemContext, QueueKind, StatusCounts, TaskStatus};
use crate::with_conn;

#[derive(QueryableByName)]
struct StatusCountRow {
    #[diesel(sql_type = Text)]
    status: String,
    #[diesel(sql_type = BigInt)]
    count: i64,
}

/// A queue table plus the claim strategy for its backend.
#[derive(Clone)]
pub struct QueueTable {
    pool: DbPool,
    kind: QueueKind,
    claim: Arc<dyn ClaimStrategy>,
}

impl QueueTable {
    pub fn new(pool: DbPool, kind: QueueKind) -> Self {
        let claim = pool.claim_strategy();
        Self::with_strategy(pool, kind, claim)
    }

    pub fn with_strategy(pool: DbPool, kind: QueueKind, claim: Arc<dyn ClaimStrategy>) -> Self {
        Self { pool, kind, claim }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn table(&self) -> &'static str {
        self.kind.table()
    }

    /// Indexes every queue table carries.
    pub async fn create_indexes(&self) -> Result<()> {
        for column in ["status", "actor_id", "ingest_id"] {
            self.pool.create_index(self.table(), &[column], false).await?;
        }
        Ok(())
    }

    /// Claim the oldest waiting task for `actor_id`.
    pub async fn claim(&self, actor_id: &str) -> Result<Option<i64>> {
        if actor_id.is_empty() {
            return Err(RepositoryError::Validation(
                "actor_id must not be empty".to_string(),
            ));
        }
        self.claim.claim_next(self.table(), actor_id).await
    }

    /// Set a task's status.
    pub async fn set_status(&self, task_id: i64, status: TaskStatus) -> Result<()> {
        let backend = self.pool.backend();
        let sql = format!(
            "UPDATE {} SET status = {} WHERE task_id = {}",
            self.table(),
            backend.placeholder(1),
            backend.placeholder(2)
        );
        let updated = with_conn!(self.pool, conn => {
            diesel::sql_query(&sql)
                .bind::<Text, _>(status.as_str())
                .bind::<BigInt, _>(task_id)
                .execute(&mut conn)
                .await
        })?;
        if updated == 0 {
            return Err(RepositoryError::NotFound(format!(
                "{} task {task_id}",
                self.kind.as_str()
            )));
        }
        Ok(())
    }

    /// Task counts by status, across all ingests or for one.
    pub async fn status_counts(&self, ingest_id: Option<i64>) -> Result<StatusCounts> {
        let rows = match ingest_id {
            Some(ingest_id) => {
                let sql = format!(
                    "SELECT status, COUNT(*) AS count FROM {} WHERE ingest_id = {} GROUP BY status",
                    self.table(),
                    self.pool.backend().placeholder(1)
                );
                with_conn!(self.pool, conn => {
                    diesel::sql_query(&sql)
                        .bind::<BigInt, _>(ingest_id)
                        .load::<StatusCountRow>(&mut conn)
                        .await
                })?
            }
            None => {
                let sql = format!(
                    "SELECT status, COUNT(*) AS count FROM {} GROUP BY status",
                    self.table()
                );
                with_conn!(self.pool, conn => {
                    diesel::sql_query(&sql).load::<StatusCountRow>(&mut conn).await
                })?
            }
        };

        let mut counts = StatusCounts::default();
        for row in rows {
            let status = TaskStatus::from_str(&row.status).ok_or_else(|| {
                RepositoryError::corrupt(self.table(), format!("unknown status '{}'", row.status))
            })?;
            counts.add(status, row.count.max(0) as u64);
        }
        Ok(counts)
    }

    /// True iff no task in the table is waiting or processing.
    pub async fn is_complete(&self) -> Result<bool> {
        Ok(self.status_counts(None).await?.is_complete())
    }

    /// True iff no task of `ingest_id` is waiting or processing.
    pub async fn is_complete_for_ingest(&self, ingest_id: i64) -> Result<bool> {
        Ok(self.status_counts(Some(ingest_id)).await?.is_complete())
    }

    /// Reset tasks stuck in `processing` longer than `older_than` to `waiting`.
    ///
    /// Returns the number of tasks released.
    pub async fn requeue_stale(&self, older_than: Duration) -> Result<usize> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| RepositoryError::Validation(format!("lease timeout: {e}")))?;
        let cutoff = format_timestamp(Utc::now() - older_than);
        let sql = format!(
            "UPDATE {} SET status = 'waiting', actor_id = NULL, claimed_at = NULL \
             WHERE status = 'processing' AND (claimed_at IS NULL OR claimed_at < {})",
            self.table(),
            self.pool.backend().placeholder(1)
        );
        let released = with_conn!(self.pool, conn => {
            diesel::sql_query(&sql)
                .bind::<Text, _>(&cutoff)
                .execute(&mut conn)
                .await
        })?;
        Ok(released)
    }

    /// Put every failed task of an ingest back in the queue.
    pub async fn retry_failed(&self, ingest_id: i64) -> Result<usize> {
        let sql = format!(
            "UPDATE {} SET status = 'waiting', actor_id = NULL, claimed_at = NULL \
             WHERE status = 'failed' AND ingest_id = {}",
            self.table(),
            self.pool.backend().placeholder(1)
        );
        let retried = with_conn!(self.pool, conn => {
            diesel::sql_query(&sql)
                .bind::<BigInt, _>(ingest_id)
                .execute(&mut conn)
                .await
        })?;
        Ok(retried)
    }
}

/// Partial update of a queued task.
///
/// Only `status`, `actor_id` and `context` can be changed; queues without a
/// context column reject the latter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub actor_id: Option<Option<String>>,
    pub context: Option<ItemContext>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.actor_id.is_none() && self.context.is_none()
    }

    /// Build an update from `name=value` style pairs.
    ///
    /// `actor_id` accepts `null` or an empty value to clear it; `context`
    /// takes JSON.
    pub fn from_fields<I, K, V>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut update = Self::default();
        for (name, value) in fields {
            let (name, value) = (name.as_ref(), value.as_ref());
            match name {
                "status" => {
                    update.status = Some(TaskStatus::from_str(value).ok_or_else(|| {
                        RepositoryError::Validation(format!("unknown status '{value}'"))
                    })?);
                }
                "actor_id" => {
                    update.actor_id = Some(match value {
                        "" | "null" => None,
                        other => Some(other.to_string()),
                    });
                }
                "context" => update.context = Some(ItemContext::from_json(value)?),
                other => return Err(RepositoryError::InvalidField(other.to_string())),
            }
        }
        Ok(update)
    }

    pub(crate) fn check_allowed(&self, has_context: bool) -> Result<()> {
        if self.context.is_some() && !has_context {
            return Err(RepositoryError::InvalidField("context".to_string()));
        }
        Ok(())
    }

    /// `claimed_at` change implied by the new status: cleared on a reset to
    /// waiting.
    pub(crate) fn claimed_at_change(&self) -> Option<Option<String>> {
        match self.status {
            Some(TaskStatus::Waiting) => Some(None),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_from_fields() {
        let update =
            TaskUpdate::from_fields([("status", "failed"), ("actor_id", "null")]).unwrap();
        assert_eq!(update.status, Some(TaskStatus::Failed));
        assert_eq!(update.actor_id, Some(None));
        assert!(update.context.is_none());
    }

    #[test]
    fn test_update_rejects_unknown_field() {
        let err = TaskUpdate::from_fields([("priority", "1")]).unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidField(f) if f == "priority"));

        let err = TaskUpdate::from_fields([("status", "done")]).unwrap_err();
        assert!(matches!(err, RepositoryError::Validation(_)));
    }

    #[test]
    fn test_context_not_allowed_everywhere() {
        let update = TaskUpdate::from_fields([("context", "{}")]).unwrap();
        assert!(update.check_allowed(true).is_ok());
        assert!(matches!(
            update.check_allowed(false),
            Err(RepositoryError::InvalidField(_))
        ));
    }
}
