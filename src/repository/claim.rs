//! Atomic task claiming.
//!
//! One strategy per backend. Both pick the lowest waiting `task_id` and flip
//! it to `processing` for the caller in a single atomic step, so a task is
//! never held by two workers. The strategy only returns the claimed id; the
//! queue mapper loads the full row afterwards.

use std::sync::Arc;

use async_trait::async_trait;
use diesel::sql_types::BigInt;
use diesel::QueryableByName;

use super::error::Result;
use super::exclusive;
use super::pool::{DbPool, SqlitePool};
use super::util::now_timestamp;

#[cfg(feature = "postgres")]
use super::pool::PgPool;

/// Row shape returned by the claim queries.
#[derive(QueryableByName, Debug)]
pub(crate) struct ClaimedId {
    #[diesel(sql_type = BigInt)]
    pub task_id: i64,
}

/// Backend-specific claim of the next waiting task in a queue table.
#[async_trait]
pub trait ClaimStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Claim the lowest waiting task for `actor_id`, returning its id.
    async fn claim_next(&self, table: &'static str, actor_id: &str) -> Result<Option<i64>>;
}

/// SQLite has no row locks: hold the database write lock (`BEGIN IMMEDIATE`)
/// across the select and the update.
pub struct ExclusiveLockClaim {
    pool: SqlitePool,
}

impl ExclusiveLockClaim {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ClaimStrategy for ExclusiveLockClaim {
    fn name(&self) -> &'static str {
        "exclusive-lock"
    }

    async fn claim_next(&self, table: &'static str, actor_id: &str) -> Result<Option<i64>> {
        let actor_id = actor_id.to_string();
        let now = now_timestamp();
        self.pool
            .blocking(move |conn| exclusive::claim_next(conn, table, &actor_id, &now))
            .await
    }
}

/// PostgreSQL: one `UPDATE … RETURNING` over a `FOR UPDATE SKIP LOCKED`
/// subselect, so concurrent workers claim distinct rows without waiting on
/// each other.
#[cfg(feature = "postgres")]
pub struct SkipLockedClaim {
    pool: PgPool,
}

#[cfg(feature = "postgres")]
impl SkipLockedClaim {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "postgres")]
#[async_trait]
impl ClaimStrategy for SkipLockedClaim {
    fn name(&self) -> &'static str {
        "skip-locked"
    }

    async fn claim_next(&self, table: &'static str, actor_id: &str) -> Result<Option<i64>> {
        use diesel::sql_types::Text;
        use diesel::OptionalExtension;
        use diesel_async::RunQueryDsl;

        let sql = format!(
            "UPDATE {table} SET status = 'processing', actor_id = $1, claimed_at = $2 \
             WHERE task_id = (\
                 SELECT task_id FROM {table} WHERE status = 'waiting' \
                 ORDER BY task_id LIMIT 1 FOR UPDATE SKIP LOCKED\
             ) RETURNING task_id"
        );
        let now = now_timestamp();
        let mut conn = self.pool.get().await?;
        let claimed = diesel::sql_query(sql)
            .bind::<Text, _>(actor_id)
            .bind::<Text, _>(&now)
            .get_result::<ClaimedId>(&mut conn)
            .await
            .optional()?;
        Ok(claimed.map(|c| c.task_id))
    }
}

impl DbPool {
    /// Claim strategy matching this pool's backend.
    pub fn claim_strategy(&self) -> Arc<dyn ClaimStrategy> {
        match self {
            DbPool::Sqlite(pool) => Arc::new(ExclusiveLockClaim::new(pool.clone())),
            #[cfg(feature = "postgres")]
            DbPool::Postgres(pool) => Arc::new(SkipLockedClaim::new(pool.clone())),
        }
    }
}
