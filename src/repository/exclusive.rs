//! SQLite sections that must hold the write lock from first read to last write.
//!
//! These run on a plain synchronous connection inside
//! [`SqlitePool::blocking`](super::pool::SqlitePool::blocking) so they can use
//! `BEGIN IMMEDIATE`.

use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text};
use diesel::sqlite::SqliteConnection;

use super::claim::ClaimedId;
use super::error::{RepositoryError, Result};
use super::models::{NewSubjectMapRecord, SubjectMapRecord};
use crate::schema::subjects_mapping;

pub(crate) fn claim_next(
    conn: &mut SqliteConnection,
    table: &str,
    actor_id: &str,
    now: &str,
) -> Result<Option<i64>> {
    conn.immediate_transaction::<_, RepositoryError, _>(|conn| {
        let next = diesel::sql_query(format!(
            "SELECT task_id FROM {table} WHERE status = 'waiting' ORDER BY task_id LIMIT 1"
        ))
        .get_result::<ClaimedId>(conn)
        .optional()?;

        let Some(ClaimedId { task_id }) = next else {
            return Ok(None);
        };

        diesel::sql_query(format!(
            "UPDATE {table} SET status = 'processing', actor_id = ?, claimed_at = ? WHERE task_id = ?"
        ))
        .bind::<Text, _>(actor_id)
        .bind::<Text, _>(now)
        .bind::<BigInt, _>(task_id)
        .execute(conn)?;

        Ok(Some(task_id))
    })
}

pub(crate) fn subject_get_or_create<F>(
    conn: &mut SqliteConnection,
    ingest_id: i64,
    field_values: &str,
    format_code: F,
) -> Result<SubjectMapRecord>
where
    F: Fn(i64) -> String,
{
    conn.immediate_transaction::<_, RepositoryError, _>(|conn| {
        let existing = subjects_mapping::table
            .filter(subjects_mapping::ingest_id.eq(ingest_id))
            .filter(subjects_mapping::field_values.eq(field_values))
            .select(SubjectMapRecord::as_select())
            .first(conn)
            .optional()?;
        if let Some(record) = existing {
            return Ok(record);
        }

        let last: Option<i64> = subjects_mapping::table
            .filter(subjects_mapping::ingest_id.eq(ingest_id))
            .select(diesel::dsl::max(subjects_mapping::subject_id))
            .first(conn)?;
        let subject_id = last.unwrap_or(0) + 1;
        let subject_code = format_code(subject_id);

        let record = diesel::insert_into(subjects_mapping::table)
            .values(&NewSubjectMapRecord {
                ingest_id,
                subject_id,
                subject_code: &subject_code,
                field_values,
            })
            .returning(SubjectMapRecord::as_returning())
            .get_result(conn)?;
        Ok(record)
    })
}
