//! Subject code mapping.
//!
//! `get_or_create` is the only read-modify-write in the mapper layer outside
//! of the claim path: it must find the existing code for a set of identifying
//! fields or allocate `max(subject_id) + 1`, and two workers must never
//! allocate the same id.

use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use super::error::Result;
use super::exclusive;
use super::models::{NewSubjectMapRecord, SubjectMapRecord};
use super::pool::DbPool;
use super::store::Column;
use crate::models::{NewSubjectMapping, SubjectMapping};
use crate::schema::subjects_mapping;
use crate::with_conn;

#[cfg(feature = "postgres")]
use super::error::RepositoryError;
#[cfg(feature = "postgres")]
use super::pool::PgPool;

#[derive(Clone)]
pub struct SubjectMapRepository {
    pool: DbPool,
}

impl SubjectMapRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        self.pool
            .create_autoincrement_table(
                "subjects_mapping",
                "map_id",
                &[
                    Column::bigint("ingest_id"),
                    Column::bigint("subject_id"),
                    Column::text("subject_code"),
                    Column::text("field_values"),
                ],
            )
            .await?;
        self.pool
            .create_index("subjects_mapping", &["ingest_id", "subject_id"], true)
            .await?;
        self.pool
            .create_index("subjects_mapping", &["ingest_id", "field_values"], false)
            .await
    }

    /// Insert a known mapping, e.g. one loaded from a previous run's CSV.
    pub async fn insert(&self, mapping: &NewSubjectMapping) -> Result<i64> {
        let field_values = serde_json::to_string(&mapping.field_values)?;
        let record = NewSubjectMapRecord {
            ingest_id: mapping.ingest_id,
            subject_id: mapping.subject_id,
            subject_code: &mapping.subject_code,
            field_values: &field_values,
        };
        let map_id = with_conn!(self.pool, conn => {
            diesel::insert_into(subjects_mapping::table)
                .values(&record)
                .returning(subjects_mapping::map_id)
                .get_result::<i64>(&mut conn)
                .await
        })?;
        Ok(map_id)
    }

    pub async fn list_for_ingest(&self, ingest_id: i64) -> Result<Vec<SubjectMapping>> {
        let records = with_conn!(self.pool, conn => {
            subjects_mapping::table
                .filter(subjects_mapping::ingest_id.eq(ingest_id))
                .order(subjects_mapping::subject_id.asc())
                .select(SubjectMapRecord::as_select())
                .load(&mut conn)
                .await
        })?;
        records.into_iter().map(SubjectMapping::try_from).collect()
    }

    /// Return the mapping for `field_values`, allocating the next subject id
    /// and formatting a new code with `format_code` if there is none yet.
    pub async fn get_or_create<F>(
        &self,
        ingest_id: i64,
        field_values: &[String],
        format_code: F,
    ) -> Result<SubjectMapping>
    where
        F: Fn(i64) -> String + Send + 'static,
    {
        let key = serde_json::to_string(field_values)?;
        let record = match &self.pool {
            DbPool::Sqlite(pool) => {
                pool.blocking(move |conn| {
                    exclusive::subject_get_or_create(conn, ingest_id, &key, format_code)
                })
                .await?
            }
            #[cfg(feature = "postgres")]
            DbPool::Postgres(pool) => {
                Self::get_or_create_locked(pool, ingest_id, key, format_code).await?
            }
        };
        SubjectMapping::try_from(record)
    }

    #[cfg(feature = "postgres")]
    async fn get_or_create_locked<F>(
        pool: &PgPool,
        ingest_id: i64,
        key: String,
        format_code: F,
    ) -> Result<SubjectMapRecord>
    where
        F: Fn(i64) -> String + Send + 'static,
    {
        use diesel_async::AsyncConnection;

        let mut conn = pool.get().await?;
        conn.transaction::<_, RepositoryError, _>(|conn| {
            Box::pin(async move {
                diesel::sql_query("LOCK TABLE subjects_mapping IN EXCLUSIVE MODE")
                    .execute(conn)
                    .await?;

                let existing = subjects_mapping::table
                    .filter(subjects_mapping::ingest_id.eq(ingest_id))
                    .filter(subjects_mapping::field_values.eq(&key))
                    .select(SubjectMapRecord::as_select())
                    .first(conn)
                    .await
                    .optional()?;
                if let Some(record) = existing {
                    return Ok(record);
                }

                let last: Option<i64> = subjects_mapping::table
                    .filter(subjects_mapping::ingest_id.eq(ingest_id))
                    .select(diesel::dsl::max(subjects_mapping::subject_id))
                    .first(conn)
                    .await?;
                let subject_id = last.unwrap_or(0) + 1;
                let subject_code = format_code(subject_id);

                let record = diesel::insert_into(subjects_mapping::table)
                    .values(&NewSubjectMapRecord {
                        ingest_id,
                        subject_id,
                        subject_code: &subject_code,
                        field_values: &key,
                    })
                    .returning(SubjectMapRecord::as_returning())
                    .get_result(conn)
                    .await?;
                Ok(record)
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubjectCodeFormat;
    use tempfile::tempdir;

    fn fields(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_get_or_create_is_stable() {
        let dir = tempdir().unwrap();
        let repo = SubjectMapRepository::new(DbPool::sqlite_from_path(&dir.path().join("s.db")));
        repo.initialize().await.unwrap();
        let fmt = SubjectCodeFormat::parse("ex{SubjectCode:03d}").unwrap();

        let first = {
            let fmt = fmt.clone();
            repo.get_or_create(1, &fields(&["doe", "19700101"]), move |id| fmt.format(id))
                .await
                .unwrap()
        };
        let again = {
            let fmt = fmt.clone();
            repo.get_or_create(1, &fields(&["doe", "19700101"]), move |id| fmt.format(id))
                .await
                .unwrap()
        };
        assert_eq!(first.subject_code, "ex001");
        assert_eq!(again.subject_code, first.subject_code);
        assert_eq!(again.subject_id, first.subject_id);

        let other = repo
            .get_or_create(1, &fields(&["roe", "19800101"]), move |id| fmt.format(id))
            .await
            .unwrap();
        assert_eq!(other.subject_id, first.subject_id + 1);
        assert_eq!(other.subject_code, "ex002");

        // Ids are scoped per ingest.
        let elsewhere = repo
            .get_or_create(2, &fields(&["roe", "19800101"]), |id| id.to_string())
            .await
            .unwrap();
        assert_eq!(elsewhere.subject_id, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocation_is_unique() {
        let dir = tempdir().unwrap();
        let repo = SubjectMapRepository::new(DbPool::sqlite_from_path(&dir.path().join("s.db")));
        repo.initialize().await.unwrap();

        let mut handles = Vec::new();
        for n in 0..8 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                let key = vec![format!("patient-{}", n % 4)];
                repo.get_or_create(1, &key, |id| format!("S{id}")).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mappings = repo.list_for_ingest(1).await.unwrap();
        let ids: Vec<i64> = mappings.iter().map(|m| m.subject_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }
}
