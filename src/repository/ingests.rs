//! Ingest operation mapper.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use super::error::{RepositoryError, Result};
use super::models::{IngestChangeset, IngestRecord, NewIngestRecord};
use super::pool::DbPool;
use super::store::Column;
use super::util::{format_timestamp, now_timestamp};
use crate::config::ImporterConfig;
use crate::models::{IngestOperation, IngestStage, NewIngest};
use crate::schema::ingest_operations;
use crate::with_conn;

/// Partial update of an ingest operation. Stage changes go through
/// [`IngestRepository::set_stage`].
#[derive(Debug, Clone, Default)]
pub struct IngestUpdate {
    pub name: Option<String>,
    pub config: Option<ImporterConfig>,
    pub processing_start: Option<Option<DateTime<Utc>>>,
    pub processing_end: Option<Option<DateTime<Utc>>>,
}

#[derive(Clone)]
pub struct IngestRepository {
    pool: DbPool,
}

impl IngestRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        self.pool
            .create_autoincrement_table(
                "ingest_operations",
                "ingest_id",
                &[
                    Column::text("name"),
                    Column::text("created"),
                    Column::text("fs_path"),
                    Column::text("config"),
                    Column::text("stage"),
                    Column::text("version"),
                    Column::text("processing_start").nullable(),
                    Column::text("processing_end").nullable(),
                ],
            )
            .await?;
        self.pool
            .create_index("ingest_operations", &["stage"], false)
            .await
    }

    /// Record a new ingest operation in the `discovering` stage.
    pub async fn insert(&self, ingest: &NewIngest) -> Result<IngestOperation> {
        if ingest.name.trim().is_empty() {
            return Err(RepositoryError::Validation(
                "ingest requires a name".to_string(),
            ));
        }
        if ingest.fs_path.trim().is_empty() {
            return Err(RepositoryError::Validation(
                "ingest requires a source path".to_string(),
            ));
        }

        let config = serde_json::to_string(&ingest.config)?;
        let created = now_timestamp();
        let record = NewIngestRecord {
            name: &ingest.name,
            created: &created,
            fs_path: &ingest.fs_path,
            config: &config,
            stage: IngestStage::Discovering.as_str(),
            version: env!("CARGO_PKG_VERSION"),
        };

        let inserted = with_conn!(self.pool, conn => {
            diesel::insert_into(ingest_operations::table)
                .values(&record)
                .returning(IngestRecord::as_returning())
                .get_result(&mut conn)
                .await
        })?;
        IngestOperation::try_from(inserted)
    }

    pub async fn find(&self, ingest_id: i64) -> Result<Option<IngestOperation>> {
        let record = with_conn!(self.pool, conn => {
            ingest_operations::table
                .find(ingest_id)
                .select(IngestRecord::as_select())
                .first(&mut conn)
                .await
                .optional()
        })?;
        record.map(IngestOperation::try_from).transpose()
    }

    /// Like [`find`](Self::find) but a missing ingest is an error.
    pub async fn get(&self, ingest_id: i64) -> Result<IngestOperation> {
        self.find(ingest_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("ingest {ingest_id}")))
    }

    /// All ingests, newest first.
    pub async fn list(&self) -> Result<Vec<IngestOperation>> {
        let records = with_conn!(self.pool, conn => {
            ingest_operations::table
                .order(ingest_operations::ingest_id.desc())
                .select(IngestRecord::as_select())
                .load(&mut conn)
                .await
        })?;
        records.into_iter().map(IngestOperation::try_from).collect()
    }

    pub async fn update(&self, ingest_id: i64, update: IngestUpdate) -> Result<()> {
        let changeset = IngestChangeset {
            name: update.name,
            config: update
                .config
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            processing_start: update
                .processing_start
                .map(|ts| ts.map(format_timestamp)),
            processing_end: update.processing_end.map(|ts| ts.map(format_timestamp)),
        };
        if changeset.name.is_none()
            && changeset.config.is_none()
            && changeset.processing_start.is_none()
            && changeset.processing_end.is_none()
        {
            return Ok(());
        }

        let updated = with_conn!(self.pool, conn => {
            diesel::update(ingest_operations::table.find(ingest_id))
                .set(&changeset)
                .execute(&mut conn)
                .await
        })?;
        if updated == 0 {
            return Err(RepositoryError::NotFound(format!("ingest {ingest_id}")));
        }
        Ok(())
    }

    /// Move an ingest to `stage`.
    ///
    /// The update only matches rows whose current stage may precede `stage`,
    /// so concurrent callers cannot move an ingest backwards. Setting the
    /// current stage again is a no-op.
    pub async fn set_stage(&self, ingest_id: i64, stage: IngestStage) -> Result<()> {
        let allowed: Vec<&str> = stage
            .predecessors()
            .iter()
            .chain(std::iter::once(&stage))
            .map(|s| s.as_str())
            .collect();

        let updated = with_conn!(self.pool, conn => {
            diesel::update(
                ingest_operations::table
                    .filter(ingest_operations::ingest_id.eq(ingest_id))
                    .filter(ingest_operations::stage.eq_any(allowed.clone())),
            )
            .set(ingest_operations::stage.eq(stage.as_str()))
            .execute(&mut conn)
            .await
        })?;

        if updated == 0 {
            let current = self.get(ingest_id).await?;
            return Err(RepositoryError::InvalidStageTransition {
                ingest_id,
                from: current.stage.to_string(),
                to: stage.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn new_ingest() -> NewIngest {
        NewIngest {
            name: "test".to_string(),
            fs_path: "/data/source".to_string(),
            config: ImporterConfig::for_folder(PathBuf::from("/data/source")),
        }
    }

    #[tokio::test]
    async fn test_stage_is_monotonic() {
        let dir = tempdir().unwrap();
        let repo = IngestRepository::new(DbPool::sqlite_from_path(&dir.path().join("t.db")));
        repo.initialize().await.unwrap();

        let ingest = repo.insert(&new_ingest()).await.unwrap();
        assert_eq!(ingest.stage, IngestStage::Discovering);
        assert_eq!(ingest.version, env!("CARGO_PKG_VERSION"));

        let err = repo
            .set_stage(ingest.ingest_id, IngestStage::Complete)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidStageTransition { .. }));

        repo.set_stage(ingest.ingest_id, IngestStage::Importing)
            .await
            .unwrap();
        repo.set_stage(ingest.ingest_id, IngestStage::Importing)
            .await
            .unwrap();
        repo.set_stage(ingest.ingest_id, IngestStage::Complete)
            .await
            .unwrap();

        let err = repo
            .set_stage(ingest.ingest_id, IngestStage::Aborted)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidStageTransition { .. }));
    }

    #[tokio::test]
    async fn test_update_timestamps() {
        let dir = tempdir().unwrap();
        let repo = IngestRepository::new(DbPool::sqlite_from_path(&dir.path().join("t.db")));
        repo.initialize().await.unwrap();
        let ingest = repo.insert(&new_ingest()).await.unwrap();

        let started = Utc::now();
        repo.update(
            ingest.ingest_id,
            IngestUpdate {
                processing_start: Some(Some(started)),
                ..IngestUpdate::default()
            },
        )
        .await
        .unwrap();

        let loaded = repo.get(ingest.ingest_id).await.unwrap();
        assert_eq!(
            loaded.processing_start.map(|t| t.timestamp_micros()),
            Some(started.timestamp_micros())
        );
        assert!(loaded.processing_end.is_none());
        assert!(repo.find(ingest.ingest_id + 100).await.unwrap().is_none());
    }
}
