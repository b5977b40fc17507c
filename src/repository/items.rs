//! Ingest item mapper.

use std::collections::HashSet;

use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use super::error::{RepositoryError, Result};
use super::models::{ItemRecord, NewItemRecord};
use super::pool::DbPool;
use super::store::Column;
use crate::models::{IngestItem, ItemContext, ItemSource, ItemType, NewIngestItem};
use crate::schema::ingest_items;
use crate::with_conn;

#[derive(Clone)]
pub struct ItemRepository {
    pool: DbPool,
}

impl ItemRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        self.pool
            .create_autoincrement_table(
                "ingest_items",
                "item_id",
                &[
                    Column::bigint("ingest_id"),
                    Column::text("subdir"),
                    Column::text("files"),
                    Column::bigint("size"),
                    Column::text("item_type"),
                    Column::text("context"),
                    Column::bigint("discover_task_id").nullable(),
                    Column::bigint("scan_task_id").nullable(),
                ],
            )
            .await?;
        self.pool
            .create_index("ingest_items", &["ingest_id"], false)
            .await?;
        self.pool
            .create_index("ingest_items", &["discover_task_id"], false)
            .await?;
        self.pool
            .create_index("ingest_items", &["scan_task_id"], false)
            .await
    }

    pub async fn insert(&self, item: &NewIngestItem) -> Result<i64> {
        if item.ingest_id <= 0 {
            return Err(RepositoryError::Validation(
                "item requires an ingest_id".to_string(),
            ));
        }
        match (item.item_type, item.files.len()) {
            (_, 0) => {
                return Err(RepositoryError::Validation(format!(
                    "item under '{}' has no files",
                    item.subdir
                )))
            }
            (ItemType::File, n) if n > 1 => {
                return Err(RepositoryError::Validation(format!(
                    "file item under '{}' lists {n} files",
                    item.subdir
                )))
            }
            _ => {}
        }

        let files = serde_json::to_string(&item.files)?;
        let context = item.context.to_json()?;
        let record = NewItemRecord {
            ingest_id: item.ingest_id,
            subdir: &item.subdir,
            files: &files,
            size: i64::try_from(item.size).unwrap_or(i64::MAX),
            item_type: item.item_type.as_str(),
            context: &context,
            discover_task_id: match item.source {
                Some(ItemSource::Discover(id)) => Some(id),
                _ => None,
            },
            scan_task_id: match item.source {
                Some(ItemSource::Scan(id)) => Some(id),
                _ => None,
            },
        };

        let item_id = with_conn!(self.pool, conn => {
            diesel::insert_into(ingest_items::table)
                .values(&record)
                .returning(ingest_items::item_id)
                .get_result::<i64>(&mut conn)
                .await
        })?;
        Ok(item_id)
    }

    pub async fn find(&self, item_id: i64) -> Result<Option<IngestItem>> {
        let record = with_conn!(self.pool, conn => {
            ingest_items::table
                .find(item_id)
                .select(ItemRecord::as_select())
                .first(&mut conn)
                .await
                .optional()
        })?;
        record.map(IngestItem::try_from).transpose()
    }

    pub async fn list_for_ingest(&self, ingest_id: i64) -> Result<Vec<IngestItem>> {
        let records = with_conn!(self.pool, conn => {
            ingest_items::table
                .filter(ingest_items::ingest_id.eq(ingest_id))
                .order(ingest_items::item_id.asc())
                .select(ItemRecord::as_select())
                .load(&mut conn)
                .await
        })?;
        records.into_iter().map(IngestItem::try_from).collect()
    }

    /// `(subdir, files)` of every item a task has already recorded.
    pub async fn recorded_by(&self, source: ItemSource) -> Result<HashSet<(String, Vec<String>)>> {
        let rows: Vec<(String, String)> = with_conn!(self.pool, conn => {
            let query = ingest_items::table
                .select((ingest_items::subdir, ingest_items::files))
                .into_boxed();
            let query = match source {
                ItemSource::Discover(id) => query.filter(ingest_items::discover_task_id.eq(id)),
                ItemSource::Scan(id) => query.filter(ingest_items::scan_task_id.eq(id)),
            };
            query.load(&mut conn).await
        })?;
        rows.into_iter()
            .map(|(subdir, files)| {
                let files = serde_json::from_str(&files).map_err(|e| {
                    RepositoryError::corrupt("ingest_items", format!("bad file list: {e}"))
                })?;
                Ok((subdir, files))
            })
            .collect()
    }

    pub async fn count_for_ingest(&self, ingest_id: i64) -> Result<u64> {
        let count: i64 = with_conn!(self.pool, conn => {
            ingest_items::table
                .filter(ingest_items::ingest_id.eq(ingest_id))
                .count()
                .get_result(&mut conn)
                .await
        })?;
        Ok(count.max(0) as u64)
    }

    /// Replace an item's context, e.g. after its target container is resolved.
    pub async fn update_context(&self, item_id: i64, context: &ItemContext) -> Result<()> {
        let context = context.to_json()?;
        let updated = with_conn!(self.pool, conn => {
            diesel::update(ingest_items::table.find(item_id))
                .set(ingest_items::context.eq(&context))
                .execute(&mut conn)
                .await
        })?;
        if updated == 0 {
            return Err(RepositoryError::NotFound(format!("item {item_id}")));
        }
        Ok(())
    }
}
