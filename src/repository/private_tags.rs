//! Private tag dictionary mapper.

use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use super::error::{RepositoryError, Result};
use super::models::{NewPrivateTagRecord, PrivateTagRecord};
use super::pool::DbPool;
use super::store::Column;
use crate::models::{NewPrivateTag, PrivateTag};
use crate::schema::private_tags;
use crate::with_conn;

#[derive(Clone)]
pub struct PrivateTagRepository {
    pool: DbPool,
}

impl PrivateTagRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        self.pool
            .create_autoincrement_table(
                "private_tags",
                "tag_id",
                &[
                    Column::bigint("ingest_id"),
                    Column::text("private_creator"),
                    Column::text("tag"),
                    Column::text("vr"),
                    Column::text("description"),
                    Column::text("vm"),
                ],
            )
            .await?;
        self.pool
            .create_index("private_tags", &["ingest_id"], false)
            .await
    }

    pub async fn insert(&self, ingest_id: i64, tag: &NewPrivateTag) -> Result<i64> {
        if tag.private_creator.trim().is_empty() || tag.tag.trim().is_empty() {
            return Err(RepositoryError::Validation(
                "private tag requires a creator and a tag".to_string(),
            ));
        }
        let record = NewPrivateTagRecord {
            ingest_id,
            private_creator: &tag.private_creator,
            tag: &tag.tag,
            vr: &tag.vr,
            description: &tag.description,
            vm: &tag.vm,
        };
        let tag_id = with_conn!(self.pool, conn => {
            diesel::insert_into(private_tags::table)
                .values(&record)
                .returning(private_tags::tag_id)
                .get_result::<i64>(&mut conn)
                .await
        })?;
        Ok(tag_id)
    }

    pub async fn list_for_ingest(&self, ingest_id: i64) -> Result<Vec<PrivateTag>> {
        let records = with_conn!(self.pool, conn => {
            private_tags::table
                .filter(private_tags::ingest_id.eq(ingest_id))
                .order(private_tags::tag_id.asc())
                .select(PrivateTagRecord::as_select())
                .load(&mut conn)
                .await
        })?;
        Ok(records.into_iter().map(PrivateTag::from).collect())
    }
}
