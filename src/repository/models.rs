//! Diesel row types and their conversion into domain models.
//!
//! Structured columns (`config`, `context`, `files`, `field_values`) are
//! JSON text; timestamps are RFC 3339 text.

use diesel::prelude::*;

use super::error::{RepositoryError, Result};
use super::util::parse_timestamp;
use crate::models::{
    AuditLog, DeidLog, DiscoverTask, IngestItem, IngestOperation, IngestStage, ItemContext,
    ItemType, PrivateTag, ScanTask, SubjectMapping, TaskStatus, WorkTask,
};
use crate::schema;

fn status(table: &'static str, raw: &str) -> Result<TaskStatus> {
    TaskStatus::from_str(raw)
        .ok_or_else(|| RepositoryError::corrupt(table, format!("unknown status '{raw}'")))
}

fn timestamp(table: &'static str, raw: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    parse_timestamp(raw)
        .ok_or_else(|| RepositoryError::corrupt(table, format!("bad timestamp '{raw}'")))
}

fn opt_timestamp(
    table: &'static str,
    raw: Option<&str>,
) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
    raw.map(|s| timestamp(table, s)).transpose()
}

fn context(table: &'static str, raw: &str) -> Result<ItemContext> {
    ItemContext::from_json(raw)
        .map_err(|e| RepositoryError::corrupt(table, format!("bad context: {e}")))
}

/// Ingest operation row.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = schema::ingest_operations)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct IngestRecord {
    pub ingest_id: i64,
    pub name: String,
    pub created: String,
    pub fs_path: String,
    pub config: String,
    pub stage: String,
    pub version: String,
    pub processing_start: Option<String>,
    pub processing_end: Option<String>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::ingest_operations)]
pub struct NewIngestRecord<'a> {
    pub name: &'a str,
    pub created: &'a str,
    pub fs_path: &'a str,
    pub config: &'a str,
    pub stage: &'a str,
    pub version: &'a str,
}

#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = schema::ingest_operations)]
pub struct IngestChangeset {
    pub name: Option<String>,
    pub config: Option<String>,
    pub processing_start: Option<Option<String>>,
    pub processing_end: Option<Option<String>>,
}

impl TryFrom<IngestRecord> for IngestOperation {
    type Error = RepositoryError;

    fn try_from(r: IngestRecord) -> Result<Self> {
        const TABLE: &str = "ingest_operations";
        let stage = IngestStage::from_str(&r.stage)
            .ok_or_else(|| RepositoryError::corrupt(TABLE, format!("unknown stage '{}'", r.stage)))?;
        let config = serde_json::from_str(&r.config)
            .map_err(|e| RepositoryError::corrupt(TABLE, format!("bad config: {e}")))?;
        Ok(IngestOperation {
            ingest_id: r.ingest_id,
            name: r.name,
            created: timestamp(TABLE, &r.created)?,
            fs_path: r.fs_path,
            config,
            stage,
            version: r.version,
            processing_start: opt_timestamp(TABLE, r.processing_start.as_deref())?,
            processing_end: opt_timestamp(TABLE, r.processing_end.as_deref())?,
        })
    }
}

/// Ingest item row.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = schema::ingest_items)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ItemRecord {
    pub item_id: i64,
    pub ingest_id: i64,
    pub subdir: String,
    pub files: String,
    pub size: i64,
    pub item_type: String,
    pub context: String,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::ingest_items)]
pub struct NewItemRecord<'a> {
    pub ingest_id: i64,
    pub subdir: &'a str,
    pub files: &'a str,
    pub size: i64,
    pub item_type: &'a str,
    pub context: &'a str,
    pub discover_task_id: Option<i64>,
    pub scan_task_id: Option<i64>,
}

impl TryFrom<ItemRecord> for IngestItem {
    type Error = RepositoryError;

    fn try_from(r: ItemRecord) -> Result<Self> {
        const TABLE: &str = "ingest_items";
        let item_type = ItemType::from_str(&r.item_type).ok_or_else(|| {
            RepositoryError::corrupt(TABLE, format!("unknown item type '{}'", r.item_type))
        })?;
        let files = serde_json::from_str(&r.files)
            .map_err(|e| RepositoryError::corrupt(TABLE, format!("bad file list: {e}")))?;
        Ok(IngestItem {
            item_id: r.item_id,
            ingest_id: r.ingest_id,
            subdir: r.subdir,
            files,
            size: r.size.max(0) as u64,
            item_type,
            context: context(TABLE, &r.context)?,
        })
    }
}

/// Discover queue row.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = schema::discover_queue)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DiscoverTaskRecord {
    pub task_id: i64,
    pub ingest_id: i64,
    pub actor_id: Option<String>,
    pub status: String,
    pub claimed_at: Option<String>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::discover_queue)]
pub struct NewDiscoverTaskRecord<'a> {
    pub ingest_id: i64,
    pub status: &'a str,
}

#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = schema::discover_queue)]
pub struct DiscoverTaskChangeset {
    pub status: Option<String>,
    pub actor_id: Option<Option<String>>,
    pub claimed_at: Option<Option<String>>,
}

impl TryFrom<DiscoverTaskRecord> for DiscoverTask {
    type Error = RepositoryError;

    fn try_from(r: DiscoverTaskRecord) -> Result<Self> {
        const TABLE: &str = "discover_queue";
        Ok(DiscoverTask {
            task_id: r.task_id,
            ingest_id: r.ingest_id,
            actor_id: r.actor_id,
            status: status(TABLE, &r.status)?,
            claimed_at: opt_timestamp(TABLE, r.claimed_at.as_deref())?,
        })
    }
}

/// Scan queue row.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = schema::scan_queue)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ScanTaskRecord {
    pub task_id: i64,
    pub ingest_id: i64,
    pub path: String,
    pub context: String,
    pub scanner_type: String,
    pub actor_id: Option<String>,
    pub status: String,
    pub claimed_at: Option<String>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::scan_queue)]
pub struct NewScanTaskRecord<'a> {
    pub ingest_id: i64,
    pub path: &'a str,
    pub context: &'a str,
    pub scanner_type: &'a str,
    pub status: &'a str,
    pub discover_task_id: Option<i64>,
}

#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = schema::scan_queue)]
pub struct ScanTaskChangeset {
    pub status: Option<String>,
    pub actor_id: Option<Option<String>>,
    pub claimed_at: Option<Option<String>>,
    pub context: Option<String>,
}

impl TryFrom<ScanTaskRecord> for ScanTask {
    type Error = RepositoryError;

    fn try_from(r: ScanTaskRecord) -> Result<Self> {
        const TABLE: &str = "scan_queue";
        Ok(ScanTask {
            task_id: r.task_id,
            ingest_id: r.ingest_id,
            path: r.path,
            context: context(TABLE, &r.context)?,
            scanner_type: r.scanner_type,
            actor_id: r.actor_id,
            status: status(TABLE, &r.status)?,
            claimed_at: opt_timestamp(TABLE, r.claimed_at.as_deref())?,
        })
    }
}

/// Work queue row.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = schema::work_queue)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct WorkTaskRecord {
    pub task_id: i64,
    pub item_id: i64,
    pub ingest_id: i64,
    pub context: String,
    pub actor_id: Option<String>,
    pub status: String,
    pub claimed_at: Option<String>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::work_queue)]
pub struct NewWorkTaskRecord<'a> {
    pub item_id: i64,
    pub ingest_id: i64,
    pub context: &'a str,
    pub status: &'a str,
}

#[derive(AsChangeset, Debug, Default)]
#[diesel(table_name = schema::work_queue)]
pub struct WorkTaskChangeset {
    pub status: Option<String>,
    pub actor_id: Option<Option<String>>,
    pub claimed_at: Option<Option<String>>,
    pub context: Option<String>,
}

impl TryFrom<WorkTaskRecord> for WorkTask {
    type Error = RepositoryError;

    fn try_from(r: WorkTaskRecord) -> Result<Self> {
        const TABLE: &str = "work_queue";
        Ok(WorkTask {
            task_id: r.task_id,
            item_id: r.item_id,
            ingest_id: r.ingest_id,
            context: context(TABLE, &r.context)?,
            actor_id: r.actor_id,
            status: status(TABLE, &r.status)?,
            claimed_at: opt_timestamp(TABLE, r.claimed_at.as_deref())?,
        })
    }
}

/// Audit log row.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = schema::audit_logs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct AuditLogRecord {
    pub log_id: i64,
    pub ingest_id: i64,
    pub src_path: String,
    pub fw_path: Option<String>,
    pub failed: bool,
    pub message: Option<String>,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::audit_logs)]
pub struct NewAuditLogRecord<'a> {
    pub ingest_id: i64,
    pub src_path: &'a str,
    pub fw_path: Option<&'a str>,
    pub failed: bool,
    pub message: Option<&'a str>,
}

impl From<AuditLogRecord> for AuditLog {
    fn from(r: AuditLogRecord) -> Self {
        AuditLog {
            log_id: r.log_id,
            ingest_id: r.ingest_id,
            src_path: r.src_path,
            fw_path: r.fw_path,
            failed: r.failed,
            message: r.message,
        }
    }
}

/// De-identification log row.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = schema::deid_logs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct DeidLogRecord {
    pub log_id: i64,
    pub ingest_id: i64,
    pub path: String,
    pub log_type: String,
    pub field_values: String,
    pub created: String,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::deid_logs)]
pub struct NewDeidLogRecord {
    pub ingest_id: i64,
    pub path: String,
    pub log_type: String,
    pub field_values: String,
    pub created: String,
}

impl TryFrom<DeidLogRecord> for DeidLog {
    type Error = RepositoryError;

    fn try_from(r: DeidLogRecord) -> Result<Self> {
        const TABLE: &str = "deid_logs";
        let field_values = serde_json::from_str(&r.field_values)
            .map_err(|e| RepositoryError::corrupt(TABLE, format!("bad field values: {e}")))?;
        Ok(DeidLog {
            log_id: r.log_id,
            ingest_id: r.ingest_id,
            path: r.path,
            log_type: r.log_type,
            field_values,
            created: timestamp(TABLE, &r.created)?,
        })
    }
}

/// Subject mapping row.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = schema::subjects_mapping)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SubjectMapRecord {
    pub map_id: i64,
    pub ingest_id: i64,
    pub subject_id: i64,
    pub subject_code: String,
    pub field_values: String,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::subjects_mapping)]
pub struct NewSubjectMapRecord<'a> {
    pub ingest_id: i64,
    pub subject_id: i64,
    pub subject_code: &'a str,
    pub field_values: &'a str,
}

impl TryFrom<SubjectMapRecord> for SubjectMapping {
    type Error = RepositoryError;

    fn try_from(r: SubjectMapRecord) -> Result<Self> {
        let field_values = serde_json::from_str(&r.field_values).map_err(|e| {
            RepositoryError::corrupt("subjects_mapping", format!("bad field values: {e}"))
        })?;
        Ok(SubjectMapping {
            map_id: r.map_id,
            ingest_id: r.ingest_id,
            subject_id: r.subject_id,
            subject_code: r.subject_code,
            field_values,
        })
    }
}

/// Private tag row.
#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = schema::private_tags)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PrivateTagRecord {
    pub tag_id: i64,
    pub ingest_id: i64,
    pub private_creator: String,
    pub tag: String,
    pub vr: String,
    pub description: String,
    pub vm: String,
}

#[derive(Insertable, Debug)]
#[diesel(table_name = schema::private_tags)]
pub struct NewPrivateTagRecord<'a> {
    pub ingest_id: i64,
    pub private_creator: &'a str,
    pub tag: &'a str,
    pub vr: &'a str,
    pub description: &'a str,
    pub vm: &'a str,
}

impl From<PrivateTagRecord> for PrivateTag {
    fn from(r: PrivateTagRecord) -> Self {
        PrivateTag {
            tag_id: r.tag_id,
            ingest_id: r.ingest_id,
            private_creator: r.private_creator,
            tag: r.tag,
            vr: r.vr,
            description: r.description,
            vm: r.vm,
        }
    }
}
