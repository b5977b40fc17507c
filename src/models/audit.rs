//! Append-only audit trails: upload outcomes and de-identification actions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Outcome of one item upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditLog {
    pub log_id: i64,
    pub ingest_id: i64,
    pub src_path: String,
    pub fw_path: Option<String>,
    pub failed: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewAuditLog {
    pub ingest_id: i64,
    pub src_path: String,
    pub fw_path: Option<String>,
    pub failed: bool,
    pub message: Option<String>,
}

impl NewAuditLog {
    pub fn completed(ingest_id: i64, src_path: String, fw_path: String) -> Self {
        Self {
            ingest_id,
            src_path,
            fw_path: Some(fw_path),
            failed: false,
            message: Some("Completed".to_string()),
        }
    }

    pub fn failed(
        ingest_id: i64,
        src_path: String,
        fw_path: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            ingest_id,
            src_path,
            fw_path,
            failed: true,
            message: Some(message.into()),
        }
    }
}

/// One de-identification record, before or after values of a file's fields.
#[derive(Debug, Clone, PartialEq)]
pub struct DeidLog {
    pub log_id: i64,
    pub ingest_id: i64,
    pub path: String,
    pub log_type: String,
    pub field_values: BTreeMap<String, String>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDeidLog {
    pub ingest_id: i64,
    pub path: String,
    pub log_type: String,
    pub field_values: BTreeMap<String, String>,
}
