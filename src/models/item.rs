//! Ingest item model.

use serde::{Deserialize, Serialize};

use super::context::ItemContext;
use crate::walker::combine;

/// Unit of uploadable content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    File,
    Packfile,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Packfile => "packfile",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "file" => Some(Self::File),
            "packfile" => Some(Self::Packfile),
            _ => None,
        }
    }
}

/// A file, or a group of files archived together, under one directory.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestItem {
    pub item_id: i64,
    pub ingest_id: i64,
    /// Directory of the item, relative to the ingest root.
    pub subdir: String,
    /// File names relative to `subdir`, in discovery order.
    pub files: Vec<String>,
    pub size: u64,
    pub item_type: ItemType,
    pub context: ItemContext,
}

impl IngestItem {
    /// Source paths of every file, relative to the ingest root.
    pub fn file_paths(&self) -> Vec<String> {
        self.files.iter().map(|f| combine(&self.subdir, f)).collect()
    }

    /// Path reported in the audit log.
    pub fn src_path(&self) -> String {
        match (self.item_type, self.files.as_slice()) {
            (ItemType::File, [file]) => combine(&self.subdir, file),
            _ => self.subdir.clone(),
        }
    }
}

/// Task that produced an item. A task that runs again skips the items it
/// already recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemSource {
    Discover(i64),
    Scan(i64),
}

#[derive(Debug, Clone)]
pub struct NewIngestItem {
    pub ingest_id: i64,
    pub subdir: String,
    pub files: Vec<String>,
    pub size: u64,
    pub item_type: ItemType,
    pub context: ItemContext,
    pub source: Option<ItemSource>,
}
