//! Format-specific scanners.
//!
//! Discovery hands a directory to a scanner when the template marks it with
//! `scan: <type>`. The scanner reads the files and decides how they group
//! into items, which plain directory discovery cannot do.

mod header;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;

use crate::deid::TagDictionary;
use crate::formats::HeaderError;
use crate::models::{ItemContext, ItemType};
use crate::walker::{Walker, WalkerError};

pub use header::HeaderScanner;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Walker(#[from] WalkerError),

    #[error("Cannot read {path}: {source}")]
    Header { path: String, source: HeaderError },

    #[error("{path} has no {field}")]
    MissingField { path: String, field: &'static str },

    #[error("Unknown scanner type: {0}")]
    UnknownScanner(String),
}

/// An item produced by a scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedItem {
    pub subdir: String,
    /// Paths relative to `subdir`.
    pub files: Vec<String>,
    pub size: u64,
    pub item_type: ItemType,
    pub context: ItemContext,
    /// Identifying fields read from the files, for subject code mapping.
    pub fields: BTreeMap<String, String>,
}

pub trait Scanner: Send + Sync {
    fn scanner_type(&self) -> &str;

    /// Scan the tree under `path`. Blocking; run it off the async runtime.
    ///
    /// `tags` holds the private tags registered for the ingest.
    fn scan(
        &self,
        walker: &dyn Walker,
        path: &str,
        context: &ItemContext,
        tags: &dyn TagDictionary,
    ) -> Result<Vec<ScannedItem>, ScanError>;
}

/// Scanners by type name.
#[derive(Clone)]
pub struct ScannerRegistry {
    scanners: HashMap<String, Arc<dyn Scanner>>,
}

impl ScannerRegistry {
    pub fn empty() -> Self {
        Self {
            scanners: HashMap::new(),
        }
    }

    pub fn register(&mut self, scanner: Arc<dyn Scanner>) {
        self.scanners
            .insert(scanner.scanner_type().to_string(), scanner);
    }

    pub fn get(&self, scanner_type: &str) -> Result<Arc<dyn Scanner>, ScanError> {
        self.scanners
            .get(scanner_type)
            .cloned()
            .ok_or_else(|| ScanError::UnknownScanner(scanner_type.to_string()))
    }

    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.scanners.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl Default for ScannerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(HeaderScanner));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let registry = ScannerRegistry::default();
        assert_eq!(registry.types(), vec!["header"]);
        assert!(registry.get("header").is_ok());
        assert!(matches!(
            registry.get("dicom"),
            Err(ScanError::UnknownScanner(t)) if t == "dicom"
        ));
    }
}
