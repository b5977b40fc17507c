//! De-identification profiles.
//!
//! A [`DeidProfile`] is a named bundle of [`FileProfile`]s. Each file profile
//! decides whether it handles a file, rewrites it, and reports the before
//! and after values of every field it touched to a [`DeidLogger`].

mod header;
mod tags;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::formats::HeaderError;

pub use header::{HeaderDeidConfig, HeaderFileProfile};
pub use tags::{InMemoryTagDictionary, TagDictionary};

#[derive(Error, Debug)]
pub enum DeidError {
    #[error("Cannot de-identify {path}: {source}")]
    Format { path: String, source: HeaderError },

    #[error("Unknown de-identification profile: {0}")]
    UnknownProfile(String),
}

/// Subject code assignment settings of a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectsMappingConfig {
    /// Fields whose values identify a subject.
    pub fields: Vec<String>,
    /// Code format, e.g. `ex{SubjectCode:04d}`.
    #[serde(default = "default_code_format")]
    pub format: String,
    /// CSV of mappings from an earlier run, loaded before discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_from: Option<PathBuf>,
    /// Where to write the mapping CSV when the run completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_to: Option<PathBuf>,
}

fn default_code_format() -> String {
    "{SubjectCode}".to_string()
}

/// Serialized form of a de-identification profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeidProfileConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<HeaderDeidConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subjects_mapping: Option<SubjectsMappingConfig>,
    /// Where to write the de-identification log CSV when the run completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deid_log: Option<PathBuf>,
}

impl DeidProfileConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            header: None,
            subjects_mapping: None,
            deid_log: None,
        }
    }
}

/// Names of the profiles that are always available.
pub const BUILTIN_PROFILES: [&str; 2] = ["minimal", "none"];

fn builtin_profile(name: &str) -> Option<DeidProfileConfig> {
    match name {
        "minimal" => Some(DeidProfileConfig {
            header: Some(HeaderDeidConfig {
                remove: vec![
                    "PatientName".to_string(),
                    "PatientID".to_string(),
                    "PatientBirthDate".to_string(),
                ],
                remove_private_tags: true,
                ..HeaderDeidConfig::default()
            }),
            ..DeidProfileConfig::new("minimal")
        }),
        "none" => Some(DeidProfileConfig::new("none")),
        _ => None,
    }
}

/// Look up a profile by name, preferring `custom` over the built-ins.
pub fn profile_config(name: &str, custom: &[DeidProfileConfig]) -> Option<DeidProfileConfig> {
    custom
        .iter()
        .find(|p| p.name == name)
        .cloned()
        .or_else(|| builtin_profile(name))
}

/// One before/after record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeidLogEntry {
    pub path: String,
    pub log_type: String,
    pub field_values: BTreeMap<String, String>,
}

pub trait DeidLogger: Send + Sync {
    fn write_entry(&self, path: &str, log_type: &str, field_values: BTreeMap<String, String>);
}

/// Buffers entries until the caller persists them.
#[derive(Default)]
pub struct CollectingLogger {
    entries: Mutex<Vec<DeidLogEntry>>,
}

impl CollectingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything logged so far.
    pub fn take(&self) -> Vec<DeidLogEntry> {
        match self.entries.lock() {
            Ok(mut entries) => std::mem::take(&mut *entries),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl DeidLogger for CollectingLogger {
    fn write_entry(&self, path: &str, log_type: &str, field_values: BTreeMap<String, String>) {
        let entry = DeidLogEntry {
            path: path.to_string(),
            log_type: log_type.to_string(),
            field_values,
        };
        match self.entries.lock() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}

/// Format-specific part of a profile.
pub trait FileProfile: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this profile handles the file at `path`.
    fn matches(&self, path: &str) -> bool;

    fn set_log(&mut self, logger: Arc<dyn DeidLogger>);

    /// Return the de-identified contents of `data`.
    fn process(&self, path: &str, data: Vec<u8>) -> Result<Vec<u8>, DeidError>;
}

/// A loaded profile.
pub struct DeidProfile {
    name: String,
    file_profiles: Vec<Box<dyn FileProfile>>,
    subjects_mapping: Option<SubjectsMappingConfig>,
}

impl DeidProfile {
    /// Build a profile. Private tags known to `tags` are treated as
    /// identifying when the header profile asks for it.
    pub fn from_config(config: &DeidProfileConfig, tags: Arc<dyn TagDictionary>) -> Self {
        let mut file_profiles: Vec<Box<dyn FileProfile>> = Vec::new();
        if let Some(header) = &config.header {
            file_profiles.push(Box::new(HeaderFileProfile::new(header.clone(), tags)));
        }
        Self {
            name: config.name.clone(),
            file_profiles,
            subjects_mapping: config.subjects_mapping.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subjects_mapping(&self) -> Option<&SubjectsMappingConfig> {
        self.subjects_mapping.as_ref()
    }

    pub fn set_log(&mut self, logger: Arc<dyn DeidLogger>) {
        for profile in &mut self.file_profiles {
            profile.set_log(logger.clone());
        }
    }

    pub fn file_profile_for(&self, path: &str) -> Option<&dyn FileProfile> {
        self.file_profiles
            .iter()
            .find(|p| p.matches(path))
            .map(|p| p.as_ref())
    }

    /// De-identify one file, or pass it through when no file profile applies.
    pub fn process_file(&self, path: &str, data: Vec<u8>) -> Result<Vec<u8>, DeidError> {
        match self.file_profile_for(path) {
            Some(profile) => profile.process(path, data),
            None => Ok(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_lookup() {
        let mut custom = DeidProfileConfig::new("minimal");
        custom.deid_log = Some(PathBuf::from("deid.csv"));

        assert!(profile_config("minimal", &[]).unwrap().header.is_some());
        assert!(profile_config("none", &[]).unwrap().header.is_none());
        assert!(profile_config("study", &[]).is_none());
        // Custom definitions shadow the built-ins.
        let found = profile_config("minimal", &[custom.clone()]).unwrap();
        assert_eq!(found, custom);
    }

    #[test]
    fn test_none_profile_passes_through() {
        let tags: Arc<dyn TagDictionary> = Arc::new(InMemoryTagDictionary::new());
        let profile = DeidProfile::from_config(&profile_config("none", &[]).unwrap(), tags);
        let data = b"PatientName: Doe\n\n".to_vec();
        assert_eq!(profile.process_file("a.hdr", data.clone()).unwrap(), data);
    }
}
