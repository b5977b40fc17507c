//! De-identification of `Key: Value` header files.

use std::collections::BTreeMap;
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{DeidError, DeidLogger, FileProfile, TagDictionary};
use crate::formats::HeaderFile;
use crate::walker::basename;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderDeidConfig {
    /// Fields dropped from the header.
    pub remove: Vec<String>,
    /// Fields overwritten with a fixed value.
    pub replace_with: BTreeMap<String, String>,
    /// Drop every field registered in the private tag dictionary.
    pub remove_private_tags: bool,
    /// File name globs this profile applies to; all header files when empty.
    pub filenames: Vec<String>,
}

pub struct HeaderFileProfile {
    config: HeaderDeidConfig,
    filenames: Option<GlobSet>,
    tags: Arc<dyn TagDictionary>,
    log: Option<Arc<dyn DeidLogger>>,
}

impl HeaderFileProfile {
    pub fn new(config: HeaderDeidConfig, tags: Arc<dyn TagDictionary>) -> Self {
        let filenames = build_filenames(&config.filenames);
        Self {
            config,
            filenames,
            tags,
            log: None,
        }
    }

    fn targets(&self, header: &HeaderFile) -> Vec<String> {
        header
            .fields()
            .map(|(key, _)| key)
            .filter(|key| {
                self.config.remove.iter().any(|r| r == key)
                    || self.config.replace_with.contains_key(*key)
                    || (self.config.remove_private_tags && self.tags.is_private(key))
            })
            .map(str::to_string)
            .collect()
    }
}

fn build_filenames(patterns: &[String]) -> Option<GlobSet> {
    if patterns.is_empty() {
        return None;
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => warn!("Ignoring invalid file name pattern '{}': {}", pattern, e),
        }
    }
    builder.build().ok()
}

impl FileProfile for HeaderFileProfile {
    fn name(&self) -> &str {
        "header"
    }

    fn matches(&self, path: &str) -> bool {
        match &self.filenames {
            Some(set) => set.is_match(basename(path)),
            None => true,
        }
    }

    fn set_log(&mut self, logger: Arc<dyn DeidLogger>) {
        self.log = Some(logger);
    }

    fn process(&self, path: &str, data: Vec<u8>) -> Result<Vec<u8>, DeidError> {
        let mut header = match HeaderFile::parse(&data) {
            Ok(header) => header,
            // Without an explicit filter, non-header files are not ours.
            Err(_) if self.filenames.is_none() => return Ok(data),
            Err(source) => {
                return Err(DeidError::Format {
                    path: path.to_string(),
                    source,
                })
            }
        };

        let targets = self.targets(&header);
        if targets.is_empty() {
            return Ok(data);
        }

        let before: BTreeMap<String, String> = targets
            .iter()
            .filter_map(|key| header.get(key).map(|v| (key.clone(), v.to_string())))
            .collect();

        let mut after = BTreeMap::new();
        for key in &targets {
            if let Some(value) = self.config.replace_with.get(key) {
                header.set(key, value.clone());
                after.insert(key.clone(), value.clone());
            } else {
                header.remove(key);
                after.insert(key.clone(), String::new());
            }
        }

        if let Some(log) = &self.log {
            log.write_entry(path, "before", before);
            log.write_entry(path, "after", after);
        }
        Ok(header.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deid::{CollectingLogger, InMemoryTagDictionary};
    use crate::models::PrivateTag;

    fn profile(config: HeaderDeidConfig) -> (HeaderFileProfile, Arc<CollectingLogger>) {
        let tags = Arc::new(InMemoryTagDictionary::new());
        tags.register(&PrivateTag {
            tag_id: 1,
            ingest_id: 1,
            private_creator: "ACME".into(),
            tag: "0019xx10".into(),
            vr: "LO".into(),
            description: "Scanner Serial".into(),
            vm: "1".into(),
        });
        let mut profile = HeaderFileProfile::new(config, tags);
        let logger = Arc::new(CollectingLogger::new());
        profile.set_log(logger.clone());
        (profile, logger)
    }

    #[test]
    fn test_header_deid_logs_before_and_after() {
        let mut replace_with = BTreeMap::new();
        replace_with.insert("PatientID".to_string(), "ANON".to_string());
        let (profile, logger) = profile(HeaderDeidConfig {
            remove: vec!["PatientName".into()],
            replace_with,
            remove_private_tags: true,
            filenames: vec![],
        });

        let data = b"PatientName: Doe^Jane\nPatientID: 42\nScannerSerial: SN1\nModality: MR\n\nBODY".to_vec();
        let out = profile.process("s1/a.hdr", data).unwrap();
        let header = HeaderFile::parse(&out).unwrap();

        assert_eq!(header.get("PatientName"), None);
        assert_eq!(header.get("PatientID"), Some("ANON"));
        assert_eq!(header.get("ScannerSerial"), None);
        assert_eq!(header.get("Modality"), Some("MR"));
        assert_eq!(header.body(), b"BODY");

        let entries = logger.take();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].log_type, "before");
        assert_eq!(entries[0].field_values["PatientName"], "Doe^Jane");
        assert_eq!(entries[1].log_type, "after");
        assert_eq!(entries[1].field_values["PatientID"], "ANON");
    }

    #[test]
    fn test_filename_filter() {
        let (profile, _) = profile(HeaderDeidConfig {
            remove: vec!["PatientName".into()],
            filenames: vec!["*.hdr".into()],
            ..HeaderDeidConfig::default()
        });
        assert!(profile.matches("s1/a.hdr"));
        assert!(!profile.matches("s1/a.txt"));
        assert!(profile.process("s1/b.hdr", b"binary\x00".to_vec()).is_err());
    }

    #[test]
    fn test_non_header_passes_through_without_filter() {
        let (profile, logger) = profile(HeaderDeidConfig {
            remove: vec!["PatientName".into()],
            ..HeaderDeidConfig::default()
        });
        let data = b"\x89PNG...".to_vec();
        assert_eq!(profile.process("x.png", data.clone()).unwrap(), data);
        assert!(logger.take().is_empty());
    }
}
