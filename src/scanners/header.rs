//! Scanner for `Key: Value` header files.
//!
//! Files are grouped into series by `StudyInstanceUID` and
//! `SeriesInstanceUID`; every series becomes one packfile item.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use super::{ScanError, ScannedItem, Scanner};
use crate::deid::TagDictionary;
use crate::formats::{read_header, HeaderError};
use crate::models::{ContainerType, ItemContext, ItemType, NodeContext, PackfileSpec};
use crate::walker::{combine, relpath, Walker};

const STUDY_UID: &str = "StudyInstanceUID";
const SERIES_UID: &str = "SeriesInstanceUID";
const PACKFILE_TYPE: &str = "header";

pub struct HeaderScanner;

struct Series {
    files: Vec<String>,
    size: u64,
    fields: BTreeMap<String, String>,
}

impl Scanner for HeaderScanner {
    fn scanner_type(&self) -> &str {
        "header"
    }

    fn scan(
        &self,
        walker: &dyn Walker,
        path: &str,
        context: &ItemContext,
        tags: &dyn TagDictionary,
    ) -> Result<Vec<ScannedItem>, ScanError> {
        let mut series: BTreeMap<(String, String), Series> = BTreeMap::new();

        for listing in walker.walk(path, None)? {
            for file in &listing.files {
                let file_path = combine(&listing.root, &file.name);
                let fields = match read_header(walker.open(&file_path)?) {
                    // Vendor-private values are not identity fields.
                    Ok(fields) => fields
                        .into_iter()
                        .filter(|(key, _)| !tags.is_private(key))
                        .collect::<BTreeMap<_, _>>(),
                    Err(HeaderError::NotHeader(reason)) => {
                        warn!("Skipping {}: {}", file_path, reason);
                        continue;
                    }
                    Err(source) => {
                        return Err(ScanError::Header {
                            path: file_path,
                            source,
                        })
                    }
                };

                let study = required(&fields, &file_path, STUDY_UID)?;
                let series_uid = required(&fields, &file_path, SERIES_UID)?;
                let entry = series.entry((study, series_uid)).or_insert_with(|| Series {
                    files: Vec::new(),
                    size: 0,
                    fields: fields.clone(),
                });
                entry.files.push(relpath(&file_path, path).to_string());
                entry.size += file.size;
            }
        }

        debug!("Found {} series under {}", series.len(), path);

        let mut used_names = HashSet::new();
        let items = series
            .into_iter()
            .map(|((study, series_uid), series)| {
                let mut item_context = context.clone();
                item_context.ignore = false;
                let labels = &mut item_context.metadata;
                if labels.subject.is_none() {
                    if let Some(patient) = series.fields.get("PatientID") {
                        labels.set(ContainerType::Subject, patient.clone());
                    }
                }
                if labels.session.is_none() {
                    labels.set(
                        ContainerType::Session,
                        series.fields.get("StudyDescription").cloned().unwrap_or(study),
                    );
                }
                let acquisition = series
                    .fields
                    .get("SeriesDescription")
                    .cloned()
                    .unwrap_or_else(|| series_uid.clone());
                if labels.acquisition.is_none() {
                    labels.set(ContainerType::Acquisition, acquisition.clone());
                }

                let name = unique_name(&mut used_names, &acquisition);
                item_context.node = NodeContext::Packfile(PackfileSpec {
                    packfile_type: PACKFILE_TYPE.to_string(),
                    name: Some(name),
                    flatten: false,
                    file_count: Some(series.files.len()),
                });

                ScannedItem {
                    subdir: path.to_string(),
                    files: series.files,
                    size: series.size,
                    item_type: ItemType::Packfile,
                    context: item_context,
                    fields: series.fields,
                }
            })
            .collect();
        Ok(items)
    }
}

fn required(
    fields: &BTreeMap<String, String>,
    path: &str,
    field: &'static str,
) -> Result<String, ScanError> {
    match fields.get(field) {
        Some(value) if !value.is_empty() => Ok(value.clone()),
        _ => Err(ScanError::MissingField {
            path: path.to_string(),
            field,
        }),
    }
}

/// `<label>.header.zip`, with `_dup-N` appended on collisions.
fn unique_name(used: &mut HashSet<String>, label: &str) -> String {
    let base = sanitize(label);
    let mut name = format!("{base}.{PACKFILE_TYPE}.zip");
    let mut n = 1;
    while !used.insert(name.clone()) {
        name = format!("{base}_dup-{n}.{PACKFILE_TYPE}.zip");
        n += 1;
    }
    name
}

fn sanitize(label: &str) -> String {
    label
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect()
}
