//! Process stage: builds each item's payload and uploads it.

use std::collections::HashSet;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tempfile::SpooledTempFile;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::{ClaimedTask, ExecutorQueue, ImportContext, PipelineError};
use crate::deid::{CollectingLogger, DeidProfile};
use crate::models::{IngestItem, ItemType, NewAuditLog, NewDeidLog, QueueKind, TaskStatus, WorkTask};
use crate::repository::{RepositoryError, TaskUpdate};
use crate::upload::UploadPayload;
use crate::walker::{basename, Walker};

#[derive(Debug, Clone, Copy)]
struct Limits {
    buffer_size: usize,
    spool_threshold: usize,
    in_memory: u64,
}

/// Upload file name of a packfile item.
///
/// The template or scanner supplied name wins, then the deepest container
/// label, then a hash of the item directory.
pub fn packfile_filename(item: &IngestItem) -> String {
    let packfile_type = item
        .context
        .packfile()
        .map(|spec| spec.packfile_type.as_str())
        .unwrap_or("zip");

    if let Some(name) = item.context.packfile().and_then(|spec| spec.name.as_deref()) {
        let name = basename(name);
        if !name.is_empty() {
            return if name.ends_with(".zip") {
                name.to_string()
            } else {
                format!("{name}.zip")
            };
        }
    }
    if let Some((_, label)) = item.context.metadata.deepest() {
        return format!("{label}.{packfile_type}.zip");
    }
    let digest = hex::encode(Sha256::digest(item.subdir.as_bytes()));
    format!("{}.{packfile_type}.zip", &digest[..16])
}

fn read_member(
    walker: &dyn Walker,
    path: &str,
    deid: Option<&DeidProfile>,
) -> Result<Vec<u8>, PipelineError> {
    let mut data = Vec::new();
    walker.open(path)?.read_to_end(&mut data)?;
    match deid {
        Some(profile) => Ok(profile.process_file(path, data)?),
        None => Ok(data),
    }
}

fn deid_applies(deid: Option<&DeidProfile>, path: &str) -> bool {
    deid.is_some_and(|profile| profile.file_profile_for(path).is_some())
}

fn in_memory_or_stream(data: Vec<u8>, limits: Limits) -> UploadPayload {
    if data.len() as u64 <= limits.in_memory {
        UploadPayload::Bytes(data)
    } else {
        let size = data.len() as u64;
        UploadPayload::Stream {
            reader: Box::new(Cursor::new(data)),
            size,
        }
    }
}

/// Base name of `name`, with a `_dup-N` suffix before the extension when an
/// earlier member already took it.
fn flat_member_name(used: &mut HashSet<String>, name: &str) -> String {
    let base = basename(name);
    let (stem, ext) = match base.rfind('.') {
        Some(dot) if dot > 0 => base.split_at(dot),
        _ => (base, ""),
    };
    let mut member = base.to_string();
    let mut n = 1;
    while !used.insert(member.clone()) {
        member = format!("{stem}_dup-{n}{ext}");
        n += 1;
    }
    member
}

/// Build the file name and payload of `item`. Blocking.
fn build_payload(
    walker: &dyn Walker,
    item: &IngestItem,
    deid: Option<&DeidProfile>,
    limits: Limits,
) -> Result<(String, UploadPayload), PipelineError> {
    match item.item_type {
        ItemType::File => {
            let path = item
                .file_paths()
                .into_iter()
                .next()
                .ok_or_else(|| PipelineError::NotFound(format!("files of item {}", item.item_id)))?;
            let filename = basename(&path).to_string();
            if deid_applies(deid, &path) || item.size <= limits.in_memory {
                let data = read_member(walker, &path, deid)?;
                return Ok((filename, in_memory_or_stream(data, limits)));
            }
            let reader = BufReader::with_capacity(limits.buffer_size, walker.open(&path)?);
            Ok((
                filename,
                UploadPayload::Stream {
                    reader: Box::new(reader),
                    size: item.size,
                },
            ))
        }
        ItemType::Packfile => {
            let flatten = item.context.packfile().is_some_and(|spec| spec.flatten);
            let options =
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
            let mut zip = ZipWriter::new(SpooledTempFile::new(limits.spool_threshold));

            let mut used = HashSet::new();
            for (name, path) in item.files.iter().zip(item.file_paths()) {
                let member = if flatten {
                    flat_member_name(&mut used, name)
                } else {
                    name.clone()
                };
                zip.start_file(member, options)?;
                if deid_applies(deid, &path) {
                    zip.write_all(&read_member(walker, &path, deid)?)?;
                } else {
                    let mut reader = BufReader::with_capacity(limits.buffer_size, walker.open(&path)?);
                    io::copy(&mut reader, &mut zip)?;
                }
            }

            let mut archive = zip.finish()?;
            let size = archive.seek(SeekFrom::End(0))?;
            archive.rewind()?;
            let payload = if size <= limits.in_memory {
                let mut data = Vec::with_capacity(size as usize);
                archive.read_to_end(&mut data)?;
                UploadPayload::Bytes(data)
            } else {
                UploadPayload::Stream {
                    reader: Box::new(archive),
                    size,
                }
            };
            Ok((packfile_filename(item), payload))
        }
    }
}

#[derive(Clone)]
pub struct ProcessStage {
    ctx: Arc<ImportContext>,
}

impl ProcessStage {
    pub fn new(ctx: Arc<ImportContext>) -> Self {
        Self { ctx }
    }

    fn limits(&self) -> Limits {
        let settings = &self.ctx.settings;
        Limits {
            buffer_size: settings.buffer_size.max(1024),
            spool_threshold: settings.spool_threshold,
            in_memory: settings.in_memory_upload_threshold,
        }
    }

    /// Upload the task's item. Returns the destination path.
    pub async fn run(&self, task: &WorkTask, item: &IngestItem) -> Result<String, PipelineError> {
        let db = &self.ctx.db;
        let ingest = db.ingests().get(task.ingest_id).await?;
        if ingest.is_aborted() {
            return Err(PipelineError::Aborted(ingest.ingest_id));
        }

        let target = task
            .context
            .target
            .clone()
            .or_else(|| item.context.target.clone())
            .ok_or_else(|| PipelineError::NoTarget(item.src_path()))?;

        let mut logger = None;
        let deid = match ingest.config.deid_profile_config() {
            Some(config) => {
                let tags = self.ctx.tag_dictionary(ingest.ingest_id).await?;
                let mut profile = DeidProfile::from_config(&config, tags);
                let collector = Arc::new(CollectingLogger::new());
                profile.set_log(collector.clone());
                logger = Some(collector);
                Some(profile)
            }
            None => None,
        };

        let walker = self.ctx.walker(&ingest)?;
        let limits = self.limits();
        let owned = item.clone();
        let (filename, payload) = tokio::task::spawn_blocking(move || {
            build_payload(walker.as_ref(), &owned, deid.as_ref(), limits)
        })
        .await??;

        let metadata = serde_json::json!({
            "source": item.src_path(),
            "item_type": item.item_type.as_str(),
            "file_count": item.files.len(),
            "labels": item.context.metadata,
        });
        debug!("Uploading {} to {} ({:?})", filename, target.id, payload);
        self.ctx
            .uploader
            .upload(&target, &filename, payload, &metadata)
            .await?;

        if let Some(logger) = logger {
            let entries: Vec<NewDeidLog> = logger
                .take()
                .into_iter()
                .map(|entry| NewDeidLog {
                    ingest_id: ingest.ingest_id,
                    path: entry.path,
                    log_type: entry.log_type,
                    field_values: entry.field_values,
                })
                .collect();
            if !entries.is_empty() {
                db.deid_logs().insert_many(&entries).await?;
            }
        }

        Ok(format!("{}/{}", target.id, filename))
    }

    async fn execute(&self, task: &WorkTask) -> TaskStatus {
        let db = &self.ctx.db;
        let item = match db.items().find(task.item_id).await {
            Ok(Some(item)) => item,
            Ok(None) => {
                warn!("Work task {} references missing item {}", task.task_id, task.item_id);
                return TaskStatus::Failed;
            }
            Err(e) => {
                warn!("Could not load item {}: {}", task.item_id, e);
                return TaskStatus::Failed;
            }
        };

        let (status, entry) = match self.run(task, &item).await {
            Ok(fw_path) => (
                TaskStatus::Complete,
                NewAuditLog::completed(task.ingest_id, item.src_path(), fw_path),
            ),
            Err(e) => {
                warn!("Upload of {} failed: {}", item.src_path(), e);
                let fw_path = task.context.target.as_ref().map(|t| t.id.clone());
                (
                    TaskStatus::Failed,
                    NewAuditLog::failed(task.ingest_id, item.src_path(), fw_path, e.to_string()),
                )
            }
        };

        if let Err(e) = db.audit_logs().insert(&entry).await {
            warn!("Could not write audit log for {}: {}", entry.src_path, e);
        }
        status
    }
}

struct ClaimedWork {
    stage: ProcessStage,
    task: WorkTask,
}

#[async_trait]
impl ClaimedTask for ClaimedWork {
    fn describe(&self) -> String {
        format!("work task {} (item {})", self.task.task_id, self.task.item_id)
    }

    async fn execute(self: Box<Self>) -> TaskStatus {
        let status = self.stage.execute(&self.task).await;
        if let Err(e) = self
            .stage
            .ctx
            .db
            .work_queue()
            .update(self.task.task_id, TaskUpdate::status(status))
            .await
        {
            warn!("Could not record status of work task {}: {}", self.task.task_id, e);
        }
        status
    }
}

#[async_trait]
impl ExecutorQueue for ProcessStage {
    fn kind(&self) -> QueueKind {
        QueueKind::Work
    }

    async fn get(&self, actor_id: &str) -> Result<Option<Box<dyn ClaimedTask>>, RepositoryError> {
        let task = self.ctx.db.work_queue().get(actor_id).await?;
        Ok(task.map(|task| {
            Box::new(ClaimedWork {
                stage: self.clone(),
                task,
            }) as Box<dyn ClaimedTask>
        }))
    }

    async fn is_complete_for_ingest(&self, ingest_id: i64) -> Result<bool, RepositoryError> {
        self.ctx.db.work_queue().is_complete_for_ingest(ingest_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerType, ItemContext, NodeContext, PackfileSpec};
    use crate::walker::{LocalWalker, WalkFilters};
    use std::fs;
    use tempfile::tempdir;
    use zip::ZipArchive;

    fn packfile_item(subdir: &str, files: &[&str], spec: PackfileSpec) -> IngestItem {
        let mut context = ItemContext::default();
        context.node = NodeContext::Packfile(spec);
        IngestItem {
            item_id: 1,
            ingest_id: 1,
            subdir: subdir.to_string(),
            files: files.iter().map(|f| f.to_string()).collect(),
            size: 0,
            item_type: ItemType::Packfile,
            context,
        }
    }

    #[test]
    fn test_packfile_filename_precedence() {
        let mut spec = PackfileSpec::new("dicom");
        spec.name = Some("series.dicom.zip".into());
        let mut item = packfile_item("s1/dicom", &["1.dcm"], spec);
        assert_eq!(packfile_filename(&item), "series.dicom.zip");

        if let NodeContext::Packfile(spec) = &mut item.context.node {
            spec.name = None;
        }
        item.context.metadata.set(ContainerType::Session, "ses1");
        assert_eq!(packfile_filename(&item), "ses1.dicom.zip");

        item.context.metadata = Default::default();
        let hashed = packfile_filename(&item);
        assert!(hashed.ends_with(".dicom.zip"));
        assert_eq!(hashed, packfile_filename(&item));
        assert_eq!(hashed.len(), 16 + ".dicom.zip".len());
    }

    #[test]
    fn test_packfile_archive_contents() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("s1/dicom/series2")).unwrap();
        fs::write(dir.path().join("s1/dicom/1.dcm"), b"one").unwrap();
        fs::write(dir.path().join("s1/dicom/series2/2.dcm"), b"two").unwrap();
        let walker = LocalWalker::new(dir.path(), WalkFilters::default());

        let limits = Limits {
            buffer_size: 8192,
            spool_threshold: 16,
            in_memory: 1,
        };
        let item = packfile_item("s1/dicom", &["1.dcm", "series2/2.dcm"], PackfileSpec::new("dicom"));
        let (_, payload) = build_payload(&walker, &item, None, limits).unwrap();
        assert!(payload.is_stream());

        let UploadPayload::Stream { mut reader, size } = payload else {
            unreachable!()
        };
        let mut data = Vec::new();
        reader.read_to_end(&mut data).unwrap();
        assert_eq!(data.len() as u64, size);

        let mut archive = ZipArchive::new(Cursor::new(data)).unwrap();
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"series2/2.dcm".to_string()));
        let mut body = String::new();
        archive.by_name("1.dcm").unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "one");

        // Flattened members are stored by base name.
        let mut spec = PackfileSpec::new("dicom");
        spec.flatten = true;
        let item = packfile_item("s1/dicom", &["1.dcm", "series2/2.dcm"], spec);
        let limits = Limits {
            in_memory: u64::MAX,
            ..limits
        };
        let (_, payload) = build_payload(&walker, &item, None, limits).unwrap();
        let UploadPayload::Bytes(data) = payload else {
            panic!("expected an in-memory payload")
        };
        let archive = ZipArchive::new(Cursor::new(data)).unwrap();
        let mut names: Vec<&str> = archive.file_names().collect();
        names.sort();
        assert_eq!(names, vec!["1.dcm", "2.dcm"]);
    }

    #[test]
    fn test_flattened_packfile_keeps_repeated_base_names() {
        let dir = tempdir().unwrap();
        for (path, body) in [
            ("s1/dicom/a/1.dcm", "first"),
            ("s1/dicom/b/1.dcm", "second"),
            ("s1/dicom/c/1.dcm", "third"),
            ("s1/dicom/c/README", "r1"),
            ("s1/dicom/d/README", "r2"),
        ] {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, body).unwrap();
        }
        let walker = LocalWalker::new(dir.path(), WalkFilters::default());
        let limits = Limits {
            buffer_size: 8192,
            spool_threshold: 1 << 20,
            in_memory: u64::MAX,
        };

        let mut spec = PackfileSpec::new("dicom");
        spec.flatten = true;
        let item = packfile_item(
            "s1/dicom",
            &["a/1.dcm", "b/1.dcm", "c/1.dcm", "c/README", "d/README"],
            spec,
        );
        let (_, payload) = build_payload(&walker, &item, None, limits).unwrap();
        let UploadPayload::Bytes(data) = payload else {
            panic!("expected an in-memory payload")
        };

        let mut archive = ZipArchive::new(Cursor::new(data)).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(
            names,
            vec!["1.dcm", "1_dup-1.dcm", "1_dup-2.dcm", "README", "README_dup-1"]
        );
        let mut body = String::new();
        archive.by_name("1_dup-1.dcm").unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "second");
    }
}
