//! Scan stage: runs format scanners on directories discovery handed off.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{ClaimedTask, ExecutorQueue, ImportContext, PipelineError};
use crate::deid::SubjectsMappingConfig;
use crate::models::{
    ContainerType, ItemSource, NewIngestItem, QueueKind, ScanTask, SubjectCodeFormat, TaskStatus,
};
use crate::repository::{RepositoryError, TaskUpdate};
use crate::scanners::ScannedItem;

#[derive(Clone)]
pub struct ScanStage {
    ctx: Arc<ImportContext>,
}

impl ScanStage {
    pub fn new(ctx: Arc<ImportContext>) -> Self {
        Self { ctx }
    }

    /// Scan the task's directory and insert the items found. Returns the
    /// number of items.
    pub async fn run(&self, task: &ScanTask) -> Result<usize, PipelineError> {
        let db = &self.ctx.db;
        let ingest = db.ingests().get(task.ingest_id).await?;
        if ingest.is_aborted() {
            return Err(PipelineError::Aborted(ingest.ingest_id));
        }

        let tags = self.ctx.tag_dictionary(ingest.ingest_id).await?;
        let scanner = self.ctx.scanners.get(&task.scanner_type)?;
        let walker = self.ctx.walker(&ingest)?;

        let path = task.path.clone();
        let context = task.context.clone();
        let scanned = tokio::task::spawn_blocking(move || {
            scanner.scan(walker.as_ref(), &path, &context, tags.as_ref())
        })
        .await??;
        debug!("Scanner {} found {} items in {}", task.scanner_type, scanned.len(), task.path);

        let mapping = ingest
            .config
            .deid_profile_config()
            .and_then(|profile| profile.subjects_mapping);

        let items = db.items();
        let source = ItemSource::Scan(task.task_id);
        let mut recorded = items.recorded_by(source).await?;
        let count = scanned.len();
        for item in scanned {
            let key = (item.subdir.clone(), item.files.clone());
            if recorded.remove(&key) {
                debug!("Scan task {} already recorded {}", task.task_id, key.0);
                continue;
            }
            let item = match &mapping {
                Some(mapping) => self.map_subject(ingest.ingest_id, mapping, item).await?,
                None => item,
            };
            items
                .insert(&NewIngestItem {
                    ingest_id: ingest.ingest_id,
                    subdir: item.subdir,
                    files: item.files,
                    size: item.size,
                    item_type: item.item_type,
                    context: item.context,
                    source: Some(source),
                })
                .await?;
        }
        Ok(count)
    }

    /// Replace the subject label with the code assigned to the item's
    /// identifying fields.
    async fn map_subject(
        &self,
        ingest_id: i64,
        mapping: &SubjectsMappingConfig,
        mut item: ScannedItem,
    ) -> Result<ScannedItem, PipelineError> {
        let values: Vec<String> = mapping
            .fields
            .iter()
            .map(|field| item.fields.get(field).cloned().unwrap_or_default())
            .collect();
        let format = SubjectCodeFormat::parse(&mapping.format).map_err(|message| {
            crate::config::ConfigError::Invalid {
                key: "subjects_mapping.format",
                message,
            }
        })?;
        let subject = self
            .ctx
            .db
            .subjects()
            .get_or_create(ingest_id, &values, move |id| format.format(id))
            .await?;
        item.context
            .metadata
            .set(ContainerType::Subject, subject.subject_code);
        Ok(item)
    }
}

struct ClaimedScan {
    stage: ScanStage,
    task: ScanTask,
}

#[async_trait]
impl ClaimedTask for ClaimedScan {
    fn describe(&self) -> String {
        format!("scan task {} ({} on {})", self.task.task_id, self.task.scanner_type, self.task.path)
    }

    async fn execute(self: Box<Self>) -> TaskStatus {
        let status = match self.stage.run(&self.task).await {
            Ok(_) => TaskStatus::Complete,
            Err(e) => {
                warn!("Scan task {} on {} failed: {}", self.task.task_id, self.task.path, e);
                TaskStatus::Failed
            }
        };
        if let Err(e) = self
            .stage
            .ctx
            .db
            .scan_queue()
            .update(self.task.task_id, TaskUpdate::status(status))
            .await
        {
            warn!("Could not record status of scan task {}: {}", self.task.task_id, e);
        }
        status
    }
}

#[async_trait]
impl ExecutorQueue for ScanStage {
    fn kind(&self) -> QueueKind {
        QueueKind::Scan
    }

    async fn get(&self, actor_id: &str) -> Result<Option<Box<dyn ClaimedTask>>, RepositoryError> {
        let task = self.ctx.db.scan_queue().get(actor_id).await?;
        Ok(task.map(|task| {
            Box::new(ClaimedScan {
                stage: self.clone(),
                task,
            }) as Box<dyn ClaimedTask>
        }))
    }

    async fn is_complete_for_ingest(&self, ingest_id: i64) -> Result<bool, RepositoryError> {
        self.ctx.db.scan_queue().is_complete_for_ingest(ingest_id).await
    }
}
