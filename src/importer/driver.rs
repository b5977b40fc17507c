//! Import driver: moves one ingest operation through its stages.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::export::{
    read_private_tags, read_subject_map, write_audit_log, write_deid_log, write_subject_map,
};
use super::{
    plan_work, ImportContext, IngestProgress, PipelineError, ProgressReporter, QueueExecutor,
    ReviewSummary,
};
use crate::config::ImporterConfig;
use crate::models::{ContainerLabels, ContainerType, IngestStage, NewIngest, QueueKind};
use crate::repository::{IngestUpdate, RepositoryError};
use crate::upload::UploadPayload;

/// Stages of the driver, in the order a successful run visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStage {
    Initialize,
    CreateIngest,
    StartWorkers,
    WaitForDiscover,
    WaitForScan,
    Review,
    Process,
    Completed,
    Aborted,
    Shutdown,
}

/// Requests a cooperative abort of a running import.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Asked before uploads start; `false` aborts the import.
pub type ConfirmFn = Arc<dyn Fn(&ReviewSummary) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ImportOutcome {
    pub ingest_id: i64,
    pub stage: IngestStage,
    pub progress: IngestProgress,
    pub review: Option<ReviewSummary>,
}

impl ImportOutcome {
    pub fn is_success(&self) -> bool {
        self.stage == IngestStage::Complete && self.progress.failed() == 0
    }
}

pub struct BulkImport {
    ctx: Arc<ImportContext>,
    config: ImporterConfig,
    name: String,
    workers: usize,
    confirm: Option<ConfirmFn>,
    abort: AbortHandle,
    reporter: ProgressReporter,
    executor: Option<QueueExecutor>,
    ingest_id: Option<i64>,
    review: Option<ReviewSummary>,
}

impl BulkImport {
    pub fn new(ctx: Arc<ImportContext>, config: ImporterConfig) -> Self {
        let workers = ctx.settings.workers;
        Self {
            name: config.folder.display().to_string(),
            ctx,
            config,
            workers,
            confirm: None,
            abort: AbortHandle::default(),
            reporter: ProgressReporter::hidden(),
            executor: None,
            ingest_id: None,
            review: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Local workers to start; `0` leaves the queues to `worker` processes.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn confirm_with(mut self, confirm: ConfirmFn) -> Self {
        self.confirm = Some(confirm);
        self
    }

    pub fn reporter(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub async fn run(mut self) -> Result<ImportOutcome, PipelineError> {
        let mut stage = DriverStage::Initialize;
        let result = loop {
            debug!("Import stage {:?}", stage);
            match self.step(stage).await {
                Ok(DriverStage::Shutdown) => break Ok(()),
                Ok(next) => stage = next,
                Err(e) => break Err(e),
            }
        };

        if let Some(mut executor) = self.executor.take() {
            executor.shutdown().await;
        }

        if let Err(e) = result {
            if let Some(ingest_id) = self.ingest_id {
                warn!("Import {} failed in {:?}: {}", ingest_id, stage, e);
                self.mark_aborted(ingest_id).await;
            }
            return Err(e);
        }

        let ingest_id = self.ingest_id.ok_or_else(|| {
            PipelineError::NotFound("ingest operation was never created".to_string())
        })?;
        let progress = IngestProgress::load(&self.ctx.db, ingest_id).await?;
        Ok(ImportOutcome {
            ingest_id,
            stage: progress.stage,
            progress,
            review: self.review,
        })
    }

    fn current_ingest(&self) -> Result<i64, PipelineError> {
        self.ingest_id
            .ok_or_else(|| PipelineError::NotFound("ingest operation".to_string()))
    }

    async fn step(&mut self, stage: DriverStage) -> Result<DriverStage, PipelineError> {
        let db = self.ctx.db.clone();
        match stage {
            DriverStage::Initialize => {
                db.initialize().await?;
                Ok(DriverStage::CreateIngest)
            }
            DriverStage::CreateIngest => {
                self.create_ingest().await?;
                Ok(DriverStage::StartWorkers)
            }
            DriverStage::StartWorkers => {
                if self.workers > 0 {
                    let mut executor = QueueExecutor::for_context(self.ctx.clone(), self.workers);
                    executor.start();
                    self.executor = Some(executor);
                } else {
                    info!("No local workers; waiting for external workers");
                }
                Ok(DriverStage::WaitForDiscover)
            }
            DriverStage::WaitForDiscover => {
                self.reporter.set_stage("Discovering");
                Ok(match self.wait_for(QueueKind::Discover).await? {
                    true => DriverStage::WaitForScan,
                    false => DriverStage::Aborted,
                })
            }
            DriverStage::WaitForScan => {
                self.reporter.set_stage("Scanning");
                Ok(match self.wait_for(QueueKind::Scan).await? {
                    true => DriverStage::Review,
                    false => DriverStage::Aborted,
                })
            }
            DriverStage::Review => self.review().await,
            DriverStage::Process => {
                self.reporter.set_stage("Uploading");
                if !self.wait_for(QueueKind::Work).await? {
                    return Ok(DriverStage::Aborted);
                }
                let ingest_id = self.current_ingest()?;
                db.ingests()
                    .update(
                        ingest_id,
                        IngestUpdate {
                            processing_end: Some(Some(Utc::now())),
                            ..IngestUpdate::default()
                        },
                    )
                    .await?;
                Ok(DriverStage::Completed)
            }
            DriverStage::Completed => {
                let ingest_id = self.current_ingest()?;
                self.export_audit_log(ingest_id).await?;
                db.ingests().set_stage(ingest_id, IngestStage::Complete).await?;
                self.export_mappings(ingest_id).await?;
                self.reporter.finish("Complete");
                info!("Import {} complete", ingest_id);
                Ok(DriverStage::Shutdown)
            }
            DriverStage::Aborted => {
                let ingest_id = self.current_ingest()?;
                self.mark_aborted(ingest_id).await;
                self.export_audit_log(ingest_id).await?;
                self.reporter.finish("Aborted");
                warn!("Import {} aborted", ingest_id);
                Ok(DriverStage::Shutdown)
            }
            DriverStage::Shutdown => Ok(DriverStage::Shutdown),
        }
    }

    async fn create_ingest(&mut self) -> Result<(), PipelineError> {
        self.config.validate()?;
        let db = &self.ctx.db;
        let ingest = db
            .ingests()
            .insert(&NewIngest {
                name: self.name.clone(),
                fs_path: self.config.folder.display().to_string(),
                config: self.config.clone(),
            })
            .await?;
        let ingest_id = ingest.ingest_id;
        self.ingest_id = Some(ingest_id);
        info!("Created ingest {} for {}", ingest_id, ingest.fs_path);

        if let Some(path) = &self.config.private_tags {
            let data = read_file(path).await?;
            let tags = read_private_tags(data.as_slice())?;
            for tag in &tags {
                db.private_tags().insert(ingest_id, tag).await?;
            }
            debug!("Registered {} private tags", tags.len());
        }

        let load_from = self
            .config
            .deid_profile_config()
            .and_then(|profile| profile.subjects_mapping)
            .and_then(|mapping| mapping.load_from);
        if let Some(path) = load_from {
            let data = read_file(&path).await?;
            let mappings = read_subject_map(data.as_slice(), ingest_id)?;
            for mapping in &mappings {
                db.subjects().insert(mapping).await?;
            }
            debug!("Loaded {} subject mappings from {}", mappings.len(), path.display());
        }

        db.discover_queue().insert(ingest_id).await?;
        Ok(())
    }

    /// Wait until `kind` has no pending tasks for the ingest. Returns
    /// `false` if the import was aborted meanwhile.
    async fn wait_for(&self, kind: QueueKind) -> Result<bool, PipelineError> {
        let ingest_id = self.current_ingest()?;
        let db = &self.ctx.db;
        let queue = db.queue(kind);
        loop {
            if self.abort.is_aborted() {
                return Ok(false);
            }
            if db.ingests().get(ingest_id).await?.is_aborted() {
                return Ok(false);
            }
            let counts = queue.status_counts(Some(ingest_id)).await?;
            if kind == QueueKind::Work {
                self.reporter.update(&counts);
            }
            if counts.is_complete() {
                if counts.failed > 0 {
                    warn!("{} {} tasks failed", counts.failed, kind.as_str());
                }
                return Ok(true);
            }
            tokio::time::sleep(self.ctx.settings.poll_interval()).await;
        }
    }

    async fn review(&mut self) -> Result<DriverStage, PipelineError> {
        let ingest_id = self.current_ingest()?;
        let plan = plan_work(&self.ctx, ingest_id).await?;
        let summary = plan.summary.clone();
        info!(
            "{} items ({} bytes) ready for upload into {} containers",
            summary.queued,
            summary.bytes,
            summary.containers.len()
        );
        self.review = Some(summary.clone());

        if let Some(confirm) = self.confirm.clone() {
            let proceed = tokio::task::spawn_blocking(move || confirm(&summary)).await?;
            if !proceed {
                return Ok(DriverStage::Aborted);
            }
        }
        if self.abort.is_aborted() {
            return Ok(DriverStage::Aborted);
        }

        plan.enqueue(&self.ctx).await?;
        let ingests = self.ctx.db.ingests();
        ingests.set_stage(ingest_id, IngestStage::Importing).await?;
        ingests
            .update(
                ingest_id,
                IngestUpdate {
                    processing_start: Some(Some(Utc::now())),
                    ..IngestUpdate::default()
                },
            )
            .await?;
        Ok(DriverStage::Process)
    }

    async fn mark_aborted(&self, ingest_id: i64) {
        match self.ctx.db.ingests().set_stage(ingest_id, IngestStage::Aborted).await {
            Ok(()) | Err(RepositoryError::InvalidStageTransition { .. }) => {}
            Err(e) => warn!("Could not mark ingest {} aborted: {}", ingest_id, e),
        }
    }

    /// Write the audit log CSV where configured and upload it to the
    /// project container when there is one.
    async fn export_audit_log(&self, ingest_id: i64) -> Result<(), PipelineError> {
        if self.config.no_audit_log {
            return Ok(());
        }
        let entries = self.ctx.db.audit_logs().list_for_ingest(ingest_id).await?;
        let mut csv = Vec::new();
        write_audit_log(&mut csv, &entries)?;

        if let Some(path) = &self.config.audit_log_path {
            tokio::fs::write(path, &csv).await?;
            info!("Wrote audit log to {}", path.display());
        }

        let mut labels = ContainerLabels::default();
        if let Some(group) = &self.config.group {
            labels.set(ContainerType::Group, group.clone());
        }
        if let Some(project) = &self.config.project {
            labels.set(ContainerType::Project, project.clone());
        }
        match self.ctx.uploader.resolve(&labels).await {
            Ok(Some(project)) if project.container_type == ContainerType::Project => {
                let filename = format!("bulk-import-audit-{ingest_id}.csv");
                self.ctx
                    .uploader
                    .upload(&project, &filename, UploadPayload::Bytes(csv), &serde_json::Value::Null)
                    .await?;
                debug!("Uploaded {} to {}", filename, project.id);
            }
            Ok(_) => {}
            Err(e) => warn!("Could not resolve project for the audit log: {}", e),
        }
        Ok(())
    }

    async fn export_mappings(&self, ingest_id: i64) -> Result<(), PipelineError> {
        let Some(profile) = self.config.deid_profile_config() else {
            return Ok(());
        };
        let db = &self.ctx.db;

        if let Some(mapping) = &profile.subjects_mapping {
            if let Some(path) = &mapping.save_to {
                let mappings = db.subjects().list_for_ingest(ingest_id).await?;
                let mut csv = Vec::new();
                write_subject_map(&mut csv, &mappings, &mapping.fields)?;
                tokio::fs::write(path, csv).await?;
                info!("Wrote {} subject mappings to {}", mappings.len(), path.display());
            }
        }

        if let Some(path) = &profile.deid_log {
            let entries = db.deid_logs().list_for_ingest(ingest_id).await?;
            let mut csv = Vec::new();
            write_deid_log(&mut csv, &entries)?;
            tokio::fs::write(path, csv).await?;
            info!("Wrote de-identification log to {}", path.display());
        }
        Ok(())
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>, PipelineError> {
    let path: PathBuf = crate::config::expand_path(path);
    Ok(tokio::fs::read(&path).await?)
}
