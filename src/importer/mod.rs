//! Import pipeline.
//!
//! Discover walks the source tree into items and scan tasks, Scan turns
//! scanner hand-offs into more items, review resolves destinations and queues
//! work once the run is confirmed, and Process uploads. All three queues are
//! drained by the [`QueueExecutor`]; the [`BulkImport`] driver moves one
//! ingest through its stages.

mod discover;
mod driver;
mod executor;
pub mod export;
mod process;
mod reporter;
mod review;
mod scan;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::config::{ConfigError, Settings};
use crate::deid::{DeidError, InMemoryTagDictionary, TagDictionary};
use crate::models::IngestOperation;
use crate::repository::{DbContext, RepositoryError};
use crate::scanners::{ScanError, ScannerRegistry};
use crate::template::TemplateError;
use crate::upload::{UploadError, Uploader};
use crate::walker::{create_walker, Walker, WalkerError};

pub use discover::{DiscoverStage, DiscoverSummary};
pub use driver::{AbortHandle, BulkImport, DriverStage, ImportOutcome};
pub use executor::{actor_prefix, ClaimedTask, ExecutorConfig, ExecutorQueue, QueueExecutor};
pub use process::ProcessStage;
pub use reporter::{render_progress, watch, IngestProgress, ProgressReporter};
pub use review::{enqueue_work, plan_work, ReviewSummary, WorkPlan};
pub use scan::ScanStage;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Walker(#[from] WalkerError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Deid(#[from] DeidError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Ingest {0} was aborted")]
    Aborted(i64),

    #[error("No destination container for {0}")]
    NoTarget(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Everything a stage needs to execute tasks.
pub struct ImportContext {
    pub db: DbContext,
    pub settings: Settings,
    pub scanners: ScannerRegistry,
    pub uploader: Arc<dyn Uploader>,
    walkers: Mutex<HashMap<i64, Arc<dyn Walker>>>,
}

impl ImportContext {
    pub fn new(db: DbContext, settings: Settings, uploader: Arc<dyn Uploader>) -> Self {
        Self {
            db,
            settings,
            scanners: ScannerRegistry::default(),
            uploader,
            walkers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_scanners(mut self, scanners: ScannerRegistry) -> Self {
        self.scanners = scanners;
        self
    }

    /// Walker over the source of `ingest`, opened once per ingest.
    pub fn walker(&self, ingest: &IngestOperation) -> Result<Arc<dyn Walker>, PipelineError> {
        if let Ok(walkers) = self.walkers.lock() {
            if let Some(walker) = walkers.get(&ingest.ingest_id) {
                return Ok(walker.clone());
            }
        }
        let filters = ingest.config.walk_filters()?;
        let walker = create_walker(Path::new(&ingest.fs_path), filters)?;
        if let Ok(mut walkers) = self.walkers.lock() {
            walkers.insert(ingest.ingest_id, walker.clone());
        }
        Ok(walker)
    }

    /// Tag dictionary holding the private tags registered for `ingest_id`.
    pub async fn tag_dictionary(
        &self,
        ingest_id: i64,
    ) -> Result<Arc<dyn TagDictionary>, PipelineError> {
        let dictionary = InMemoryTagDictionary::new();
        for tag in self.db.private_tags().list_for_ingest(ingest_id).await? {
            dictionary.register(&tag);
        }
        Ok(Arc::new(dictionary))
    }
}
