//! Progress reporting and watch mode.

use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use super::PipelineError;
use crate::models::{IngestStage, QueueKind, StatusCounts};
use crate::repository::DbContext;

/// Queue counts and stage of one ingest.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestProgress {
    pub ingest_id: i64,
    pub stage: IngestStage,
    pub discover: StatusCounts,
    pub scan: StatusCounts,
    pub work: StatusCounts,
}

impl IngestProgress {
    pub async fn load(db: &DbContext, ingest_id: i64) -> Result<Self, PipelineError> {
        let ingest = db.ingests().get(ingest_id).await?;
        Ok(Self {
            ingest_id,
            stage: ingest.stage,
            discover: db.queue(QueueKind::Discover).status_counts(Some(ingest_id)).await?,
            scan: db.queue(QueueKind::Scan).status_counts(Some(ingest_id)).await?,
            work: db.queue(QueueKind::Work).status_counts(Some(ingest_id)).await?,
        })
    }

    pub fn counts(&self, kind: QueueKind) -> &StatusCounts {
        match kind {
            QueueKind::Discover => &self.discover,
            QueueKind::Scan => &self.scan,
            QueueKind::Work => &self.work,
        }
    }

    /// Every queue has drained. Failed tasks count as done.
    pub fn is_complete(&self) -> bool {
        QueueKind::ALL.iter().all(|kind| self.counts(*kind).is_complete())
    }

    pub fn failed(&self) -> u64 {
        self.discover.failed + self.scan.failed + self.work.failed
    }
}

/// Progress bar over the work queue. Hidden when not attached to a terminal.
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {wide_msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        Self { bar }
    }

    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn set_stage(&self, message: impl Into<String>) {
        self.bar.set_message(message.into());
    }

    pub fn update(&self, counts: &StatusCounts) {
        self.bar.set_length(counts.total());
        self.bar.set_position(counts.complete + counts.failed);
        if counts.failed > 0 {
            self.bar.set_message(format!("{} failed", counts.failed));
        }
    }

    pub fn finish(&self, message: impl Into<String>) {
        self.bar.finish_with_message(message.into());
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll the queues of `ingest_id` until they drain or the ingest leaves the
/// running stages.
pub async fn watch(
    db: &DbContext,
    ingest_id: i64,
    poll_interval: Duration,
    reporter: &ProgressReporter,
) -> Result<IngestProgress, PipelineError> {
    loop {
        let progress = IngestProgress::load(db, ingest_id).await?;
        let active = match progress.stage {
            IngestStage::Discovering => {
                if progress.discover.is_complete() {
                    &progress.scan
                } else {
                    &progress.discover
                }
            }
            _ => &progress.work,
        };
        reporter.set_stage(format!("{}", progress.stage));
        reporter.update(active);

        let drained = progress.stage != IngestStage::Discovering && progress.is_complete();
        if drained || progress.stage.is_terminal() {
            reporter.finish(format!("{}", progress.stage));
            return Ok(progress);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Text block for `status`.
pub fn render_progress(progress: &IngestProgress) -> String {
    let stage = match progress.stage {
        IngestStage::Complete => style(progress.stage.as_str()).green(),
        IngestStage::Aborted => style(progress.stage.as_str()).red(),
        _ => style(progress.stage.as_str()).yellow(),
    };
    let mut out = format!(
        "{} {}\n",
        style(format!("Ingest {}", progress.ingest_id)).bold(),
        stage
    );
    for kind in QueueKind::ALL {
        let counts = progress.counts(kind);
        let failed = if counts.failed > 0 {
            style(counts.failed.to_string()).red().to_string()
        } else {
            counts.failed.to_string()
        };
        out.push_str(&format!(
            "  {:<9} waiting {:>6}  processing {:>6}  complete {:>6}  failed {:>6}\n",
            kind.as_str(),
            counts.waiting,
            counts.processing,
            counts.complete,
            failed
        ));
    }
    out
}
