//! Review: resolve each item's destination container and queue its upload.
//!
//! Planning only reads; nothing reaches the work queue until the plan is
//! enqueued, so workers cannot start uploading before the run is confirmed.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, warn};

use super::{ImportContext, PipelineError};
use crate::models::{ContainerRef, IngestItem, NewAuditLog, NewWorkTask};

/// What review found ready for upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewSummary {
    pub queued: usize,
    pub unresolved: usize,
    pub bytes: u64,
    /// Destination containers, by id.
    pub containers: BTreeSet<String>,
}

/// Items with a resolved destination, and those without one.
#[derive(Debug, Clone, Default)]
pub struct WorkPlan {
    pub ingest_id: i64,
    pub summary: ReviewSummary,
    ready: Vec<IngestItem>,
    /// Source path and label path of items with no destination.
    unresolved: Vec<(String, String)>,
}

/// Resolve destinations for every item of `ingest_id` not yet queued.
pub async fn plan_work(ctx: &ImportContext, ingest_id: i64) -> Result<WorkPlan, PipelineError> {
    let db = &ctx.db;
    let queued: HashSet<i64> = db
        .work_queue()
        .list_for_ingest(ingest_id, None)
        .await?
        .into_iter()
        .map(|task| task.item_id)
        .collect();

    let mut resolved: HashMap<String, Option<ContainerRef>> = HashMap::new();
    let mut plan = WorkPlan {
        ingest_id,
        ..WorkPlan::default()
    };

    for mut item in db.items().list_for_ingest(ingest_id).await? {
        if queued.contains(&item.item_id) {
            continue;
        }

        let key = item.context.metadata.path();
        let target = match resolved.get(&key) {
            Some(target) => target.clone(),
            None => {
                let target = ctx.uploader.resolve(&item.context.metadata).await?;
                resolved.insert(key.clone(), target.clone());
                target
            }
        };

        match target {
            Some(target) => {
                plan.summary.containers.insert(target.id.clone());
                plan.summary.bytes += item.size;
                plan.summary.queued += 1;
                item.context.target = Some(target);
                plan.ready.push(item);
            }
            None => {
                plan.summary.unresolved += 1;
                plan.unresolved.push((item.src_path(), key));
            }
        }
    }
    Ok(plan)
}

impl WorkPlan {
    /// Record the resolved targets and queue one work task per item.
    /// Unresolved items get a failed audit entry instead.
    pub async fn enqueue(self, ctx: &ImportContext) -> Result<ReviewSummary, PipelineError> {
        let db = &ctx.db;
        for (src_path, key) in self.unresolved {
            warn!("No destination for {} (labels '{}')", src_path, key);
            db.audit_logs()
                .insert(&NewAuditLog::failed(
                    self.ingest_id,
                    src_path,
                    None,
                    format!("No destination container for labels '{key}'"),
                ))
                .await?;
        }

        for item in self.ready {
            db.items().update_context(item.item_id, &item.context).await?;
            db.work_queue()
                .insert(&NewWorkTask {
                    item_id: item.item_id,
                    ingest_id: self.ingest_id,
                    context: item.context,
                })
                .await?;
        }

        debug!(
            "Queued {} uploads into {} containers ({} unresolved)",
            self.summary.queued,
            self.summary.containers.len(),
            self.summary.unresolved
        );
        Ok(self.summary)
    }
}

/// Plan and enqueue in one step.
pub async fn enqueue_work(ctx: &ImportContext, ingest_id: i64) -> Result<ReviewSummary, PipelineError> {
    plan_work(ctx, ingest_id).await?.enqueue(ctx).await
}
