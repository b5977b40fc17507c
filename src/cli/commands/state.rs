//! Ingest and queue state commands.

use std::time::Duration;

use anyhow::{anyhow, bail};
use console::style;

use crate::cli::helpers::open_db;
use crate::config::Settings;
use crate::importer::{render_progress, watch, IngestProgress, ProgressReporter};
use crate::models::{IngestStage, QueueKind};
use crate::repository::TaskUpdate;

/// Follow an ingest until its queues drain.
pub async fn cmd_watch(settings: &Settings, ingest_id: i64) -> anyhow::Result<()> {
    let db = open_db(settings).await?;
    let reporter = ProgressReporter::new();
    let progress = watch(&db, ingest_id, settings.poll_interval(), &reporter).await?;
    println!();
    print!("{}", render_progress(&progress));
    Ok(())
}

/// Mark an ingest aborted. Workers stop picking up its tasks.
pub async fn cmd_abort(settings: &Settings, ingest_id: i64) -> anyhow::Result<()> {
    let db = open_db(settings).await?;
    let ingest = db.ingests().get(ingest_id).await?;
    if ingest.stage.is_terminal() {
        println!(
            "{} Ingest {} is already {}",
            style("!").yellow(),
            ingest_id,
            ingest.stage
        );
        return Ok(());
    }
    db.ingests().set_stage(ingest_id, IngestStage::Aborted).await?;
    println!("{} Ingest {} aborted", style("✓").green(), ingest_id);
    Ok(())
}

/// Show one ingest in detail, or a line per ingest.
pub async fn cmd_status(settings: &Settings, ingest_id: Option<i64>) -> anyhow::Result<()> {
    let db = open_db(settings).await?;

    if let Some(ingest_id) = ingest_id {
        let progress = IngestProgress::load(&db, ingest_id).await?;
        print!("{}", render_progress(&progress));
        let failed_uploads = db.audit_logs().count_failed(ingest_id).await?;
        if failed_uploads > 0 {
            println!("  {} failed audit entries", style(failed_uploads).red());
        }
        return Ok(());
    }

    let ingests = db.ingests().list().await?;
    if ingests.is_empty() {
        println!("{} No ingest operations", style("!").yellow());
        return Ok(());
    }
    println!(
        "{:>6}  {:<12} {:<17} {:>8}  {}",
        "ID", "STAGE", "CREATED", "ITEMS", "NAME"
    );
    for ingest in ingests {
        let items = db.items().count_for_ingest(ingest.ingest_id).await?;
        println!(
            "{:>6}  {:<12} {:<17} {:>8}  {}",
            ingest.ingest_id,
            ingest.stage.as_str(),
            ingest.created.format("%Y-%m-%d %H:%M"),
            items,
            ingest.name
        );
    }
    Ok(())
}

/// Sweep abandoned claims back to waiting in every queue.
pub async fn cmd_requeue(settings: &Settings, older_than: Option<u64>) -> anyhow::Result<()> {
    let db = open_db(settings).await?;
    let lease = older_than
        .map(Duration::from_secs)
        .unwrap_or_else(|| settings.lease_timeout());

    let mut total = 0;
    for kind in QueueKind::ALL {
        let requeued = db.queue(kind).requeue_stale(lease).await?;
        if requeued > 0 {
            println!("  {:<9} {} tasks requeued", kind.as_str(), requeued);
        }
        total += requeued;
    }
    println!(
        "{} Requeued {} tasks claimed more than {}s ago",
        style("✓").green(),
        total,
        lease.as_secs()
    );
    Ok(())
}

/// Requeue failed tasks of an ingest. Run `worker` to process them.
pub async fn cmd_retry(settings: &Settings, ingest_id: i64) -> anyhow::Result<()> {
    let db = open_db(settings).await?;
    if db.ingests().get(ingest_id).await?.is_aborted() {
        bail!("Ingest {} was aborted; start a new import instead", ingest_id);
    }

    let mut total = 0;
    for kind in QueueKind::ALL {
        let retried = db.queue(kind).retry_failed(ingest_id).await?;
        if retried > 0 {
            println!("  {:<9} {} tasks requeued", kind.as_str(), retried);
        }
        total += retried;
    }
    println!("{} Requeued {} failed tasks", style("✓").green(), total);
    Ok(())
}

/// Apply `field=value` assignments to a task.
pub async fn cmd_task_set(
    settings: &Settings,
    queue: &str,
    task_id: i64,
    fields: &[String],
) -> anyhow::Result<()> {
    let kind = QueueKind::from_str(queue)
        .ok_or_else(|| anyhow!("Unknown queue '{}' (expected discover, scan or work)", queue))?;
    let update = TaskUpdate::from_fields(parse_assignments(fields)?)?;

    let db = open_db(settings).await?;
    match kind {
        QueueKind::Discover => db.discover_queue().update(task_id, update).await?,
        QueueKind::Scan => db.scan_queue().update(task_id, update).await?,
        QueueKind::Work => db.work_queue().update(task_id, update).await?,
    }
    println!(
        "{} Updated {} task {}",
        style("✓").green(),
        kind.as_str(),
        task_id
    );
    Ok(())
}

fn parse_assignments(fields: &[String]) -> anyhow::Result<Vec<(&str, &str)>> {
    fields
        .iter()
        .map(|field| {
            field
                .split_once('=')
                .ok_or_else(|| anyhow!("Expected field=value, got '{}'", field))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignments() {
        let fields = vec!["status=waiting".to_string(), "actor_id=".to_string()];
        assert_eq!(
            parse_assignments(&fields).unwrap(),
            vec![("status", "waiting"), ("actor_id", "")]
        );
        assert!(parse_assignments(&["status".to_string()]).is_err());
    }
}
