//! Standalone worker command.

use console::style;
use tracing::info;

use crate::cli::helpers::build_context;
use crate::config::Settings;
use crate::importer::{actor_prefix, QueueExecutor};

/// Execute tasks from every queue until Ctrl-C, or until the queues are
/// empty with `drain`.
pub async fn cmd_worker(settings: &Settings, workers: usize, drain: bool) -> anyhow::Result<()> {
    let ctx = build_context(settings).await?;
    let mut executor = QueueExecutor::for_context(ctx, workers.max(1));

    if drain {
        let executed = executor.drain(&format!("{}-0", actor_prefix())).await?;
        println!("{} Executed {} tasks", style("✓").green(), executed);
        return Ok(());
    }

    executor.start();
    info!("Started {} workers; press Ctrl-C to stop", workers.max(1));
    tokio::signal::ctrl_c().await?;
    println!("{} Stopping after in-flight tasks", style("!").yellow());
    executor.shutdown().await;
    Ok(())
}
