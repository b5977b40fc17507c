//! Initialize command.

use console::style;

use crate::cli::helpers::open_db;
use crate::config::Settings;
use crate::repository::util::redact_url_password;

/// Create every table and index. Safe to run repeatedly.
pub async fn cmd_init(settings: &Settings) -> anyhow::Result<()> {
    open_db(settings).await?;

    if let Err(e) = std::fs::create_dir_all(&settings.destination) {
        println!(
            "{} Could not create {}: {}",
            style("!").yellow(),
            settings.destination.display(),
            e
        );
    }

    println!(
        "{} Initialized {}",
        style("✓").green(),
        redact_url_password(&settings.database_url)
    );
    println!("  Uploads go to {}", settings.destination.display());
    Ok(())
}
