//! Database, context and prompt helpers shared by the subcommands.

use std::io::{self, Write};
use std::sync::Arc;

use console::style;

use crate::config::Settings;
use crate::importer::{ImportContext, ReviewSummary};
use crate::repository::DbContext;
use crate::upload::LocalUploader;

/// Open the configured database and create missing tables.
pub async fn open_db(settings: &Settings) -> anyhow::Result<DbContext> {
    let db = DbContext::from_url(&settings.database_url)?;
    db.initialize().await?;
    Ok(db)
}

/// Import context uploading into the configured destination directory.
pub async fn build_context(settings: &Settings) -> anyhow::Result<Arc<ImportContext>> {
    let db = open_db(settings).await?;
    let uploader = Arc::new(LocalUploader::new(settings.destination.clone()));
    Ok(Arc::new(ImportContext::new(db, settings.clone(), uploader)))
}

/// Human readable size in decimal units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [(u64, &str); 3] = [(1_000_000_000, "GB"), (1_000_000, "MB"), (1_000, "KB")];
    UNITS
        .iter()
        .find(|(scale, _)| bytes >= *scale)
        .map(|(scale, unit)| format!("{:.2} {unit}", bytes as f64 / *scale as f64))
        .unwrap_or_else(|| format!("{bytes} bytes"))
}

/// Print the review summary and ask before uploading. Blocks on stdin.
pub fn confirm_upload(summary: &ReviewSummary) -> bool {
    println!("\n{}", style("Ready to upload").bold());
    println!("{}", "-".repeat(40));
    println!("{:<20} {}", "Items:", summary.queued);
    println!("{:<20} {}", "Total size:", format_bytes(summary.bytes));
    println!("{:<20} {}", "Containers:", summary.containers.len());
    if summary.unresolved > 0 {
        println!(
            "{:<20} {}",
            "Unresolved:",
            style(summary.unresolved).yellow()
        );
    }

    print!("\nProceed? [y/N] ");
    if io::stdout().flush().is_err() {
        return false;
    }
    let mut input = String::new();
    if io::stdin().read_line(&mut input).is_err() {
        return false;
    }
    if !input.trim().eq_ignore_ascii_case("y") {
        println!("{} Cancelled", style("!").yellow());
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(12), "12 bytes");
        assert_eq!(format_bytes(1_500), "1.50 KB");
        assert_eq!(format_bytes(2_000_000), "2.00 MB");
        assert_eq!(format_bytes(3_250_000_000), "3.25 GB");
    }
}
