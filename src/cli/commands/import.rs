//! Import command.

use std::fs;
use std::sync::Arc;

use console::style;
use tracing::warn;

use super::RunArgs;
use crate::cli::helpers::{build_context, confirm_upload, format_bytes};
use crate::config::{expand_path, ConfigError, ImporterConfig, Settings};
use crate::deid::DeidProfileConfig;
use crate::importer::{render_progress, BulkImport, ProgressReporter};
use crate::models::IngestStage;
use crate::template::parse_template_string;

/// Build the importer configuration from command-line flags.
pub(crate) fn importer_config(args: &RunArgs) -> Result<ImporterConfig, ConfigError> {
    let template = match (&args.template, &args.template_file) {
        (Some(template), _) => parse_template_string(template),
        (None, Some(path)) => ImporterConfig::load_template_file(path)?,
        (None, None) => Vec::new(),
    };

    let deid_profiles = match &args.profile_file {
        Some(path) => {
            let path = expand_path(path);
            let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            serde_yaml::from_str::<Vec<DeidProfileConfig>>(&text)?
        }
        None => Vec::new(),
    };

    let config = ImporterConfig {
        folder: expand_path(&args.folder),
        group: args.group.clone(),
        project: args.project.clone(),
        template,
        de_identify: args.de_identify,
        deid_profile: args.profile.clone(),
        deid_profiles,
        include: args.include.clone(),
        exclude: args.exclude.clone(),
        exclude_dirs: args.exclude_dirs.clone(),
        follow_symlinks: args.follow_symlinks,
        private_tags: args.private_tags.as_deref().map(expand_path),
        no_audit_log: args.no_audit_log,
        audit_log_path: args.audit_log_path.as_deref().map(expand_path),
    };
    config.validate()?;
    Ok(config)
}

/// Run one import end to end.
pub async fn cmd_run(settings: &Settings, args: RunArgs) -> anyhow::Result<()> {
    let config = importer_config(&args)?;
    let ctx = build_context(settings).await?;

    let mut import = BulkImport::new(ctx, config)
        .workers(args.workers.unwrap_or(settings.workers))
        .reporter(ProgressReporter::new());
    if let Some(name) = args.name {
        import = import.name(name);
    }
    if !(args.yes || settings.assume_yes) {
        import = import.confirm_with(Arc::new(confirm_upload));
    }

    let abort = import.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; aborting after in-flight tasks");
            abort.abort();
        }
    });

    let outcome = import.run().await?;
    println!();
    print!("{}", render_progress(&outcome.progress));
    if let Some(review) = &outcome.review {
        println!(
            "  {} items ({}) queued for {} containers",
            review.queued,
            format_bytes(review.bytes),
            review.containers.len()
        );
    }

    match outcome.stage {
        IngestStage::Complete if outcome.is_success() => {
            println!("{} Import {} complete", style("✓").green(), outcome.ingest_id);
        }
        IngestStage::Complete => println!(
            "{} Import {} complete with {} failed tasks",
            style("!").yellow(),
            outcome.ingest_id,
            outcome.progress.failed()
        ),
        stage => println!(
            "{} Import {} ended in stage {}",
            style("✗").red(),
            outcome.ingest_id,
            stage
        ),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: RunArgs,
    }

    fn parse(argv: &[&str]) -> RunArgs {
        Harness::parse_from(std::iter::once("run").chain(argv.iter().copied())).args
    }

    #[test]
    fn test_config_from_flags() {
        let args = parse(&[
            "/data",
            "--template",
            "{subject}:{session}",
            "--project",
            "Study",
            "--exclude",
            "*.tmp,*.bak",
            "--de-identify",
        ]);
        let config = importer_config(&args).unwrap();
        assert_eq!(config.project.as_deref(), Some("Study"));
        assert_eq!(config.template.len(), 1);
        assert_eq!(config.template[0].children[0].pattern, "{session}");
        assert_eq!(config.exclude, vec!["*.tmp", "*.bak"]);
        assert_eq!(config.deid_profile_name(), Some("minimal"));
    }

    #[test]
    fn test_conflicting_deid_flags() {
        let args = parse(&["/data", "--de-identify", "--profile", "minimal"]);
        assert!(matches!(
            importer_config(&args),
            Err(ConfigError::Conflict(_))
        ));
    }
}
