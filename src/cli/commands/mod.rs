//! Argument parsing and subcommand dispatch.

mod import;
mod init;
mod state;
mod worker;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::Settings;

#[derive(Parser)]
#[command(name = "bulk-import")]
#[command(about = "Import a folder tree into a container hierarchy through persistent work queues")]
#[command(version)]
pub struct Cli {
    /// Settings file to load instead of the discovered one
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database connection string (sqlite:<path> or postgres:<dsn>)
    #[arg(long, global = true, env = "BULK_IMPORT_DATABASE_URL")]
    database_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Whether `-v` was passed. Read before clap runs so logging is set up first.
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database tables
    Init,

    /// Import a folder or zip archive
    Run(RunArgs),

    /// Execute queued tasks until interrupted
    Worker {
        /// Number of concurrent workers (defaults to the configured count)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Exit once every queue is empty instead of polling
        #[arg(long)]
        drain: bool,
    },

    /// Follow the progress of an ingest until its queues drain
    Watch {
        ingest_id: i64,
    },

    /// Ask workers to stop processing an ingest
    Abort {
        ingest_id: i64,
    },

    /// Show ingest stages and queue counts
    Status {
        /// Ingest to show (all ingests when omitted)
        ingest_id: Option<i64>,
    },

    /// Return abandoned claims to the waiting state
    Requeue {
        /// Claims older than this many seconds are abandoned (defaults to the lease timeout)
        #[arg(long)]
        older_than: Option<u64>,
    },

    /// Requeue the failed tasks of an ingest
    Retry {
        ingest_id: i64,
    },

    /// Inspect or edit queued tasks
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Update fields of a task (status, actor_id, context)
    Set {
        /// Queue name: discover, scan or work
        queue: String,
        task_id: i64,
        /// Assignments in field=value form
        #[arg(required = true)]
        fields: Vec<String>,
    },
}

#[derive(Args, Debug)]
pub(crate) struct RunArgs {
    /// Source folder or zip archive
    pub folder: PathBuf,

    /// Template levels separated by ':' (e.g. "{subject}:{session}")
    #[arg(short, long, conflicts_with = "template_file")]
    pub template: Option<String>,

    /// YAML file with a template tree
    #[arg(long)]
    pub template_file: Option<PathBuf>,

    /// Group label for every item
    #[arg(short, long)]
    pub group: Option<String>,

    /// Project label for every item
    #[arg(short, long)]
    pub project: Option<String>,

    /// De-identify files with the default profile
    #[arg(long)]
    pub de_identify: bool,

    /// De-identify files with a named profile
    #[arg(long)]
    pub profile: Option<String>,

    /// YAML file defining additional de-identification profiles
    #[arg(long)]
    pub profile_file: Option<PathBuf>,

    /// Only import files matching these globs
    #[arg(long, value_delimiter = ',')]
    pub include: Vec<String>,

    /// Skip files matching these globs
    #[arg(long, value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// Skip directories matching these globs
    #[arg(long, value_delimiter = ',')]
    pub exclude_dirs: Vec<String>,

    /// Follow symbolic links while walking
    #[arg(long)]
    pub follow_symlinks: bool,

    /// CSV dictionary of private tags
    #[arg(long)]
    pub private_tags: Option<PathBuf>,

    /// Do not write or upload the audit log
    #[arg(long, conflicts_with = "audit_log_path")]
    pub no_audit_log: bool,

    /// Also write the audit log CSV here
    #[arg(long)]
    pub audit_log_path: Option<PathBuf>,

    /// Upload without asking for confirmation
    #[arg(short, long)]
    pub yes: bool,

    /// Number of local workers (0 relies on separate `worker` processes)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Name of the ingest operation (defaults to the folder)
    #[arg(long)]
    pub name: Option<String>,
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref()).await?;
    if let Some(url) = cli.database_url {
        settings.database_url = url;
    }

    match cli.command {
        Commands::Init => init::cmd_init(&settings).await,
        Commands::Run(args) => import::cmd_run(&settings, args).await,
        Commands::Worker { workers, drain } => {
            worker::cmd_worker(&settings, workers.unwrap_or(settings.workers), drain).await
        }
        Commands::Watch { ingest_id } => state::cmd_watch(&settings, ingest_id).await,
        Commands::Abort { ingest_id } => state::cmd_abort(&settings, ingest_id).await,
        Commands::Status { ingest_id } => state::cmd_status(&settings, ingest_id).await,
        Commands::Requeue { older_than } => state::cmd_requeue(&settings, older_than).await,
        Commands::Retry { ingest_id } => state::cmd_retry(&settings, ingest_id).await,
        Commands::Task { command } => match command {
            TaskCommands::Set {
                queue,
                task_id,
                fields,
            } => state::cmd_task_set(&settings, &queue, task_id, &fields).await,
        },
    }
}
