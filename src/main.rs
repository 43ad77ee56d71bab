// ABOUTME: CLI entry point for dataflow-replicator
// ABOUTME: Loads configuration, sets up logging and routes to the selected mode

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use dataflow_replicator::commands;
use dataflow_replicator::commands::replay::ReplayOptions;
use dataflow_replicator::config::Config;
use dataflow_replicator::logging::{self, APPLY_SPAN, CAPTURE_SPAN};

#[derive(Parser)]
#[command(name = "dataflow-replicator")]
#[command(about = "MySQL binlog capture and key-translating apply pipeline", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short = 'c', global = true, default_value = "dataflow.toml")]
    config: PathBuf,
    /// Log database password (falls back to MARIADB_ROOT_PASSWORD env)
    #[arg(
        long = "log-db-password",
        env = "MARIADB_ROOT_PASSWORD",
        hide_env_values = true,
        global = true
    )]
    log_db_password: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail the source binlog into the event log and work queue
    Capture,
    /// Apply queued events to the target database
    Apply,
    /// Run capture and apply together in one process
    Run,
    /// Show queue depth, latest checkpoint and unapplied event count (read-only)
    Status,
    /// Re-enqueue events the event log still marks unapplied
    Replay {
        /// Only replay events with an id greater than this
        #[arg(long, default_value_t = 0)]
        after: i64,
        /// Number of events read from the log per page
        #[arg(long, default_value_t = 500)]
        batch_size: usize,
        /// List what would be replayed without enqueuing
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let password = cli.log_db_password.as_deref();
    let log_dir = &config.logging.directory;
    let level = config.logging.level.as_str();

    match cli.command {
        Commands::Capture => {
            logging::init(&[CAPTURE_SPAN], log_dir, level)?;
            commands::capture(&config, password).await
        }
        Commands::Apply => {
            logging::init(&[APPLY_SPAN], log_dir, level)?;
            commands::apply(&config, password).await
        }
        Commands::Run => {
            logging::init(&[CAPTURE_SPAN, APPLY_SPAN], log_dir, level)?;
            commands::run(&config, password).await
        }
        Commands::Status => {
            logging::init_stdout("warn")?;
            commands::status(&config, password).await
        }
        Commands::Replay {
            after,
            batch_size,
            dry_run,
        } => {
            logging::init(&[], log_dir, level)?;
            commands::replay(
                &config,
                password,
                ReplayOptions {
                    after_event_id: after,
                    batch_size,
                    dry_run,
                },
            )
            .await
        }
    }
}
