use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use labvault::config::AppConfig;
use labvault::context::AppContext;
use labvault::core::pull::ConsoleOperator;
use labvault::core::transfer_engine::DestinationPolicy;
use labvault::core::{Orchestrator, checksum, session};
use labvault::logging;
use serde::Serialize;

#[derive(Parser)]
#[command(name = "labvault")]
#[command(about = "Session data lifecycle for acquisition rigs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file, `labvault.toml` in the working directory by default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new session on every reachable storage tier.
    Create {
        #[arg(long)]
        project: String,
        #[arg(long)]
        subject: String,
    },
    /// Record that the acquisition runtime initialized a session.
    Initialized { session_dir: PathBuf },
    /// Run preprocessing for an existing session directory.
    Preprocess {
        session_dir: PathBuf,

        /// Fail instead of prompting when capture files are missing.
        #[arg(long)]
        unattended: bool,
    },
    /// Remove directories tagged safe for deletion.
    Purge,
    /// Remove one session from every storage tier.
    PurgeSession { session_dir: PathBuf },
    /// Move a subject's pushed sessions into another project.
    Migrate {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    /// Compute the checksum of a directory tree.
    Checksum {
        directory: PathBuf,

        /// Also write the checksum sidecar into the directory.
        #[arg(long)]
        save: bool,
    },
}

/// Command line values layered over the config file.
#[derive(Args, Serialize)]
struct Overrides {
    #[command(flatten)]
    log: LogOverrides,

    #[command(flatten)]
    transfer: TransferOverrides,
}

#[derive(Args, Serialize)]
struct LogOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    json: Option<bool>,
}

#[derive(Args, Serialize)]
struct TransferOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true, value_enum)]
    destination_policy: Option<DestinationPolicy>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref(), Some(&cli.overrides))
        .context("Failed to load configuration")?;
    logging::init(&config.log);

    match cli.command {
        Commands::Create { project, subject } => {
            let tree = session::create(&project, &subject, &config.storage)
                .context("Failed to create session")?;
            println!("{}", tree.path().display());
        }
        Commands::Preprocess {
            session_dir,
            unattended,
        } => {
            let tree = session::reopen(&session_dir)
                .with_context(|| format!("Failed to open session {}", session_dir.display()))?;
            let mut ctx = AppContext::new(config);
            if !unattended {
                ctx = ctx.with_operator(Arc::new(ConsoleOperator));
            }
            Orchestrator::new(ctx)
                .preprocess(&tree)
                .await
                .with_context(|| format!("Preprocessing {} failed", tree.session_name()))?;
        }
        Commands::Initialized { session_dir } => {
            let tree = session::reopen(&session_dir)
                .with_context(|| format!("Failed to open session {}", session_dir.display()))?;
            session::runtime_initialized(&tree).context("Failed to update session state")?;
        }
        Commands::Purge => {
            let report = Orchestrator::new(AppContext::new(config))
                .purge()
                .context("Purge failed")?;
            println!("Removed {} directories", report.removed.len());
        }
        Commands::PurgeSession { session_dir } => {
            let tree = session::reopen(&session_dir)
                .with_context(|| format!("Failed to open session {}", session_dir.display()))?;
            let ctx = AppContext::new(config).with_operator(Arc::new(ConsoleOperator));
            let report = Orchestrator::new(ctx)
                .purge_failed_session(&tree)
                .await
                .with_context(|| format!("Purging {} failed", tree.session_name()))?;
            println!("Removed {} directories", report.removed.len());
        }
        Commands::Migrate { subject, from, to } => {
            let report = Orchestrator::new(AppContext::new(config))
                .migrate_subject(&subject, &from, &to)
                .await
                .with_context(|| format!("Migrating {subject} from {from} to {to} failed"))?;
            println!("Migrated {} sessions", report.sessions.len());
        }
        Commands::Checksum { directory, save } => {
            let workers = config.workers.checksum;
            let digest = if save {
                checksum::checksum_and_save(&directory, workers).await
            } else {
                checksum::checksum(&directory, workers).await
            }
            .with_context(|| format!("Failed to checksum {}", directory.display()))?;
            println!("{digest}");
        }
    }

    Ok(())
}
