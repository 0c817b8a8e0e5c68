//! Streaming database backup tool
//!
//! Dumps one database and streams it to object storage without touching
//! local disk, with single-flight locking and retention cleanup.

// db-stream-backup/src/main.rs
mod backup;
mod config;
mod errors;
mod storage;
mod utils;

use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "db-stream-backup", version)]
#[command(about = "Streams a database dump to object storage and prunes old backups")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one backup now
    #[command(alias = "backup")]
    Run,
    /// Delete backups older than RETENTION_DAYS
    Cleanup {
        /// Only report what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
}

/// Main entry point for the backup tool
#[tokio::main]
async fn main() -> ExitCode {
    // LOG_FORMAT may come from .env, so load it before logging starts.
    let env_file = config::load_dotenv();
    init_logging();
    match env_file {
        Ok(Some(path)) => tracing::debug!(path = %path.display(), "loaded .env file"),
        Ok(None) => {}
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), exit_code = 1, "invalid configuration");
            return ExitCode::from(1);
        }
    }

    let cli = Cli::parse();
    let code = run_app(cli).await;
    ExitCode::from(code)
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.trim().eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

async fn run_app(cli: Cli) -> u8 {
    let app_config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), exit_code = 1, "invalid configuration");
            return 1;
        }
    };

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    match cli.command {
        Commands::Run => backup::run_backup_flow(app_config, &cancel).await,
        Commands::Cleanup { dry_run } => match backup::run_cleanup_flow(app_config, dry_run, &cancel).await {
            Ok(_) => 0,
            Err(e) => e.exit_code(),
        },
    }
}

/// Cancels the run on SIGINT or SIGTERM.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::warn!("interrupt received, cancelling run"),
            _ = term.recv() => tracing::warn!("SIGTERM received, cancelling run"),
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::warn!("interrupt received, cancelling run");
    }
    cancel.cancel();
}
