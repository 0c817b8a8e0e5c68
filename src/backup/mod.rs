mod logic; // Orchestrator state machine
pub(crate) mod archive; // Gzip stage
pub(crate) mod db_dump; // Dump strategies per engine
pub(crate) mod limiter;
pub(crate) mod lock; // Single-flight lock file
pub(crate) mod naming;
pub(crate) mod pipeline;
pub(crate) mod retention;
pub(crate) mod retry;
pub(crate) mod sqlite_export;
pub(crate) mod upload;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::errors::BackupError;

pub use logic::{BackupOrchestrator, RunOutcome, RunReport, RunState};

/// Public entry point for one backup run.
/// Returns the process exit code; the run itself logs its summary.
pub async fn run_backup_flow(app_config: AppConfig, cancel: &CancellationToken) -> u8 {
    let report = BackupOrchestrator::new(app_config).run(cancel).await;
    report.exit_code()
}

/// Entry point for the standalone retention sweep.
pub async fn run_cleanup_flow(
    app_config: AppConfig,
    force_dry_run: bool,
    cancel: &CancellationToken,
) -> Result<retention::RetentionReport, BackupError> {
    BackupOrchestrator::new(app_config).cleanup(force_dry_run, cancel).await
}
