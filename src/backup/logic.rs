use chrono::{DateTime, Local, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::db_dump::{DumpStrategy, StrategyRegistry};
use super::limiter::TransferLimiter;
use super::lock::{LockToken, SingleFlightGuard};
use super::naming::{NameFormatter, RunMetadata};
use super::pipeline::StreamPipeline;
use super::retention::{RetentionReport, RetentionSweeper};
use super::upload::Uploader;
use crate::config::{AppConfig, BackupJobSpec, Engine, RetentionPolicy};
use crate::errors::BackupError;
use crate::storage::{self, ObjectStore};

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    LockAcquiring,
    Validating,
    Dumping,
    Uploading,
    Retaining,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::LockAcquiring => "lock_acquiring",
            RunState::Validating => "validating",
            RunState::Dumping => "dumping",
            RunState::Uploading => "uploading",
            RunState::Retaining => "retaining",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Skipped,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Skipped => "skipped",
            RunOutcome::Failed => "failed",
        }
    }
}

/// Everything one run produced, success or not.
#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub final_state: RunState,
    /// State the run was in when it failed.
    pub failed_stage: Option<RunState>,
    pub engine: Option<Engine>,
    pub database: Option<String>,
    pub object_key: Option<String>,
    pub dump_bytes: u64,
    pub uploaded_bytes: u64,
    pub duration: Duration,
    pub retention: Option<RetentionReport>,
    pub error: Option<BackupError>,
}

impl RunReport {
    pub fn exit_code(&self) -> u8 {
        self.error.as_ref().map_or(0, BackupError::exit_code)
    }
}

/// State of one run between acquiring the lock and reaching a terminal state.
///
/// Owns the lock token, so dropping the context on any error path releases
/// the lock.
struct RunContext {
    spec: BackupJobSpec,
    started: DateTime<Local>,
    object_name: String,
    object_key: String,
    pid: u32,
    lock: LockToken,
}

impl RunContext {
    fn release(self) {
        if let Err(e) = self.lock.release() {
            tracing::warn!(error = %e, "failed to release lock");
        }
    }
}

/// Facts gathered while a run progresses, for the summary line.
#[derive(Debug, Default)]
struct Progress {
    engine: Option<Engine>,
    database: Option<String>,
    object_key: Option<String>,
    dump_bytes: u64,
    uploaded_bytes: u64,
    retention: Option<RetentionReport>,
}

/// Runs one backup: lock, validate, dump and upload, retention, release.
pub struct BackupOrchestrator {
    config: AppConfig,
    registry: StrategyRegistry,
    guard: SingleFlightGuard,
    store: Option<Arc<dyn ObjectStore>>,
    state: watch::Sender<RunState>,
}

impl BackupOrchestrator {
    pub fn new(config: AppConfig) -> Self {
        let guard = SingleFlightGuard::new(config.lock_path.clone());
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            config,
            registry: StrategyRegistry::default(),
            guard,
            store: None,
            state,
        }
    }

    /// Replaces the dump strategies.
    pub fn with_registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Uses `store` instead of connecting to the configured destination.
    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Follows the state of the current run.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    fn enter(&self, state: RunState) {
        tracing::debug!(state = %state, "run state changed");
        self.state.send_replace(state);
    }

    async fn store_for(&self, spec_destination: &storage::Destination) -> Result<Arc<dyn ObjectStore>, BackupError> {
        match &self.store {
            Some(store) => Ok(store.clone()),
            None => Ok(storage::connect(spec_destination, &self.config.s3).await?),
        }
    }

    /// Runs one backup and reports how it ended. Never panics on run errors;
    /// the report carries the exit code.
    pub async fn run(&self, cancel: &CancellationToken) -> RunReport {
        let started = Instant::now();
        let mut progress = Progress {
            engine: self.config.settings.engine,
            database: self.config.settings.database.clone(),
            ..Progress::default()
        };

        self.enter(RunState::LockAcquiring);
        let result = match self.guard.acquire() {
            Ok(lock) => self.execute(lock, &mut progress, cancel).await,
            Err(e) => Err((RunState::LockAcquiring, e)),
        };

        let (final_state, outcome, failed_stage, error) = match result {
            Ok(()) => (RunState::Done, RunOutcome::Success, None, None),
            // A skip still ends in Failed, but with the benign exit code.
            Err((stage, e)) if e.is_benign() => (RunState::Failed, RunOutcome::Skipped, Some(stage), Some(e)),
            Err((stage, e)) => (RunState::Failed, RunOutcome::Failed, Some(stage), Some(e)),
        };
        self.enter(final_state);

        let report = RunReport {
            outcome,
            final_state,
            failed_stage,
            engine: progress.engine,
            database: progress.database,
            object_key: progress.object_key,
            dump_bytes: progress.dump_bytes,
            uploaded_bytes: progress.uploaded_bytes,
            duration: started.elapsed(),
            retention: progress.retention,
            error,
        };
        log_summary(&report);
        report
    }

    /// Everything after the lock is taken. The lock is released before this
    /// returns, whatever the result.
    async fn execute(
        &self,
        lock: LockToken,
        progress: &mut Progress,
        cancel: &CancellationToken,
    ) -> Result<(), (RunState, BackupError)> {
        self.enter(RunState::Validating);
        let (ctx, strategy) = self
            .prepare(lock)
            .map_err(|e| (RunState::Validating, e))?;
        progress.engine = Some(ctx.spec.engine);
        progress.database = Some(ctx.spec.database.clone());
        progress.object_key = Some(ctx.object_key.clone());
        tracing::info!(
            engine = %ctx.spec.engine,
            database = %ctx.spec.database,
            object = %ctx.object_key,
            pid = ctx.pid,
            started = %ctx.started.to_rfc3339(),
            "backup run started"
        );

        let store = self
            .store_for(&ctx.spec.destination)
            .await
            .map_err(|e| (RunState::Validating, e))?;
        let limiter = Arc::new(TransferLimiter::new(ctx.spec.transfer.clone()));

        self.enter(RunState::Dumping);
        let dump = strategy.open(&ctx.spec).await.map_err(|e| (RunState::Dumping, e))?;

        self.enter(RunState::Uploading);
        let pipeline = StreamPipeline::new(self.config.pipeline, ctx.spec.transfer.clone(), strategy.compress());
        let uploader = Uploader::new(store.clone(), limiter.clone(), ctx.object_key.clone());
        let report = pipeline.run(dump, &uploader, cancel).await.map_err(|e| {
            let stage = match e {
                BackupError::Connection(_) | BackupError::Auth(_) | BackupError::EngineInvocation(_) => {
                    RunState::Dumping
                }
                _ => RunState::Uploading,
            };
            (stage, e)
        })?;
        progress.dump_bytes = report.dump_bytes;
        progress.uploaded_bytes = report.uploaded_bytes;
        tracing::info!(
            object = %ctx.object_key,
            name = %ctx.object_name,
            dump_bytes = report.dump_bytes,
            uploaded_bytes = report.uploaded_bytes,
            multipart = report.upload.multipart,
            parts = report.upload.parts,
            peak_buffered = report.peak_buffered,
            "backup uploaded"
        );

        if let Some(policy) = ctx.spec.retention {
            self.enter(RunState::Retaining);
            let sweeper = RetentionSweeper::new(store, limiter);
            match sweeper
                .sweep(&ctx.spec.destination.list_prefix(), policy, Utc::now(), cancel)
                .await
            {
                Ok(retention) => progress.retention = Some(retention),
                Err(e) => tracing::warn!(error = %e, "retention sweep failed, backup is kept"),
            }
        }

        ctx.release();
        Ok(())
    }

    fn prepare(
        &self,
        lock: LockToken,
    ) -> Result<(RunContext, Arc<dyn DumpStrategy>), BackupError> {
        let spec = self
            .config
            .settings
            .validate(&self.config.transfer, self.config.retention)?;
        let strategy = self.registry.get(spec.engine)?;
        let started = Local::now();
        let meta = RunMetadata::for_job(&spec, strategy.extension(), started);
        let object_name = NameFormatter::new(spec.name_template.clone())?.object_name(&meta);
        let object_key = spec.destination.object_key(&object_name);
        let ctx = RunContext {
            spec,
            started,
            object_name,
            object_key,
            pid: lock.record().pid,
            lock,
        };
        Ok((ctx, strategy))
    }

    /// Standalone retention sweep over the configured destination.
    ///
    /// `force_dry_run` only ever makes the sweep more conservative.
    pub async fn cleanup(&self, force_dry_run: bool, cancel: &CancellationToken) -> Result<RetentionReport, BackupError> {
        let started = Instant::now();
        let result = self.sweep_once(force_dry_run, cancel).await;
        match &result {
            Ok(report) => tracing::info!(
                operation = "cleanup",
                outcome = "success",
                candidates = report.candidates,
                deleted = report.deleted,
                failed = report.failed,
                dry_run = report.dry_run,
                duration_ms = started.elapsed().as_millis() as u64,
                exit_code = 0,
                "cleanup finished"
            ),
            Err(e) if e.is_benign() => tracing::info!(
                operation = "cleanup",
                outcome = "skipped",
                reason = %e,
                duration_ms = started.elapsed().as_millis() as u64,
                exit_code = 0,
                "cleanup skipped"
            ),
            Err(e) => tracing::error!(
                operation = "cleanup",
                outcome = "failed",
                error_kind = e.kind(),
                error = %e,
                duration_ms = started.elapsed().as_millis() as u64,
                exit_code = e.exit_code(),
                "cleanup finished"
            ),
        }
        result
    }

    async fn sweep_once(&self, force_dry_run: bool, cancel: &CancellationToken) -> Result<RetentionReport, BackupError> {
        let retention = self
            .config
            .retention
            .ok_or_else(|| BackupError::Config("RETENTION_DAYS must be set to run cleanup".to_string()))?;
        let policy = RetentionPolicy {
            dry_run: retention.dry_run || force_dry_run,
            ..retention
        };
        let destination = self.config.destination()?;
        let lock = self.guard.acquire()?;

        let store = self.store_for(&destination).await?;
        let limiter = Arc::new(TransferLimiter::new(Arc::new(self.config.transfer.clone())));
        let result = RetentionSweeper::new(store, limiter)
            .sweep(&destination.list_prefix(), policy, Utc::now(), cancel)
            .await;
        lock.release()?;
        result
    }
}

fn log_summary(report: &RunReport) {
    let engine = report.engine.map(|e| e.as_str()).unwrap_or("unknown");
    let database = report.database.as_deref().unwrap_or("unknown");
    let object = report.object_key.as_deref().unwrap_or("-");
    let duration_ms = report.duration.as_millis() as u64;
    match (&report.outcome, &report.error) {
        (RunOutcome::Failed, Some(e)) => tracing::error!(
            engine,
            database,
            object,
            duration_ms,
            bytes = report.uploaded_bytes,
            outcome = report.outcome.as_str(),
            stage = report.failed_stage.map(|s| s.as_str()).unwrap_or("unknown"),
            error_kind = e.kind(),
            error = %e,
            exit_code = report.exit_code(),
            "backup run finished"
        ),
        (RunOutcome::Skipped, Some(e)) => tracing::info!(
            engine,
            database,
            duration_ms,
            bytes = 0u64,
            outcome = report.outcome.as_str(),
            reason = %e,
            exit_code = report.exit_code(),
            "backup run skipped"
        ),
        _ => tracing::info!(
            engine,
            database,
            object,
            duration_ms,
            bytes = report.uploaded_bytes,
            dump_bytes = report.dump_bytes,
            outcome = report.outcome.as_str(),
            retention_deleted = report.retention.as_ref().map_or(0, |r| r.deleted),
            exit_code = report.exit_code(),
            "backup run finished"
        ),
    }
}
