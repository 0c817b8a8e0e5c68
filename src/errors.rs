use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure kinds of a backup run.
///
/// The variant decides the exit code and whether a retry is worth it. Only
/// transfer errors are ever retried, and only inside the upload stage.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("another backup is already running (pid {pid}, since {since})")]
    AlreadyRunning { pid: u32, since: DateTime<Utc> },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Dump failed: {0}")]
    EngineInvocation(String),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("Retention sweep failed: {0}")]
    Retention(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("transient transfer failure, gave up after {attempts} attempts: {message}")]
    Transient { attempts: u32, message: String },

    #[error("permanent transfer failure: {0}")]
    Permanent(String),
}

impl BackupError {
    /// Process exit code for a run that ended with this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::AlreadyRunning { .. } => 0,
            BackupError::Config(_) | BackupError::Lock(_) => 1,
            _ => 2,
        }
    }

    /// Skips are an expected concurrency outcome, not a failure.
    pub fn is_benign(&self) -> bool {
        matches!(self, BackupError::AlreadyRunning { .. })
    }

    /// Short machine-friendly label used in the summary line.
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::AlreadyRunning { .. } => "already_running",
            BackupError::Config(_) => "config",
            BackupError::Lock(_) => "lock",
            BackupError::Connection(_) => "connection",
            BackupError::Auth(_) => "auth",
            BackupError::EngineInvocation(_) => "engine_invocation",
            BackupError::Transfer(TransferError::Transient { .. }) => "transfer_transient",
            BackupError::Transfer(TransferError::Permanent(_)) => "transfer_permanent",
            BackupError::Retention(_) => "retention",
            BackupError::Cancelled(_) => "cancelled",
        }
    }
}

impl From<anyhow::Error> for BackupError {
    fn from(err: anyhow::Error) -> Self {
        BackupError::Config(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_taxonomy() {
        let skip = BackupError::AlreadyRunning { pid: 1, since: Utc::now() };
        assert_eq!(skip.exit_code(), 0);
        assert!(skip.is_benign());

        assert_eq!(BackupError::Config("missing DB_NAME".into()).exit_code(), 1);
        assert_eq!(BackupError::Auth("bad password".into()).exit_code(), 2);
        assert_eq!(
            BackupError::Transfer(TransferError::Transient {
                attempts: 4,
                message: "SlowDown".into()
            })
            .exit_code(),
            2
        );
        assert_eq!(BackupError::Cancelled("SIGTERM".into()).exit_code(), 2);
    }

    #[test]
    fn anyhow_context_becomes_config_error() {
        let err = anyhow::anyhow!("invalid digit").context("TRANSFER_RETRIES is not a number");
        let converted: BackupError = err.into();
        match converted {
            BackupError::Config(msg) => {
                assert!(msg.contains("TRANSFER_RETRIES"));
                assert!(msg.contains("invalid digit"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
