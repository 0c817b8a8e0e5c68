// db-stream-backup/src/backup/retry.rs
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::limiter::TransferLimiter;
use crate::errors::{BackupError, TransferError};
use crate::storage::StoreError;

/// Upper bound for a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Sleep before retry number `retry` (1-based) after `err`.
///
/// Rate-limit responses back off exponentially from the configured sleep,
/// other transient errors wait the configured sleep each time.
pub fn backoff_for(err: &StoreError, retry: u32, base: Duration) -> Duration {
    match err {
        StoreError::RateLimited(_) => {
            let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
            base.saturating_mul(factor).min(MAX_BACKOFF.max(base))
        }
        _ => base,
    }
}

/// Runs one storage request under the limiter, retrying transient failures.
///
/// The request is attempted at most `retries + 1` times. Permanent errors
/// fail immediately; exhausting the retries yields
/// [`TransferError::Transient`].
pub async fn with_retry<T, F, Fut>(
    limiter: &TransferLimiter,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, BackupError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let policy = limiter.policy();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        limiter.request().await;
        let err = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(BackupError::Cancelled(format!("{} interrupted", what)));
            }
            result = op() => match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            },
        };

        if !err.is_retryable() {
            tracing::error!(request = what, attempt, error = %err, "storage request failed permanently");
            return Err(TransferError::Permanent(err.to_string()).into());
        }
        if attempt > policy.retries {
            tracing::error!(request = what, attempts = attempt, error = %err, "storage request retries exhausted");
            return Err(TransferError::Transient {
                attempts: attempt,
                message: err.to_string(),
            }
            .into());
        }

        let sleep = backoff_for(&err, attempt, policy.retry_sleep);
        tracing::warn!(
            request = what,
            attempt,
            retries = policy.retries,
            sleep = %humantime::format_duration(sleep),
            error = %err,
            "storage request failed, retrying"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(BackupError::Cancelled(format!("{} interrupted", what)));
            }
            _ = tokio::time::sleep(sleep) => {}
        }
    }
}
