// db-stream-backup/src/backup/limiter.rs
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::TransferPolicy;
use crate::errors::TransferError;

#[derive(Debug)]
struct ByteWindow {
    started: Instant,
    used: u64,
}

/// Applies a [`TransferPolicy`] to requests against the remote store.
///
/// One limiter is shared by every request of a run: the request-rate cap,
/// the in-flight transfer cap and the byte budget are all global to the run.
pub struct TransferLimiter {
    policy: Arc<TransferPolicy>,
    rate: Option<DefaultDirectRateLimiter>,
    slots: Arc<Semaphore>,
    window: Mutex<ByteWindow>,
}

impl TransferLimiter {
    pub fn new(policy: Arc<TransferPolicy>) -> Self {
        let rate = policy
            .requests_per_second
            .and_then(NonZeroU32::new)
            .map(|rps| RateLimiter::direct(Quota::per_second(rps)));
        let slots = Arc::new(Semaphore::new(policy.max_concurrent.max(1)));
        Self {
            policy,
            rate,
            slots,
            window: Mutex::new(ByteWindow {
                started: Instant::now(),
                used: 0,
            }),
        }
    }

    pub fn policy(&self) -> &TransferPolicy {
        &self.policy
    }

    /// Waits until the request-rate cap allows one more request.
    pub async fn request(&self) {
        if let Some(rate) = &self.rate {
            rate.until_ready().await;
        }
    }

    /// Waits for a free in-flight transfer slot; the slot is held until the permit drops.
    pub async fn transfer_slot(&self) -> Result<OwnedSemaphorePermit, TransferError> {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::Permanent("transfer slots closed".to_string()))
    }

    /// Books `bytes` against the per-window byte budget.
    ///
    /// Running out of budget is permanent for this run: waiting out the
    /// window is left to the next scheduled invocation.
    pub fn charge(&self, bytes: u64) -> Result<(), TransferError> {
        let Some(cap) = self.policy.max_bytes_per_window else {
            return Ok(());
        };
        let mut window = self
            .window
            .lock()
            .map_err(|_| TransferError::Permanent("transfer window mutex poisoned".to_string()))?;
        if window.started.elapsed() >= self.policy.window {
            window.started = Instant::now();
            window.used = 0;
        }
        if window.used.saturating_add(bytes) > cap {
            return Err(TransferError::Permanent(format!(
                "transfer budget of {} bytes per {} exhausted ({} bytes used)",
                cap,
                humantime::format_duration(self.policy.window),
                window.used
            )));
        }
        window.used += bytes;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy(f: impl FnOnce(&mut TransferPolicy)) -> Arc<TransferPolicy> {
        let mut policy = TransferPolicy::default();
        f(&mut policy);
        Arc::new(policy)
    }

    #[test]
    fn test_byte_budget_is_permanent_once_exhausted() {
        let limiter = TransferLimiter::new(policy(|p| p.max_bytes_per_window = Some(100)));
        assert!(limiter.charge(60).is_ok());
        assert!(limiter.charge(40).is_ok());
        match limiter.charge(1) {
            Err(TransferError::Permanent(msg)) => assert!(msg.contains("100 bytes")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_unlimited_budget() {
        let limiter = TransferLimiter::new(policy(|_| {}));
        assert!(limiter.charge(u64::MAX).is_ok());
        assert!(limiter.charge(u64::MAX).is_ok());
    }

    #[tokio::test]
    async fn test_transfer_slots_cap_concurrency() -> anyhow::Result<()> {
        let limiter = TransferLimiter::new(policy(|p| p.max_concurrent = 2));
        let a = limiter.transfer_slot().await?;
        let _b = limiter.transfer_slot().await?;
        let third = tokio::time::timeout(Duration::from_millis(20), limiter.transfer_slot()).await;
        assert!(third.is_err(), "third slot should wait");
        drop(a);
        let third = tokio::time::timeout(Duration::from_millis(200), limiter.transfer_slot()).await;
        assert!(third.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_request_rate_cap() {
        let limiter = TransferLimiter::new(policy(|p| p.requests_per_second = Some(20)));
        let started = std::time::Instant::now();
        // The quota allows a burst of 20, the rest are spaced 50ms apart.
        for _ in 0..22 {
            limiter.request().await;
        }
        assert!(started.elapsed() >= Duration::from_millis(80));
    }
}
