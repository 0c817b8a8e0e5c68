// db-stream-backup/src/backup/retention.rs
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::limiter::TransferLimiter;
use super::retry::with_retry;
use crate::config::RetentionPolicy;
use crate::errors::BackupError;
use crate::storage::{ObjectInfo, ObjectStore};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub listed: usize,
    /// Objects older than the cutoff.
    pub candidates: usize,
    pub attempted: usize,
    pub deleted: usize,
    pub failed: usize,
    pub dry_run: bool,
}

/// Deletes objects whose store-reported age exceeds the retention policy.
pub struct RetentionSweeper {
    store: Arc<dyn ObjectStore>,
    limiter: Arc<TransferLimiter>,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn ObjectStore>, limiter: Arc<TransferLimiter>) -> Self {
        Self { store, limiter }
    }

    /// Sweeps everything under `prefix`, one listing page at a time.
    ///
    /// A failed listing ends the sweep with [`BackupError::Retention`]; a
    /// failed delete is logged and counted, and the sweep goes on.
    pub async fn sweep(
        &self,
        prefix: &str,
        policy: RetentionPolicy,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RetentionReport, BackupError> {
        let cutoff = now - ChronoDuration::days(i64::from(policy.max_age_days));
        let checkers = self.limiter.policy().checkers.max(1);
        let mut report = RetentionReport {
            dry_run: policy.dry_run,
            ..RetentionReport::default()
        };
        tracing::info!(
            store = self.store.name(),
            prefix,
            max_age_days = policy.max_age_days,
            cutoff = %cutoff,
            dry_run = policy.dry_run,
            "retention sweep started"
        );

        let mut token: Option<String> = None;
        loop {
            let page = with_retry(&self.limiter, cancel, "list objects", || {
                self.store.list_page(prefix, token.clone())
            })
            .await
            .map_err(|e| match e {
                BackupError::Cancelled(msg) => BackupError::Cancelled(msg),
                other => BackupError::Retention(format!("listing {} failed: {}", prefix, other)),
            })?;

            report.listed += page.objects.len();
            let expired: Vec<ObjectInfo> = page
                .objects
                .into_iter()
                .filter(|o| o.last_modified < cutoff)
                .collect();
            report.candidates += expired.len();

            if policy.dry_run {
                for object in &expired {
                    tracing::info!(
                        key = %object.key,
                        size = object.size,
                        last_modified = %object.last_modified,
                        "dry run: would delete expired backup"
                    );
                }
            } else {
                report.attempted += expired.len();
                let outcomes: Vec<bool> = stream::iter(expired)
                    .map(|object| self.delete(object, cancel))
                    .buffer_unordered(checkers)
                    .collect()
                    .await;
                let deleted = outcomes.iter().filter(|ok| **ok).count();
                report.deleted += deleted;
                report.failed += outcomes.len() - deleted;
            }

            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled("retention sweep interrupted".to_string()));
            }
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        tracing::info!(
            listed = report.listed,
            candidates = report.candidates,
            attempted = report.attempted,
            deleted = report.deleted,
            failed = report.failed,
            dry_run = report.dry_run,
            "retention sweep finished"
        );
        Ok(report)
    }

    async fn delete(&self, object: ObjectInfo, cancel: &CancellationToken) -> bool {
        let what = format!("delete {}", object.key);
        match with_retry(&self.limiter, cancel, &what, || self.store.delete_object(&object.key)).await {
            Ok(()) => {
                tracing::info!(key = %object.key, last_modified = %object.last_modified, "deleted expired backup");
                true
            }
            Err(e) => {
                tracing::warn!(key = %object.key, error = %e, "failed to delete expired backup");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferPolicy;
    use crate::storage::{ListPage, MemoryStore, StoreError, StoreResult, UploadedPart};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;

    fn limiter() -> Arc<TransferLimiter> {
        Arc::new(TransferLimiter::new(Arc::new(TransferPolicy {
            checkers: 3,
            retries: 1,
            retry_sleep: Duration::from_millis(1),
            ..TransferPolicy::default()
        })))
    }

    /// 25 objects under `db/`, one per day of age, plus one outside the prefix.
    fn seeded(now: DateTime<Utc>) -> MemoryStore {
        let store = MemoryStore::new().with_page_size(4);
        for age in 0..25 {
            store.insert(&format!("db/backup_{:02}.gz", age), Bytes::from_static(b"x"), now - ChronoDuration::days(age));
        }
        store.insert("other/ancient.gz", Bytes::from_static(b"x"), now - ChronoDuration::days(400));
        store
    }

    fn policy(dry_run: bool) -> RetentionPolicy {
        RetentionPolicy {
            max_age_days: 7,
            dry_run,
        }
    }

    #[tokio::test]
    async fn test_sweep_deletes_only_expired_objects_across_pages() -> anyhow::Result<()> {
        let now = Utc::now();
        let store = seeded(now);
        let sweeper = RetentionSweeper::new(Arc::new(store.clone()), limiter());

        let report = sweeper.sweep("db/", policy(false), now, &CancellationToken::new()).await?;
        // Ages 8..=24 are strictly older than seven days.
        assert_eq!(report.listed, 25);
        assert_eq!(report.candidates, 17);
        assert_eq!(report.attempted, 17);
        assert_eq!(report.deleted, 17);
        assert_eq!(report.failed, 0);

        let keys = store.keys();
        assert_eq!(keys.len(), 9);
        assert!(keys.contains(&"db/backup_07.gz".to_string()));
        assert!(keys.contains(&"other/ancient.gz".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_dry_run_reports_same_candidates_without_deleting() -> anyhow::Result<()> {
        let now = Utc::now();
        let dry_store = seeded(now);
        let dry = RetentionSweeper::new(Arc::new(dry_store.clone()), limiter())
            .sweep("db/", policy(true), now, &CancellationToken::new())
            .await?;
        assert_eq!(dry_store.keys().len(), 26);
        assert_eq!(dry.attempted, 0);
        assert_eq!(dry.deleted, 0);

        let real = RetentionSweeper::new(Arc::new(seeded(now)), limiter())
            .sweep("db/", policy(false), now, &CancellationToken::new())
            .await?;
        assert_eq!(dry.candidates, real.deleted);
        Ok(())
    }

    /// Refuses to delete keys containing "locked".
    struct StubbornStore(MemoryStore);

    #[async_trait]
    impl ObjectStore for StubbornStore {
        fn name(&self) -> &'static str {
            "stubborn"
        }
        async fn put_object(&self, key: &str, body: Bytes) -> StoreResult<()> {
            self.0.put_object(key, body).await
        }
        async fn begin_upload(&self, key: &str) -> StoreResult<String> {
            self.0.begin_upload(key).await
        }
        async fn upload_part(&self, key: &str, id: &str, n: i32, body: Bytes) -> StoreResult<UploadedPart> {
            self.0.upload_part(key, id, n, body).await
        }
        async fn complete_upload(&self, key: &str, id: &str, parts: Vec<UploadedPart>) -> StoreResult<()> {
            self.0.complete_upload(key, id, parts).await
        }
        async fn abort_upload(&self, key: &str, id: &str) -> StoreResult<()> {
            self.0.abort_upload(key, id).await
        }
        async fn list_page(&self, prefix: &str, token: Option<String>) -> StoreResult<ListPage> {
            self.0.list_page(prefix, token).await
        }
        async fn delete_object(&self, key: &str) -> StoreResult<()> {
            if key.contains("locked") {
                return Err(StoreError::Permanent("AccessDenied".into()));
            }
            self.0.delete_object(key).await
        }
    }

    #[tokio::test]
    async fn test_failed_deletes_do_not_stop_the_sweep() -> anyhow::Result<()> {
        let now = Utc::now();
        let inner = MemoryStore::new().with_page_size(2);
        let old = now - ChronoDuration::days(30);
        for key in ["a.gz", "b-locked.gz", "c.gz", "d-locked.gz", "e.gz"] {
            inner.insert(key, Bytes::from_static(b"x"), old);
        }
        let sweeper = RetentionSweeper::new(Arc::new(StubbornStore(inner.clone())), limiter());
        let report = sweeper.sweep("", policy(false), now, &CancellationToken::new()).await?;

        assert_eq!(report.attempted, 5);
        assert_eq!(report.deleted, 3);
        assert_eq!(report.failed, 2);
        assert_eq!(inner.keys(), vec!["b-locked.gz".to_string(), "d-locked.gz".to_string()]);
        Ok(())
    }
}
