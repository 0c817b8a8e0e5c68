// db-stream-backup/src/backup/lock.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::{Pid, ProcessRefreshKind, RefreshKind, System};
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::errors::BackupError;

/// How many create/takeover rounds to try before reporting contention.
const ACQUIRE_ROUNDS: usize = 5;
/// Process start times are reported in whole seconds and may drift by one.
const START_TIME_TOLERANCE_SECS: u64 = 2;

/// Content of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    /// Start time of `pid` in seconds since the epoch, to detect pid reuse.
    pub process_started: Option<u64>,
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
}

/// Decides whether the process behind a lock record still exists.
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, record: &LockRecord) -> bool;

    /// Start time of the current process, stored in new records.
    fn current_start_time(&self) -> Option<u64>;
}

/// Checks the process table of the local host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl SystemProbe {
    fn start_time_of(pid: u32) -> Option<Option<u64>> {
        let sys = System::new_with_specifics(RefreshKind::new().with_processes(ProcessRefreshKind::new()));
        sys.process(Pid::from_u32(pid)).map(|p| Some(p.start_time()))
    }
}

impl LivenessProbe for SystemProbe {
    fn is_alive(&self, record: &LockRecord) -> bool {
        match (Self::start_time_of(record.pid), record.process_started) {
            (None, _) => false,
            (Some(Some(actual)), Some(expected)) => actual.abs_diff(expected) <= START_TIME_TOLERANCE_SECS,
            (Some(_), _) => true,
        }
    }

    fn current_start_time(&self) -> Option<u64> {
        Self::start_time_of(std::process::id()).flatten()
    }
}

/// Host-wide single-flight lock backed by a file.
///
/// The lock file is created atomically (write to a temp file, then link it
/// into place only if nothing exists there). A record whose process is gone
/// is stale and may be taken over.
#[derive(Clone)]
pub struct SingleFlightGuard {
    path: PathBuf,
    probe: Arc<dyn LivenessProbe>,
}

impl std::fmt::Debug for SingleFlightGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlightGuard").field("path", &self.path).finish()
    }
}

impl SingleFlightGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_probe(path, Arc::new(SystemProbe))
    }

    pub fn with_probe(path: impl Into<PathBuf>, probe: Arc<dyn LivenessProbe>) -> Self {
        Self {
            path: path.into(),
            probe,
        }
    }

    /// Takes the lock or reports who holds it.
    ///
    /// Returns [`BackupError::AlreadyRunning`] when a live process holds the
    /// lock, including the calling process itself.
    pub fn acquire(&self) -> Result<LockToken, BackupError> {
        let dir = self.lock_dir();
        fs::create_dir_all(&dir).map_err(|e| lock_error("failed to create lock directory", &dir, e))?;

        for _ in 0..ACQUIRE_ROUNDS {
            let record = LockRecord {
                pid: std::process::id(),
                process_started: self.probe.current_start_time(),
                token: Uuid::new_v4(),
                acquired_at: Utc::now(),
            };

            match self.try_create(&dir, &record) {
                Ok(()) => {
                    tracing::debug!(path = %self.path.display(), token = %record.token, "lock acquired");
                    return Ok(LockToken {
                        path: self.path.clone(),
                        record,
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(lock_error("failed to create lock file", &self.path, e)),
            }

            let Some(holder) = self.read_record(&self.path)? else {
                // Released between our create attempt and the read.
                continue;
            };
            if self.probe.is_alive(&holder) {
                return Err(BackupError::AlreadyRunning {
                    pid: holder.pid,
                    since: holder.acquired_at,
                });
            }
            tracing::warn!(
                path = %self.path.display(),
                pid = holder.pid,
                since = %holder.acquired_at,
                "lock holder is gone, taking over stale lock"
            );
            self.remove_stale(&holder)?;
        }

        Err(BackupError::Lock(format!(
            "could not acquire {} after {} attempts, lock is contended",
            self.path.display(),
            ACQUIRE_ROUNDS
        )))
    }

    /// The current lock record, if any.
    pub fn holder(&self) -> Result<Option<LockRecord>, BackupError> {
        self.read_record(&self.path)
    }

    fn lock_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn try_create(&self, dir: &Path, record: &LockRecord) -> io::Result<()> {
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut tmp, record)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist_noclobber(&self.path).map(|_| ()).map_err(|e| e.error)
    }

    /// Reads a record; `None` if the file does not exist.
    ///
    /// An unreadable record is treated as stale, with a zero pid that no
    /// live process can own.
    fn read_record(&self, path: &Path) -> Result<Option<LockRecord>, BackupError> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(lock_error("failed to read lock file", path, e)),
        };
        match serde_json::from_slice::<LockRecord>(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "lock file is corrupt, treating it as stale");
                Ok(Some(LockRecord {
                    pid: 0,
                    process_started: None,
                    token: Uuid::nil(),
                    acquired_at: DateTime::<Utc>::default(),
                }))
            }
        }
    }

    /// Moves the stale record out of the way.
    ///
    /// The rename is atomic, so of several contenders exactly one moves a
    /// given file. If what we moved is not the stale record we inspected
    /// (another contender already replaced it with a live one), it is linked
    /// back. A third contender creating a lock in the short window between
    /// the rename and the link back makes the link fail; that contender then
    /// wins and the moved record's owner keeps running without a file, which
    /// only matters if the same host also starts a fourth run in that window.
    fn remove_stale(&self, stale: &LockRecord) -> Result<(), BackupError> {
        let tombstone = self.path.with_extension(format!("stale-{}", Uuid::new_v4().simple()));
        match fs::rename(&self.path, &tombstone) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(lock_error("failed to move stale lock", &self.path, e)),
        }

        let moved = self.read_record(&tombstone)?;
        if moved.as_ref().is_some_and(|m| m.token != stale.token) {
            if let Err(e) = fs::hard_link(&tombstone, &self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "could not restore lock moved during takeover");
            }
        }
        if let Err(e) = fs::remove_file(&tombstone) {
            tracing::warn!(path = %tombstone.display(), error = %e, "failed to remove stale lock file");
        }
        Ok(())
    }
}

fn lock_error(what: &str, path: &Path, err: io::Error) -> BackupError {
    BackupError::Lock(format!("{} {}: {}", what, path.display(), err))
}

/// Proof of holding the lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockToken {
    path: PathBuf,
    record: LockRecord,
    released: bool,
}

impl LockToken {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Removes the lock file, but only if it still carries our token.
    pub fn release(mut self) -> Result<(), BackupError> {
        self.released = true;
        release_if_owned(&self.path, &self.record)
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = release_if_owned(&self.path, &self.record) {
            tracing::warn!(error = %e, "failed to release lock");
        }
    }
}

fn release_if_owned(path: &Path, record: &LockRecord) -> Result<(), BackupError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "lock file vanished before release");
            return Ok(());
        }
        Err(e) => return Err(lock_error("failed to read lock file", path, e)),
    };
    match serde_json::from_slice::<LockRecord>(&raw) {
        Ok(current) if current.token == record.token => {
            fs::remove_file(path).map_err(|e| lock_error("failed to remove lock file", path, e))?;
            tracing::debug!(path = %path.display(), token = %record.token, "lock released");
            Ok(())
        }
        _ => {
            tracing::warn!(path = %path.display(), "lock file now belongs to another run, leaving it in place");
            Ok(())
        }
    }
}
