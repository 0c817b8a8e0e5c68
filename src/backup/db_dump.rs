// db-stream-backup/src/backup/db_dump.rs
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::io::SyncIoBridge;
use url::Url;

use super::pipeline::DumpStream;
use super::sqlite_export;
use crate::config::{BackupJobSpec, Engine};
use crate::errors::BackupError;
use crate::utils::{find_executable, setting, stderr_tail};

/// Bytes of a dump tool's stderr kept for the error report.
const STDERR_TAIL: usize = 4096;

/// Produces the byte stream of one database engine's dump.
///
/// Strategies are looked up by engine in a [`StrategyRegistry`]; adding an
/// engine means registering another implementation.
#[async_trait]
pub trait DumpStrategy: Send + Sync {
    fn engine(&self) -> Engine;

    /// Extension of the uploaded object, without the leading dot.
    fn extension(&self) -> &'static str;

    /// Whether the stream still needs gzip compression.
    fn compress(&self) -> bool;

    /// Starts the dump. Nothing is read until the returned stream is polled,
    /// and dropping the stream stops the producer.
    async fn open(&self, spec: &BackupJobSpec) -> Result<DumpStream, BackupError>;
}

/// `pg_dump` in custom format, which is compressed and self-describing.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDump;

impl PostgresDump {
    fn args(spec: &BackupJobSpec) -> Result<Vec<String>, BackupError> {
        let mut url = Url::parse("postgresql://localhost")
            .map_err(|e| BackupError::Config(format!("failed to build connection URL: {}", e)))?;
        url.set_host(Some(&spec.host))
            .map_err(|e| BackupError::Config(format!("invalid DB_HOST '{}': {}", spec.host, e)))?;
        url.set_port(Some(spec.port))
            .map_err(|_| BackupError::Config(format!("cannot set port {} on host '{}'", spec.port, spec.host)))?;
        if let Some(user) = &spec.credentials.user {
            url.set_username(user)
                .map_err(|_| BackupError::Config(format!("cannot set user '{}' on host '{}'", user, spec.host)))?;
        }
        url.set_path(&spec.database);

        let mut args = vec![
            "--format=custom".to_string(),
            "--no-password".to_string(),
            format!("--dbname={}", url),
        ];
        args.extend(spec.dump_extra_args.iter().cloned());
        Ok(args)
    }
}

#[async_trait]
impl DumpStrategy for PostgresDump {
    fn engine(&self) -> Engine {
        Engine::Postgres
    }

    fn extension(&self) -> &'static str {
        "dump"
    }

    fn compress(&self) -> bool {
        false
    }

    async fn open(&self, spec: &BackupJobSpec) -> Result<DumpStream, BackupError> {
        let binary = find_executable("pg_dump")?;
        if spec.preflight {
            setting::check_db_connection(spec).await?;
        }
        let mut envs = Vec::new();
        if let Some(password) = &spec.credentials.password {
            envs.push(("PGPASSWORD", password.clone()));
        }
        spawn_dump("pg_dump", &binary, Self::args(spec)?, envs)
    }
}

/// `mysqldump` with a consistent snapshot, producing plain SQL.
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlDump;

impl MySqlDump {
    fn args(spec: &BackupJobSpec) -> Vec<String> {
        let mut args = vec![
            "--single-transaction".to_string(),
            "--quick".to_string(),
            "--routines".to_string(),
            format!("--host={}", spec.host),
            format!("--port={}", spec.port),
        ];
        if let Some(user) = &spec.credentials.user {
            args.push(format!("--user={}", user));
        }
        args.extend(spec.dump_extra_args.iter().cloned());
        args.push(spec.database.clone());
        args
    }
}

#[async_trait]
impl DumpStrategy for MySqlDump {
    fn engine(&self) -> Engine {
        Engine::MySql
    }

    fn extension(&self) -> &'static str {
        "sql.gz"
    }

    fn compress(&self) -> bool {
        true
    }

    async fn open(&self, spec: &BackupJobSpec) -> Result<DumpStream, BackupError> {
        let binary = find_executable("mysqldump")?;
        if spec.preflight {
            setting::check_db_connection(spec).await?;
        }
        let mut envs = Vec::new();
        if let Some(password) = &spec.credentials.password {
            envs.push(("MYSQL_PWD", password.clone()));
        }
        spawn_dump("mysqldump", &binary, Self::args(spec), envs)
    }
}

/// In-process SQL export of a database file.
#[derive(Debug, Clone, Copy)]
pub struct SqliteDump {
    window: usize,
}

impl Default for SqliteDump {
    fn default() -> Self {
        Self { window: 64 * 1024 }
    }
}

#[async_trait]
impl DumpStrategy for SqliteDump {
    fn engine(&self) -> Engine {
        Engine::Sqlite
    }

    fn extension(&self) -> &'static str {
        "db.gz"
    }

    fn compress(&self) -> bool {
        true
    }

    async fn open(&self, spec: &BackupJobSpec) -> Result<DumpStream, BackupError> {
        let path = PathBuf::from(&spec.database);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(BackupError::Connection(format!("{} is not a file", path.display())));
            }
            Err(e) => {
                return Err(BackupError::Connection(format!(
                    "cannot open SQLite database {}: {}",
                    path.display(),
                    e
                )));
            }
        }

        let (reader, writer) = tokio::io::duplex(self.window);
        let bridge = SyncIoBridge::new(writer);
        let export = tokio::task::spawn_blocking(move || export_to(&path, bridge));
        let finished = async move {
            match export.await {
                Ok(result) => result,
                Err(e) => Err(BackupError::EngineInvocation(format!("SQLite export task failed: {}", e))),
            }
        }
        .boxed();

        Ok(DumpStream {
            reader: Box::pin(reader),
            finished,
        })
    }
}

fn export_to(path: &Path, bridge: SyncIoBridge<tokio::io::DuplexStream>) -> Result<(), BackupError> {
    let mut out = BufWriter::new(bridge);
    let stats = sqlite_export::export_database(path, &mut out)
        .map_err(|e| BackupError::EngineInvocation(format!("SQLite export of {} failed: {:#}", path.display(), e)))?;
    let mut bridge = out
        .into_inner()
        .map_err(|e| BackupError::EngineInvocation(format!("SQLite export flush failed: {}", e.error())))?;
    bridge
        .shutdown()
        .map_err(|e| BackupError::EngineInvocation(format!("SQLite export close failed: {}", e)))?;
    tracing::debug!(path = %path.display(), tables = stats.tables, rows = stats.rows, "SQLite export finished");
    Ok(())
}

/// Spawns a dump tool with stdout as the dump stream.
///
/// Stderr is drained concurrently into a bounded tail, which classifies the
/// failure when the tool exits non-zero.
fn spawn_dump(
    tool: &'static str,
    binary: &Path,
    args: Vec<String>,
    envs: Vec<(&'static str, String)>,
) -> Result<DumpStream, BackupError> {
    tracing::debug!(tool, binary = %binary.display(), "starting dump process");
    let mut child = Command::new(binary)
        .args(&args)
        .envs(envs)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BackupError::EngineInvocation(format!("failed to start {}: {}", tool, e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BackupError::EngineInvocation(format!("{} stdout was not captured", tool)))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| BackupError::EngineInvocation(format!("{} stderr was not captured", tool)))?;

    let tail = tokio::spawn(async move {
        let mut kept: Vec<u8> = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    kept.extend_from_slice(&buf[..n]);
                    if kept.len() > 2 * STDERR_TAIL {
                        kept.drain(..kept.len() - STDERR_TAIL);
                    }
                }
            }
        }
        stderr_tail(&kept, STDERR_TAIL)
    });

    let finished = async move {
        let status = child
            .wait()
            .await
            .map_err(|e| BackupError::EngineInvocation(format!("failed to wait for {}: {}", tool, e)))?;
        let detail = tail.await.unwrap_or_default();
        if status.success() {
            if !detail.is_empty() {
                tracing::debug!(tool, stderr = %detail, "dump process reported warnings");
            }
            return Ok(());
        }
        tracing::error!(tool, status = %status, stderr = %detail, "dump process failed");
        Err(setting::classify_failure(tool, &format!("exited with {}: {}", status, detail)))
    }
    .boxed();

    Ok(DumpStream {
        reader: Box::pin(stdout),
        finished,
    })
}

/// Dump strategies by engine.
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<Engine, Arc<dyn DumpStrategy>>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        let mut registry = Self {
            strategies: HashMap::new(),
        };
        registry.register(Arc::new(PostgresDump));
        registry.register(Arc::new(MySqlDump));
        registry.register(Arc::new(SqliteDump::default()));
        registry
    }
}

impl StrategyRegistry {
    /// Adds or replaces the strategy for its engine.
    pub fn register(&mut self, strategy: Arc<dyn DumpStrategy>) {
        self.strategies.insert(strategy.engine(), strategy);
    }

    pub fn get(&self, engine: Engine) -> Result<Arc<dyn DumpStrategy>, BackupError> {
        self.strategies
            .get(&engine)
            .cloned()
            .ok_or_else(|| BackupError::Config(format!("no dump strategy registered for {}", engine)))
    }
}
