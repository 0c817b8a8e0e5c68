// db-stream-backup/src/config/mod.rs
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::BackupError;
use crate::storage::Destination;

const DEFAULT_PREFIX: &str = "backup";
const DEFAULT_LOCK_FILE: &str = "db-stream-backup.lock";

/// Database engines a dump strategy exists for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Postgres,
    MySql,
    Sqlite,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Postgres => "postgres",
            Engine::MySql => "mysql",
            Engine::Sqlite => "sqlite",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Engine::Postgres => 5432,
            Engine::MySql => 3306,
            Engine::Sqlite => 0,
        }
    }

    /// SQLite is addressed by file path, the others over the network.
    pub fn is_networked(&self) -> bool {
        !matches!(self, Engine::Sqlite)
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Engine::Postgres),
            "mysql" | "mariadb" => Ok(Engine::MySql),
            "sqlite" | "sqlite3" => Ok(Engine::Sqlite),
            other => Err(anyhow::anyhow!(
                "unsupported database engine '{}', expected one of postgres, mysql, sqlite",
                other
            )),
        }
    }
}

/// Rate and throughput limits for the remote-storage client.
///
/// Built once per run and shared by reference; nothing mutates it afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferPolicy {
    pub requests_per_second: Option<u32>,
    pub chunk_size: usize,
    pub upload_cutoff: usize,
    pub max_concurrent: usize,
    pub checkers: usize,
    pub max_bytes_per_window: Option<u64>,
    pub window: Duration,
    pub retries: u32,
    pub retry_sleep: Duration,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            requests_per_second: None,
            chunk_size: 8 * 1024 * 1024,
            upload_cutoff: 8 * 1024 * 1024,
            max_concurrent: 4,
            checkers: 8,
            max_bytes_per_window: None,
            window: Duration::from_secs(24 * 60 * 60),
            retries: 3,
            retry_sleep: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age_days: u32,
    pub dry_run: bool,
}

/// Sizing of the in-memory window between pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub buffer_size: usize,
    pub depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,
            depth: 4,
        }
    }
}

#[derive(Clone, Default)]
pub struct S3Settings {
    pub endpoint_url: Option<String>,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("endpoint_url", &self.endpoint_url)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key.as_ref().map(|_| "***"))
            .field("force_path_style", &self.force_path_style)
            .finish()
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Connection and naming settings as read from the environment.
///
/// Values are type-checked but not yet validated for completeness; that
/// happens in [`BackupSettings::validate`] once the run holds the lock.
#[derive(Debug, Clone, Default)]
pub struct BackupSettings {
    pub engine: Option<Engine>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub credentials: Credentials,
    pub destination: Option<String>,
    pub name_template: Option<String>,
    pub prefix: String,
    pub dump_extra_args: Vec<String>,
    pub preflight: bool,
}

/// Immutable description of one backup run.
#[derive(Debug, Clone)]
pub struct BackupJobSpec {
    pub engine: Engine,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub credentials: Credentials,
    pub destination: Destination,
    pub name_template: Option<String>,
    pub prefix: String,
    pub retention: Option<RetentionPolicy>,
    pub transfer: Arc<TransferPolicy>,
    pub dump_extra_args: Vec<String>,
    pub preflight: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub settings: BackupSettings,
    pub transfer: TransferPolicy,
    pub retention: Option<RetentionPolicy>,
    pub pipeline: PipelineConfig,
    pub s3: S3Settings,
    pub lock_path: PathBuf,
}

/// Smallest part S3 accepts for every part but the last.
const S3_MIN_PART_SIZE: usize = 5 * 1024 * 1024;
/// Most parts one S3 multipart upload may have.
const S3_MAX_PARTS: u64 = 10_000;

fn check_s3_part_size(chunk_size: usize) -> Result<()> {
    if chunk_size < S3_MIN_PART_SIZE {
        anyhow::bail!(
            "TRANSFER_CHUNK_SIZE is {} bytes, S3 needs at least {} bytes per part",
            chunk_size,
            S3_MIN_PART_SIZE
        );
    }
    let largest = chunk_size as u64 * S3_MAX_PARTS;
    tracing::debug!(
        chunk_size,
        max_object_bytes = largest,
        "S3 multipart uploads are capped at {} parts",
        S3_MAX_PARTS
    );
    Ok(())
}

/// Loads `.env` from the working directory (or a parent) into the process
/// environment. A missing file is not an error.
pub fn load_dotenv() -> Result<Option<PathBuf>> {
    env_file_outcome(dotenv::dotenv())
}

fn env_file_outcome<T>(result: dotenv::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(loaded) => Ok(Some(loaded)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(anyhow::anyhow!("failed to read .env file: {}", e)),
    }
}

impl AppConfig {
    /// Reads the process environment. `.env` is loaded once at startup by
    /// [`load_dotenv`].
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Builds the configuration from arbitrary key/value pairs.
    ///
    /// Empty values count as unset.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        let get = |key: &str| vars.get(key).map(|v| v.trim().to_string());

        for key in ["BACKUP_SCHEDULE", "CRON_SCHEDULE"] {
            if let Some(schedule) = get(key) {
                tracing::debug!(key, schedule = %schedule, "schedule is handled by the external scheduler, ignoring");
            }
        }

        let engine = get("DB_TYPE")
            .map(|v| v.parse::<Engine>())
            .transpose()
            .context("DB_TYPE is invalid")?;

        let password = match (get("DB_PASSWORD"), get("DB_PASSWORD_FILE")) {
            (Some(password), _) => Some(password),
            (None, Some(file)) => {
                let secret = fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read DB_PASSWORD_FILE at {}", file))?;
                Some(secret.trim_end_matches(['\r', '\n']).to_string())
            }
            (None, None) => None,
        };

        let settings = BackupSettings {
            engine,
            host: get("DB_HOST"),
            port: parse_opt(&get("DB_PORT"), "DB_PORT", |v| v.parse::<u16>().map_err(Into::into))?,
            database: get("DB_NAME"),
            credentials: Credentials {
                user: get("DB_USER"),
                password,
            },
            destination: get("BACKUP_DESTINATION"),
            name_template: get("BACKUP_NAME_TEMPLATE"),
            prefix: get("BACKUP_PREFIX").unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            dump_extra_args: get("DUMP_EXTRA_ARGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            preflight: parse_opt(&get("DB_PREFLIGHT"), "DB_PREFLIGHT", parse_bool)?.unwrap_or(true),
        };

        let defaults = TransferPolicy::default();
        let transfer = TransferPolicy {
            requests_per_second: parse_opt(&get("TRANSFER_TPS_LIMIT"), "TRANSFER_TPS_LIMIT", |v| {
                v.parse::<u32>().map_err(Into::into)
            })?
            .filter(|tps| *tps > 0),
            chunk_size: parse_opt(&get("TRANSFER_CHUNK_SIZE"), "TRANSFER_CHUNK_SIZE", parse_size)?
                .map(|v| v as usize)
                .unwrap_or(defaults.chunk_size),
            upload_cutoff: parse_opt(&get("TRANSFER_UPLOAD_CUTOFF"), "TRANSFER_UPLOAD_CUTOFF", parse_size)?
                .map(|v| v as usize)
                .unwrap_or(defaults.upload_cutoff),
            max_concurrent: parse_opt(&get("TRANSFER_MAX_CONCURRENT"), "TRANSFER_MAX_CONCURRENT", |v| {
                v.parse::<usize>().map_err(Into::into)
            })?
            .unwrap_or(defaults.max_concurrent),
            checkers: parse_opt(&get("TRANSFER_CHECKERS"), "TRANSFER_CHECKERS", |v| {
                v.parse::<usize>().map_err(Into::into)
            })?
            .unwrap_or(defaults.checkers),
            max_bytes_per_window: parse_opt(
                &get("TRANSFER_MAX_BYTES_PER_WINDOW"),
                "TRANSFER_MAX_BYTES_PER_WINDOW",
                parse_size,
            )?,
            window: parse_opt(&get("TRANSFER_WINDOW"), "TRANSFER_WINDOW", parse_duration)?
                .unwrap_or(defaults.window),
            retries: parse_opt(&get("TRANSFER_RETRIES"), "TRANSFER_RETRIES", |v| {
                v.parse::<u32>().map_err(Into::into)
            })?
            .unwrap_or(defaults.retries),
            retry_sleep: parse_opt(&get("TRANSFER_RETRY_SLEEP"), "TRANSFER_RETRY_SLEEP", parse_duration)?
                .unwrap_or(defaults.retry_sleep),
        };
        if transfer.chunk_size == 0 || transfer.max_concurrent == 0 || transfer.checkers == 0 {
            anyhow::bail!(
                "TRANSFER_CHUNK_SIZE, TRANSFER_MAX_CONCURRENT and TRANSFER_CHECKERS must be greater than zero"
            );
        }

        if settings.destination.as_deref().is_some_and(|d| d.starts_with("s3://")) {
            check_s3_part_size(transfer.chunk_size)?;
        }

        let retention_dry_run =
            parse_opt(&get("RETENTION_DRY_RUN"), "RETENTION_DRY_RUN", parse_bool)?.unwrap_or(false);
        let retention = parse_opt(&get("RETENTION_DAYS"), "RETENTION_DAYS", |v| {
            v.parse::<u32>().map_err(Into::into)
        })?
        .map(|max_age_days| RetentionPolicy {
            max_age_days,
            dry_run: retention_dry_run,
        });

        let pipeline_defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            buffer_size: parse_opt(&get("PIPELINE_BUFFER_SIZE"), "PIPELINE_BUFFER_SIZE", parse_size)?
                .map(|v| v as usize)
                .unwrap_or(pipeline_defaults.buffer_size),
            depth: parse_opt(&get("PIPELINE_DEPTH"), "PIPELINE_DEPTH", |v| {
                v.parse::<usize>().map_err(Into::into)
            })?
            .unwrap_or(pipeline_defaults.depth),
        };
        if pipeline.buffer_size == 0 || pipeline.depth == 0 {
            anyhow::bail!("PIPELINE_BUFFER_SIZE and PIPELINE_DEPTH must be greater than zero");
        }

        let s3 = S3Settings {
            endpoint_url: get("S3_ENDPOINT_URL"),
            region: get("S3_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            access_key_id: get("S3_ACCESS_KEY_ID"),
            secret_access_key: get("S3_SECRET_ACCESS_KEY"),
            force_path_style: parse_opt(&get("S3_FORCE_PATH_STYLE"), "S3_FORCE_PATH_STYLE", parse_bool)?
                .unwrap_or(false),
        };
        if s3.access_key_id.is_some() != s3.secret_access_key.is_some() {
            anyhow::bail!("S3_ACCESS_KEY_ID and S3_SECRET_ACCESS_KEY must be set together");
        }

        let lock_path = get("LOCK_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_LOCK_FILE));

        Ok(AppConfig {
            settings,
            transfer,
            retention,
            pipeline,
            s3,
            lock_path,
        })
    }

    /// Parses the destination on its own, for flows that never dump.
    pub fn destination(&self) -> std::result::Result<Destination, BackupError> {
        let raw = self
            .settings
            .destination
            .as_deref()
            .ok_or_else(|| BackupError::Config("BACKUP_DESTINATION must be set".to_string()))?;
        Destination::parse(raw).map_err(BackupError::from)
    }
}

impl BackupSettings {
    /// Checks that every field a run needs is present.
    pub fn validate(
        &self,
        transfer: &TransferPolicy,
        retention: Option<RetentionPolicy>,
    ) -> std::result::Result<BackupJobSpec, BackupError> {
        let mut missing = Vec::new();
        if self.engine.is_none() {
            missing.push("DB_TYPE");
        }
        if self.database.is_none() {
            missing.push("DB_NAME");
        }
        if self.destination.is_none() {
            missing.push("BACKUP_DESTINATION");
        }
        if self.engine.is_some_and(|e| e.is_networked()) && self.host.is_none() {
            missing.push("DB_HOST");
        }
        let (Some(engine), Some(database), Some(destination), true) = (
            self.engine,
            self.database.clone(),
            self.destination.as_deref(),
            missing.is_empty(),
        ) else {
            return Err(BackupError::Config(format!(
                "required settings missing: {}",
                missing.join(", ")
            )));
        };

        let destination = Destination::parse(destination)?;

        Ok(BackupJobSpec {
            engine,
            host: self.host.clone().unwrap_or_else(|| "localhost".to_string()),
            port: self.port.unwrap_or_else(|| engine.default_port()),
            database,
            credentials: self.credentials.clone(),
            destination,
            name_template: self.name_template.clone(),
            prefix: self.prefix.clone(),
            retention,
            transfer: Arc::new(transfer.clone()),
            dump_extra_args: self.dump_extra_args.clone(),
            preflight: self.preflight,
        })
    }
}

fn parse_opt<T>(
    raw: &Option<String>,
    key: &str,
    parse: impl Fn(&str) -> Result<T>,
) -> Result<Option<T>> {
    raw.as_deref()
        .map(|v| parse(v).with_context(|| format!("{} has an invalid value '{}'", key, v)))
        .transpose()
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow::anyhow!("expected a boolean, got '{}'", other)),
    }
}

/// Parses byte sizes such as `65536`, `64K`, `8M`, `5Mi` or `1G` (binary units).
pub fn parse_size(raw: &str) -> Result<u64> {
    let trimmed = raw.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let value: u64 = digits
        .parse()
        .with_context(|| format!("'{}' does not start with a number", trimmed))?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().trim_end_matches(['B', 'I']) {
        "" => 1,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        other => anyhow::bail!("unknown size unit '{}'", other),
    };
    value
        .checked_mul(multiplier)
        .with_context(|| format!("size '{}' overflows", trimmed))
}

/// Bare numbers are seconds, anything else goes through `humantime`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let trimmed = raw.trim();
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(trimmed).with_context(|| format!("'{}' is not a duration", trimmed))
}
