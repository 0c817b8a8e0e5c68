// Connection preflight and dump failure classification
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use std::time::Duration;

use crate::config::{BackupJobSpec, Engine};
use crate::errors::BackupError;

const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(15);

const AUTH_MARKERS: &[&str] = &[
    "password authentication failed",
    "authentication failed",
    "no password supplied",
    "access denied for user",
    "role \"",
];

const CONNECTION_MARKERS: &[&str] = &[
    "could not connect",
    "connection refused",
    "could not translate host name",
    "can't connect to",
    "unknown mysql server host",
    "name or service not known",
    "no route to host",
    "timed out",
    "timeout expired",
    "server closed the connection",
    "lost connection",
    "network is unreachable",
];

/// Maps a failed dump's stderr to the error taxonomy.
pub fn classify_failure(tool: &str, detail: &str) -> BackupError {
    let lower = detail.to_lowercase();
    let message = if detail.is_empty() {
        format!("{} failed without output", tool)
    } else {
        format!("{}: {}", tool, detail)
    };
    if AUTH_MARKERS.iter().any(|m| lower.contains(m)) {
        BackupError::Auth(message)
    } else if CONNECTION_MARKERS.iter().any(|m| lower.contains(m)) {
        BackupError::Connection(message)
    } else {
        BackupError::EngineInvocation(message)
    }
}

fn classify_sqlx(engine: Engine, err: sqlx::Error) -> BackupError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            // 28xxx is the SQLSTATE class for invalid authorization on both engines.
            if code.starts_with("28") {
                BackupError::Auth(format!("{} rejected the credentials: {}", engine, db.message()))
            } else {
                classify_failure(engine.as_str(), db.message())
            }
        }
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolTimedOut => {
            BackupError::Connection(format!("could not reach {}: {}", engine, err))
        }
        _ => classify_failure(engine.as_str(), &err.to_string()),
    }
}

async fn connect(spec: &BackupJobSpec) -> Result<(), sqlx::Error> {
    let user = spec.credentials.user.as_deref();
    let password = spec.credentials.password.as_deref();
    match spec.engine {
        Engine::Postgres => {
            let mut options = PgConnectOptions::new()
                .host(&spec.host)
                .port(spec.port)
                .database(&spec.database);
            if let Some(user) = user {
                options = options.username(user);
            }
            if let Some(password) = password {
                options = options.password(password);
            }
            PgConnection::connect_with(&options).await?.close().await
        }
        Engine::MySql => {
            let mut options = MySqlConnectOptions::new()
                .host(&spec.host)
                .port(spec.port)
                .database(&spec.database);
            if let Some(user) = user {
                options = options.username(user);
            }
            if let Some(password) = password {
                options = options.password(password);
            }
            MySqlConnection::connect_with(&options).await?.close().await
        }
        Engine::Sqlite => Ok(()),
    }
}

/// Connects once to the database so connection and credential problems
/// surface before a dump process is started.
pub async fn check_db_connection(spec: &BackupJobSpec) -> Result<(), BackupError> {
    match tokio::time::timeout(PREFLIGHT_TIMEOUT, connect(spec)).await {
        Ok(Ok(())) => {
            tracing::debug!(engine = %spec.engine, host = %spec.host, port = spec.port, "preflight connection succeeded");
            Ok(())
        }
        Ok(Err(e)) => Err(classify_sqlx(spec.engine, e)),
        Err(_) => Err(BackupError::Connection(format!(
            "connecting to {}:{} timed out after {}",
            spec.host,
            spec.port,
            humantime::format_duration(PREFLIGHT_TIMEOUT)
        ))),
    }
}
