//! Remote object storage behind a small trait.
//!
//! Stores must never expose a partially written object: `put_object` is
//! all-or-nothing, and multipart uploads stay invisible until
//! `complete_upload` succeeds.

pub(crate) mod local;
pub(crate) mod memory;
pub(crate) mod s3;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

use crate::config::S3Settings;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use s3::S3Store;

/// How a failed storage request should be treated by the retry loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("storage rate limit: {0}")]
    RateLimited(String),

    #[error("storage error: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::Permanent(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            Interrupted | TimedOut | WouldBlock => StoreError::Transient(err.to_string()),
            _ => StoreError::Permanent(err.to_string()),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectInfo>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub etag: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    async fn put_object(&self, key: &str, body: Bytes) -> StoreResult<()>;

    /// Opens a staged multipart upload and returns its id.
    async fn begin_upload(&self, key: &str) -> StoreResult<String>;

    /// Part numbers start at 1.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StoreResult<UploadedPart>;

    /// Promotes the staged upload to a visible object. `parts` is ordered by part number.
    async fn complete_upload(&self, key: &str, upload_id: &str, parts: Vec<UploadedPart>) -> StoreResult<()>;

    async fn abort_upload(&self, key: &str, upload_id: &str) -> StoreResult<()>;

    async fn list_page(&self, prefix: &str, token: Option<String>) -> StoreResult<ListPage>;

    async fn delete_object(&self, key: &str) -> StoreResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    S3 { bucket: String },
    Local { root: PathBuf },
    Memory { name: String },
}

/// Parsed `BACKUP_DESTINATION`: where objects go and the key prefix under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    kind: StoreKind,
    prefix: String,
}

impl Destination {
    /// Accepts `s3://bucket/prefix`, `file:///dir` and `mem://name/prefix`.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).with_context(|| format!("Invalid destination format: {}", raw))?;
        let path_prefix = url.path().trim_matches('/').to_string();
        match url.scheme() {
            "s3" => {
                let bucket = url
                    .host_str()
                    .filter(|b| !b.is_empty())
                    .context("S3 destination missing bucket name")?
                    .to_string();
                Ok(Destination {
                    kind: StoreKind::S3 { bucket },
                    prefix: path_prefix,
                })
            }
            "mem" => {
                let name = url
                    .host_str()
                    .filter(|b| !b.is_empty())
                    .context("memory destination missing a name")?
                    .to_string();
                Ok(Destination {
                    kind: StoreKind::Memory { name },
                    prefix: path_prefix,
                })
            }
            "file" => {
                let root = url
                    .to_file_path()
                    .map_err(|_| anyhow::anyhow!("file destination must be an absolute path: {}", raw))?;
                Ok(Destination {
                    kind: StoreKind::Local { root },
                    prefix: String::new(),
                })
            }
            other => Err(anyhow::anyhow!(
                "unsupported destination scheme '{}', expected s3://, file:// or mem://",
                other
            )),
        }
    }

    pub fn kind(&self) -> &StoreKind {
        &self.kind
    }

    /// Key for an object name under this destination.
    pub fn object_key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    /// Listing prefix that covers every object this destination owns.
    pub fn list_prefix(&self) -> String {
        if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        }
    }
}

/// Opens the store a destination points at.
pub async fn connect(destination: &Destination, s3_settings: &S3Settings) -> Result<Arc<dyn ObjectStore>> {
    match destination.kind() {
        StoreKind::S3 { bucket } => Ok(Arc::new(S3Store::connect(s3_settings, bucket).await?)),
        StoreKind::Local { root } => Ok(Arc::new(LocalStore::open(root.clone()).await?)),
        StoreKind::Memory { name } => {
            tracing::warn!(store = %name, "in-memory destination, objects are discarded when the process exits");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3_destination() -> anyhow::Result<()> {
        let dest = Destination::parse("s3://my-bucket/backups/prod/")?;
        assert_eq!(
            dest.kind(),
            &StoreKind::S3 {
                bucket: "my-bucket".to_string()
            }
        );
        assert_eq!(dest.prefix, "backups/prod");
        assert_eq!(dest.object_key("a.sql.gz"), "backups/prod/a.sql.gz");
        assert_eq!(dest.list_prefix(), "backups/prod/");
        Ok(())
    }

    #[test]
    fn test_parse_memory_and_file_destinations() -> anyhow::Result<()> {
        let mem = Destination::parse("mem://backups")?;
        assert_eq!(mem.prefix, "");
        assert_eq!(mem.object_key("x.db.gz"), "x.db.gz");
        assert_eq!(mem.list_prefix(), "");

        let file = Destination::parse("file:///var/backups")?;
        assert_eq!(
            file.kind(),
            &StoreKind::Local {
                root: PathBuf::from("/var/backups")
            }
        );
        Ok(())
    }

    #[test]
    fn test_parse_rejects_bad_destinations() {
        assert!(Destination::parse("backups").is_err());
        assert!(Destination::parse("ftp://host/dir").is_err());
        assert!(Destination::parse("s3:///no-bucket").is_err());
    }
}
