// db-stream-backup/src/storage/local.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;
use walkdir::{DirEntry, WalkDir};

use super::{ListPage, ObjectInfo, ObjectStore, StoreError, StoreResult, UploadedPart};

/// Directory names inside the root that hold staged uploads.
const STAGING_DIR: &str = ".staging";
const PAGE_SIZE: usize = 1000;

/// Object store on a local (or mounted) directory.
///
/// Writes land in `.staging/` and are renamed into place on completion, so a
/// crashed run leaves at most a staging file behind, never a truncated object.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    page_size: usize,
}

impl LocalStore {
    pub async fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(root.join(STAGING_DIR))
            .await
            .with_context(|| format!("Failed to create destination directory: {}", root.display()))?;
        Ok(Self {
            root,
            page_size: PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn object_path(&self, key: &str) -> StoreResult<PathBuf> {
        if key.is_empty() || key.split('/').any(|c| c.is_empty() || c == "." || c == ".." || c == STAGING_DIR) {
            return Err(StoreError::Permanent(format!("invalid object key '{}'", key)));
        }
        Ok(self.root.join(key))
    }

    fn staging_path(&self, name: &str) -> PathBuf {
        self.root.join(STAGING_DIR).join(name)
    }

    async fn promote(&self, staged: &Path, key: &str) -> StoreResult<()> {
        let target = self.object_path(key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(staged, &target).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn put_object(&self, key: &str, body: Bytes) -> StoreResult<()> {
        self.object_path(key)?;
        let staged = self.staging_path(&format!("{}.partial", Uuid::new_v4()));
        let mut file = fs::File::create(&staged).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);
        self.promote(&staged, key).await
    }

    async fn begin_upload(&self, key: &str) -> StoreResult<String> {
        self.object_path(key)?;
        let upload_id = Uuid::new_v4().to_string();
        fs::create_dir_all(self.staging_path(&upload_id)).await?;
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StoreResult<UploadedPart> {
        let part_path = self.staging_path(upload_id).join(format!("{:08}", part_number));
        let mut file = fs::File::create(&part_path).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        Ok(UploadedPart {
            part_number,
            etag: None,
        })
    }

    async fn complete_upload(&self, key: &str, upload_id: &str, parts: Vec<UploadedPart>) -> StoreResult<()> {
        let upload_dir = self.staging_path(upload_id);
        let assembled = self.staging_path(&format!("{}.partial", upload_id));
        let mut out = fs::File::create(&assembled).await?;
        for part in &parts {
            let mut input = fs::File::open(upload_dir.join(format!("{:08}", part.part_number))).await?;
            tokio::io::copy(&mut input, &mut out).await?;
        }
        out.sync_all().await?;
        drop(out);
        self.promote(&assembled, key).await?;
        fs::remove_dir_all(&upload_dir).await?;
        Ok(())
    }

    async fn abort_upload(&self, _key: &str, upload_id: &str) -> StoreResult<()> {
        let upload_dir = self.staging_path(upload_id);
        match fs::remove_dir_all(&upload_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_page(&self, prefix: &str, token: Option<String>) -> StoreResult<ListPage> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let page_size = self.page_size;
        tokio::task::spawn_blocking(move || list_sorted(&root, &prefix, token.as_deref(), page_size))
            .await
            .map_err(|e| StoreError::Permanent(format!("listing task failed: {}", e)))?
    }

    async fn delete_object(&self, key: &str) -> StoreResult<()> {
        fs::remove_file(self.object_path(key)?).await?;
        Ok(())
    }
}

/// Key of a walked entry relative to the store root, `/`-separated.
fn entry_key(root: &Path, entry: &DirEntry) -> String {
    entry
        .path()
        .strip_prefix(root)
        .unwrap_or(entry.path())
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Sibling order that makes a depth-first walk yield keys in byte order:
/// a directory sorts as its name followed by `/`.
fn key_order(a: &DirEntry, b: &DirEntry) -> Ordering {
    fn sort_name(entry: &DirEntry) -> String {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().is_dir() {
            name.push('/');
        }
        name
    }
    sort_name(a).cmp(&sort_name(b))
}

/// Whether a directory can hold keys under `prefix` that sort after `token`.
fn dir_may_match(dir_key: &str, prefix: &str, token: Option<&str>) -> bool {
    let dir = format!("{}/", dir_key);
    if !(dir.starts_with(prefix) || prefix.starts_with(&dir)) {
        return false;
    }
    match token {
        Some(t) => !(t > dir.as_str() && !t.starts_with(&dir)),
        None => true,
    }
}

/// One listing page, walking only the part of the tree after `token`.
fn list_sorted(root: &Path, prefix: &str, token: Option<&str>, page_size: usize) -> StoreResult<ListPage> {
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by(key_order)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            if entry.depth() == 1 && entry.file_name() == std::ffi::OsStr::new(STAGING_DIR) {
                return false;
            }
            dir_may_match(&entry_key(root, entry), prefix, token)
        });

    let mut objects = Vec::new();
    let mut truncated = false;
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let key = entry_key(root, &entry);
        if !key.starts_with(prefix) || token.is_some_and(|t| key.as_str() <= t) {
            continue;
        }
        if objects.len() == page_size {
            truncated = true;
            break;
        }
        let meta = entry.metadata().map_err(std::io::Error::from)?;
        let last_modified: DateTime<Utc> = meta.modified()?.into();
        objects.push(ObjectInfo {
            key,
            size: meta.len(),
            last_modified,
        });
    }

    let next_token = if truncated {
        objects.last().map(|o| o.key.clone())
    } else {
        None
    };
    Ok(ListPage { objects, next_token })
}
