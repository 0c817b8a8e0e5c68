// db-stream-backup/src/storage/memory.rs
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::{ListPage, ObjectInfo, ObjectStore, StoreError, StoreResult, UploadedPart};

const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StagedUpload {
    key: String,
    parts: BTreeMap<i32, Bytes>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    uploads: HashMap<String, StagedUpload>,
}

/// Process-local object store for `mem://` destinations and tests.
///
/// Clones share the same contents.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    page_size: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Permanent("memory store mutex poisoned".to_string()))
    }

    /// Seeds an object with an explicit modification time.
    pub fn insert(&self, key: &str, data: impl Into<Bytes>, last_modified: DateTime<Utc>) {
        if let Ok(mut state) = self.lock() {
            state.objects.insert(
                key.to_string(),
                StoredObject {
                    data: data.into(),
                    last_modified,
                },
            );
        }
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.lock().ok()?.objects.get(key).map(|o| o.data.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock()
            .map(|state| state.objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of multipart uploads that were started but neither completed nor aborted.
    pub fn staged_uploads(&self) -> usize {
        self.lock().map(|state| state.uploads.len()).unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put_object(&self, key: &str, body: Bytes) -> StoreResult<()> {
        self.insert(key, body, Utc::now());
        Ok(())
    }

    async fn begin_upload(&self, key: &str) -> StoreResult<String> {
        let upload_id = Uuid::new_v4().to_string();
        self.lock()?.uploads.insert(
            upload_id.clone(),
            StagedUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> StoreResult<UploadedPart> {
        let mut state = self.lock()?;
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| StoreError::Permanent(format!("no such upload {} for {}", upload_id, key)))?;
        upload.parts.insert(part_number, body);
        Ok(UploadedPart {
            part_number,
            etag: Some(format!("{}-{}", upload_id, part_number)),
        })
    }

    async fn complete_upload(&self, key: &str, upload_id: &str, parts: Vec<UploadedPart>) -> StoreResult<()> {
        let mut state = self.lock()?;
        let upload = state
            .uploads
            .remove(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| StoreError::Permanent(format!("no such upload {} for {}", upload_id, key)))?;

        let mut data = BytesMut::new();
        for part in &parts {
            let body = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| StoreError::Permanent(format!("part {} was never uploaded", part.part_number)))?;
            data.extend_from_slice(body);
        }
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data: data.freeze(),
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn abort_upload(&self, _key: &str, upload_id: &str) -> StoreResult<()> {
        self.lock()?.uploads.remove(upload_id);
        Ok(())
    }

    async fn list_page(&self, prefix: &str, token: Option<String>) -> StoreResult<ListPage> {
        let state = self.lock()?;
        let mut objects: Vec<ObjectInfo> = state
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| token.as_deref().is_none_or(|t| key.as_str() > t))
            .take(self.page_size + 1)
            .map(|(key, obj)| ObjectInfo {
                key: key.clone(),
                size: obj.data.len() as u64,
                last_modified: obj.last_modified,
            })
            .collect();

        let next_token = if objects.len() > self.page_size {
            objects.truncate(self.page_size);
            objects.last().map(|o| o.key.clone())
        } else {
            None
        };
        Ok(ListPage { objects, next_token })
    }

    async fn delete_object(&self, key: &str) -> StoreResult<()> {
        self.lock()?.objects.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_multipart_is_invisible_until_complete() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let id = store.begin_upload("db/a.gz").await?;
        let p2 = store.upload_part("db/a.gz", &id, 2, Bytes::from_static(b"world")).await?;
        let p1 = store.upload_part("db/a.gz", &id, 1, Bytes::from_static(b"hello ")).await?;
        assert!(store.get("db/a.gz").is_none());
        assert_eq!(store.staged_uploads(), 1);

        store.complete_upload("db/a.gz", &id, vec![p1, p2]).await?;
        assert_eq!(store.get("db/a.gz"), Some(Bytes::from_static(b"hello world")));
        assert_eq!(store.staged_uploads(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_abort_discards_parts() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let id = store.begin_upload("x").await?;
        store.upload_part("x", &id, 1, Bytes::from_static(b"partial")).await?;
        store.abort_upload("x", &id).await?;
        assert!(store.get("x").is_none());
        assert_eq!(store.staged_uploads(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_listing_pages_through_prefix() -> anyhow::Result<()> {
        let store = MemoryStore::new().with_page_size(2);
        for i in 0..5 {
            store.put_object(&format!("p/{i}"), Bytes::from_static(b"x")).await?;
        }
        store.put_object("other/0", Bytes::from_static(b"x")).await?;

        let mut seen = Vec::new();
        let mut token = None;
        loop {
            let page = store.list_page("p/", token).await?;
            assert!(page.objects.len() <= 2);
            seen.extend(page.objects.into_iter().map(|o| o.key));
            token = page.next_token;
            if token.is_none() {
                break;
            }
        }
        assert_eq!(seen, vec!["p/0", "p/1", "p/2", "p/3", "p/4"]);
        Ok(())
    }
}
