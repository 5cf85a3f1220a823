//! In-memory object store.
//!
//! Buckets are ordered maps so listings page deterministically; the
//! continuation token is the last key of the previous page. Buckets marked
//! cold hold new objects as `Archived` until a restore completes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::ports::{
    ObjectInfo, ObjectMetadata, ObjectPage, ObjectStore, RestoreState, RetrievalTier, StorageError,
};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    etag: String,
    last_modified: DateTime<Utc>,
    restore: RestoreState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    pub bucket: String,
    pub key: String,
    pub tier: RetrievalTier,
    pub days: u32,
}

#[derive(Debug, Default)]
struct StoreState {
    buckets: HashMap<String, BTreeMap<String, StoredObject>>,
    cold_buckets: HashSet<String>,
    failing_keys: HashSet<String>,
    failing_lists: usize,
    restore_requests: Vec<RestoreRequest>,
    puts: usize,
    deletes: usize,
}

#[derive(Debug, Default)]
struct HeadGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct InMemoryObjectStore {
    state: Arc<Mutex<StoreState>>,
    head_delay: Option<Duration>,
    heads: Arc<HeadGauge>,
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `head` sleeps for `delay`, which lets tests observe how many
    /// run at once.
    pub fn with_head_delay(mut self, delay: Duration) -> Self {
        self.head_delay = Some(delay);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StorageError> {
        self.state
            .lock()
            .map_err(|_| StorageError::Io("object store state poisoned".to_string()))
    }

    pub fn mark_cold(&self, bucket: &str) {
        if let Ok(mut state) = self.lock() {
            state.cold_buckets.insert(bucket.to_string());
        }
    }

    /// Stores an object with an explicit modification time; returns its etag.
    pub fn insert(&self, bucket: &str, key: &str, data: &[u8], last_modified: DateTime<Utc>) -> String {
        let etag = md5_hex(data);
        if let Ok(mut state) = self.lock() {
            let restore = if state.cold_buckets.contains(bucket) {
                RestoreState::Archived
            } else {
                RestoreState::Available
            };
            state.buckets.entry(bucket.to_string()).or_default().insert(
                key.to_string(),
                StoredObject {
                    data: data.to_vec(),
                    etag: etag.clone(),
                    last_modified,
                    restore,
                },
            );
        }
        etag
    }

    /// Overrides the etag, e.g. to mimic a multipart upload.
    pub fn set_etag(&self, bucket: &str, key: &str, etag: &str) {
        if let Ok(mut state) = self.lock() {
            if let Some(obj) = state.buckets.get_mut(bucket).and_then(|b| b.get_mut(key)) {
                obj.etag = etag.to_string();
            }
        }
    }

    /// `get`, `head` and `put` of `key` fail with an i/o error until cleared.
    pub fn fail_key(&self, key: &str) {
        if let Ok(mut state) = self.lock() {
            state.failing_keys.insert(key.to_string());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.lock() {
            state.failing_keys.clear();
            state.failing_lists = 0;
        }
    }

    pub fn fail_next_lists(&self, n: usize) {
        if let Ok(mut state) = self.lock() {
            state.failing_lists = n;
        }
    }

    /// Finishes every running restore in `bucket`.
    pub fn complete_restores(&self, bucket: &str) {
        if let Ok(mut state) = self.lock() {
            if let Some(objects) = state.buckets.get_mut(bucket) {
                for obj in objects.values_mut() {
                    if obj.restore == RestoreState::InProgress {
                        obj.restore = RestoreState::Available;
                    }
                }
            }
        }
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.lock()
            .map(|s| s.buckets.get(bucket).is_some_and(|b| b.contains_key(key)))
            .unwrap_or(false)
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.lock()
            .ok()
            .and_then(|s| s.buckets.get(bucket)?.get(key).map(|o| o.data.clone()))
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .map(|s| {
                s.buckets
                    .get(bucket)
                    .map(|b| b.keys().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn restore_requests(&self) -> Vec<RestoreRequest> {
        self.lock()
            .map(|s| s.restore_requests.clone())
            .unwrap_or_default()
    }

    pub fn put_count(&self) -> usize {
        self.lock().map(|s| s.puts).unwrap_or(0)
    }

    pub fn delete_count(&self) -> usize {
        self.lock().map(|s| s.deletes).unwrap_or(0)
    }

    pub fn head_calls(&self) -> usize {
        self.heads.calls.load(Ordering::SeqCst)
    }

    /// Most `head` calls observed running at the same time.
    pub fn peak_concurrent_heads(&self) -> usize {
        self.heads.peak.load(Ordering::SeqCst)
    }

    fn find(&self, bucket: &str, key: &str) -> Result<StoredObject, StorageError> {
        let state = self.lock()?;
        if state.failing_keys.contains(key) {
            return Err(StorageError::Io(format!("injected failure for {key}")));
        }
        state
            .buckets
            .get(bucket)
            .and_then(|b| b.get(key))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        page_size: usize,
        token: Option<&str>,
    ) -> Result<ObjectPage, StorageError> {
        let mut state = self.lock()?;
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(StorageError::Io("injected list failure".to_string()));
        }
        let Some(objects) = state.buckets.get(bucket) else {
            return Ok(ObjectPage {
                objects: Vec::new(),
                next_token: None,
            });
        };

        let mut matching = objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| token.is_none_or(|t| key.as_str() > t));
        let page: Vec<ObjectInfo> = matching
            .by_ref()
            .take(page_size.max(1))
            .map(|(key, obj)| ObjectInfo {
                key: key.clone(),
                etag: obj.etag.clone(),
                size: obj.data.len() as u64,
                last_modified: obj.last_modified,
            })
            .collect();
        let next_token = match matching.next() {
            Some(_) => page.last().map(|o| o.key.clone()),
            None => None,
        };
        Ok(ObjectPage {
            objects: page,
            next_token,
        })
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<ObjectMetadata, StorageError> {
        self.heads.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.heads.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.heads.peak.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.head_delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.find(bucket, key).map(|obj| ObjectMetadata {
            info: ObjectInfo {
                key: key.to_string(),
                etag: obj.etag,
                size: obj.data.len() as u64,
                last_modified: obj.last_modified,
            },
            restore: obj.restore,
        });
        self.heads.current.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        let obj = self.find(bucket, key)?;
        if obj.restore != RestoreState::Available {
            return Err(StorageError::Conflict {
                bucket: bucket.to_string(),
                key: key.to_string(),
                reason: "object is archived".to_string(),
            });
        }
        Ok(obj.data)
    }

    async fn put(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<String, StorageError> {
        if self.lock()?.failing_keys.contains(key) {
            return Err(StorageError::Io(format!("injected failure for {key}")));
        }
        let etag = self.insert(bucket, key, &data, Utc::now());
        self.lock()?.puts += 1;
        Ok(etag)
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        let removed = state.buckets.get_mut(bucket).and_then(|b| b.remove(key));
        if removed.is_none() {
            return Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        state.deletes += 1;
        Ok(())
    }

    async fn request_restore(
        &self,
        bucket: &str,
        key: &str,
        tier: RetrievalTier,
        days: u32,
    ) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        let obj = state
            .buckets
            .get_mut(bucket)
            .and_then(|b| b.get_mut(key))
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;
        match obj.restore {
            RestoreState::InProgress => {
                return Err(StorageError::Conflict {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    reason: "restore already in progress".to_string(),
                });
            }
            RestoreState::Archived => obj.restore = RestoreState::InProgress,
            RestoreState::Available => {}
        }
        state.restore_requests.push(RestoreRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
            tier,
            days,
        });
        Ok(())
    }
}
