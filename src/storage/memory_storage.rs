use crate::error::TransferError;
use crate::prelude::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::{ObjectPage, ObjectStore, RemoteObject};

const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    last_modified: Option<DateTime<Utc>>,
}

/// A container held in process memory, with switches to simulate transport
/// failures. Listing pages are keyed by the last key returned, the way S3's
/// continuation works.
pub struct MemoryStore {
    container: String,
    page_size: usize,
    objects: Mutex<BTreeMap<String, StoredObject>>,
    failing_deletes: Mutex<HashSet<String>>,
    fail_uploads: AtomicBool,
    list_failure_after: Mutex<Option<usize>>,
    list_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            page_size: DEFAULT_PAGE_SIZE,
            objects: Mutex::new(BTreeMap::new()),
            failing_deletes: Mutex::new(HashSet::new()),
            fail_uploads: AtomicBool::new(false),
            list_failure_after: Mutex::new(None),
            list_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn insert(&self, key: &str, data: Vec<u8>, last_modified: DateTime<Utc>) {
        self.store(key, data, Some(last_modified));
    }

    /// Stores an object whose listing entry carries no timestamp.
    pub fn insert_undated(&self, key: &str, data: Vec<u8>) {
        self.store(key, data, None);
    }

    fn store(&self, key: &str, data: Vec<u8>, last_modified: Option<DateTime<Utc>>) {
        self.objects().insert(
            key.to_string(),
            StoredObject {
                data,
                last_modified,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects().get(key).map(|object| object.data.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects().keys().cloned().collect()
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete_of(&self, key: &str) {
        lock(&self.failing_deletes).insert(key.to_string());
    }

    /// Lets `pages` listing calls succeed, then fails every later one.
    pub fn fail_listing_after(&self, pages: usize) {
        *lock(&self.list_failure_after) = Some(pages);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, StoredObject>> {
        lock(&self.objects)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn container(&self) -> &str {
        &self.container
    }

    async fn ensure_container(&self) -> Result<()> {
        Ok(())
    }

    async fn list_page(&self, continuation: Option<String>) -> Result<ObjectPage> {
        let call = self.list_calls.fetch_add(1, Ordering::SeqCst);
        let allowed = *lock(&self.list_failure_after);
        if allowed.is_some_and(|allowed| call >= allowed) {
            return Err(TransferError::List {
                container: self.container.clone(),
                message: "simulated listing failure".into(),
            }
            .into());
        }

        let objects = self.objects();
        let lower = match &continuation {
            Some(token) => Bound::Excluded(token.clone()),
            None => Bound::Unbounded,
        };
        let mut remaining = objects.range((lower, Bound::Unbounded));

        let page: Vec<RemoteObject> = remaining
            .by_ref()
            .take(self.page_size)
            .map(|(key, object)| RemoteObject {
                key: key.clone(),
                last_modified: object.last_modified,
                size: object.data.len() as u64,
            })
            .collect();
        let next = match remaining.next() {
            Some(_) => page.last().map(|object| object.key.clone()),
            None => None,
        };

        debug!(
            "Listed {} objects from {} (more: {})",
            page.len(),
            self.container,
            next.is_some()
        );
        Ok(ObjectPage {
            objects: page,
            next,
        })
    }

    async fn upload(&self, key: &str, path: &Path) -> Result<u64> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("Backup archive", path))
            }
            Err(e) => {
                return Err(TransferError::Read {
                    path: path.to_path_buf(),
                    source: e,
                }
                .into())
            }
        };

        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(TransferError::Upload {
                key: key.to_string(),
                message: "simulated transport failure".into(),
            }
            .into());
        }

        let size = data.len() as u64;
        self.insert(key, data, Utc::now());
        Ok(size)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if lock(&self.failing_deletes).contains(key) {
            return Err(TransferError::Delete {
                key: key.to_string(),
                message: "simulated delete failure".into(),
            }
            .into());
        }

        self.objects().remove(key);
        Ok(())
    }
}
