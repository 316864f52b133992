mod memory_storage;
mod s3_storage;

pub use memory_storage::MemoryStore;
pub use s3_storage::S3Store;

use crate::prelude::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use std::path::Path;

/// One entry of a container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    /// Server-assigned; `None` when the listing does not carry it.
    pub last_modified: Option<DateTime<Utc>>,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub objects: Vec<RemoteObject>,
    /// Token for the next page; `None` on the last one.
    pub next: Option<String>,
}

/// The operations backups need from a remote container.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn container(&self) -> &str;

    /// Creates the container when it does not exist yet.
    async fn ensure_container(&self) -> Result<()>;

    /// Fetches one page of the listing, starting after `continuation`.
    async fn list_page(&self, continuation: Option<String>) -> Result<ObjectPage>;

    /// Stores the file at `path` under `key`, replacing any existing object.
    /// Either the whole file becomes visible or nothing does.
    async fn upload(&self, key: &str, path: &Path) -> Result<u64>;

    async fn delete(&self, key: &str) -> Result<()>;
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Lazily walks every page of the container listing until it is exhausted.
pub fn list_objects<'a, S>(store: &'a S) -> impl Stream<Item = Result<Vec<RemoteObject>>> + 'a
where
    S: ObjectStore + ?Sized,
{
    stream::try_unfold(Cursor::Start, move |cursor| async move {
        let continuation = match cursor {
            Cursor::Start => None,
            Cursor::Next(token) => Some(token),
            Cursor::Done => return Ok(None),
        };

        let page = store.list_page(continuation).await?;
        let cursor = match page.next {
            Some(token) => Cursor::Next(token),
            None => Cursor::Done,
        };
        Ok::<_, Error>(Some((page.objects, cursor)))
    })
}
