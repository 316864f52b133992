use crate::archive::BackupArtifact;
use crate::prelude::*;
use crate::storage::ObjectStore;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub container: String,
    pub key: String,
    pub bytes: u64,
    /// `false` when the upload succeeded but the local archive could not be removed.
    pub local_removed: bool,
    pub local_path: PathBuf,
}

pub struct Uploader<'a> {
    store: &'a dyn ObjectStore,
    ensure_container: bool,
}

impl<'a> Uploader<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self {
            store,
            ensure_container: true,
        }
    }

    pub fn ensure_container(mut self, ensure: bool) -> Self {
        self.ensure_container = ensure;
        self
    }

    /// Uploads the archive under its own name, then removes the local copy.
    ///
    /// The local file is only touched after the store confirmed the upload;
    /// any failure before that leaves it in place for a later attempt.
    pub async fn upload(&self, artifact: &BackupArtifact) -> Result<UploadReceipt> {
        match tokio::fs::metadata(&artifact.path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("Backup archive", &artifact.path))
            }
            Err(e) => return Err(Error::IO(e)),
        }

        if self.ensure_container {
            info!(
                "Checking if container {} exists",
                self.store.container()
            );
            self.store.ensure_container().await?;
        }

        info!(
            "Uploading {} to container {}",
            artifact.name,
            self.store.container()
        );
        let bytes = self.store.upload(&artifact.name, &artifact.path).await?;

        let local_removed = match tokio::fs::remove_file(&artifact.path).await {
            Ok(()) => {
                info!("Local backup file removed: {:?}", artifact.path);
                true
            }
            Err(e) => {
                warn!(
                    "Uploaded {} but could not remove local file {:?}: {}",
                    artifact.name, artifact.path, e
                );
                false
            }
        };

        Ok(UploadReceipt {
            container: self.store.container().to_string(),
            key: artifact.name.clone(),
            bytes,
            local_removed,
            local_path: artifact.path.clone(),
        })
    }
}
