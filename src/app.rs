use crate::archive::Archiver;
use crate::config::Settings;
use crate::error::ArchiveError;
use crate::logging;
use crate::prelude::*;
use crate::retention::{RetentionPolicy, RetentionSweeper, SweepReport};
use crate::storage::{ObjectStore, S3Store};
use crate::upload::{UploadReceipt, Uploader};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Backup,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backup => write!(f, "backup"),
            Self::Cleanup => write!(f, "cleanup"),
        }
    }
}

impl fmt::Display for UploadReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "uploaded {} to {} ({} bytes)",
            self.key, self.container, self.bytes
        )?;
        if !self.local_removed {
            write!(f, ", local copy left at {:?}", self.local_path)?;
        }
        Ok(())
    }
}

/// Everything one invocation needs: the settings read at start and the
/// store they point at.
pub struct App {
    settings: Settings,
    store: Arc<dyn ObjectStore>,
}

impl App {
    pub async fn new(settings: Settings) -> Result<Self> {
        let store = S3Store::new(&settings.storage()).await?;
        Ok(Self::with_store(settings, Arc::new(store)))
    }

    pub fn with_store(settings: Settings, store: Arc<dyn ObjectStore>) -> Self {
        Self { settings, store }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Archives `source` (or the configured source directory) and uploads it.
    pub async fn backup(
        &self,
        source: Option<&Path>,
        output_dir: Option<&Path>,
    ) -> Result<UploadReceipt> {
        let source = source
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.settings.source_dir.clone());
        let output_dir = self.settings.prepare_output_dir(output_dir)?;
        info!("Using output directory: {:?}", output_dir);

        let archiver = Archiver::new(output_dir, self.settings.compression_level);
        let artifact = tokio::task::spawn_blocking(move || archiver.create(&source))
            .await
            .map_err(|e| ArchiveError::Worker(e.to_string()))??;

        Uploader::new(self.store.as_ref())
            .ensure_container(self.settings.create_container)
            .upload(&artifact)
            .await
    }

    /// Deletes objects older than `days` (or the configured retention).
    pub async fn cleanup(&self, days: Option<u32>) -> Result<SweepReport> {
        let policy = RetentionPolicy::new(days.unwrap_or(self.settings.retention_days));
        RetentionSweeper::new(self.store.as_ref(), policy, self.settings.delete_concurrency)
            .sweep()
            .await?
            .into_result()
    }

    /// Runs the backup stage, then the cleanup stage, with the configured
    /// defaults. Returns `true` only if every stage that ran succeeded.
    pub async fn run(&self, skip_backup: bool, skip_cleanup: bool) -> bool {
        // A failed backup must not keep old backups from being pruned.
        let backup_ok = skip_backup || report(Stage::Backup, &self.backup(None, None).await);
        let cleanup_ok = skip_cleanup || report(Stage::Cleanup, &self.cleanup(None).await);

        if backup_ok && cleanup_ok {
            info!("All stages completed successfully");
        }
        backup_ok && cleanup_ok
    }
}

/// Loads settings, installs logging and connects to storage. Failures are
/// logged here; `None` means the process should exit non-zero.
pub async fn bootstrap(entry_point: &str) -> Option<App> {
    let settings = Settings::load();
    let log_dir = settings.as_ref().ok().and_then(|s| s.log_dir.clone());
    logging::init(entry_point, log_dir.as_deref());

    let settings = match settings {
        Ok(settings) => {
            info!("Configuration loaded (run mode: {})", Settings::run_mode());
            settings
        }
        Err(e) => {
            error!("{}: {}", entry_point, e);
            return None;
        }
    };

    match App::new(settings).await {
        Ok(app) => Some(app),
        Err(e) => {
            error!("{}: failed to set up storage client: {}", entry_point, e);
            None
        }
    }
}

/// Logs the outcome of a stage and returns whether it succeeded.
pub fn report<T: fmt::Display>(stage: Stage, result: &Result<T>) -> bool {
    match result {
        Ok(outcome) => {
            info!("{} stage completed successfully: {}", stage, outcome);
            true
        }
        Err(e) => {
            error!("{} stage failed: {}", stage, e);
            false
        }
    }
}
