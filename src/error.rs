use std::io;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{what} not found: {}", path.display())]
    NotFound { what: &'static str, path: PathBuf },

    #[error("Invalid backup source: {0}")]
    InvalidSource(String),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    IO(#[from] io::Error),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Retention sweep incomplete: {deleted} deleted, {} failed ({})", failed.len(), failed.join(", "))]
    PartialSweep { deleted: usize, failed: Vec<String> },
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Configuration parsing error: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Output directory {} is not writable: {source}", path.display())]
    OutputDir { path: PathBuf, source: io::Error },
}

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("Failed to create temporary archive in {}: {source}", dir.display())]
    TempFile { dir: PathBuf, source: io::Error },

    #[error("Failed to walk {}: {source}", path.display())]
    Walk { path: PathBuf, source: io::Error },

    #[error("Failed to write archive entry {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("Failed to finalize archive {}: {source}", path.display())]
    Finalize { path: PathBuf, source: io::Error },

    #[error("Archive worker failed: {0}")]
    Worker(String),
}

#[derive(thiserror::Error, Debug)]
pub enum TransferError {
    #[error("Storage client error: {0}")]
    Client(String),

    #[error("Container {container} unavailable: {message}")]
    Container { container: String, message: String },

    #[error("Listing {container} failed: {message}")]
    List { container: String, message: String },

    #[error("Upload of {key} failed: {message}")]
    Upload { key: String, message: String },

    #[error("Delete of {key} failed: {message}")]
    Delete { key: String, message: String },

    #[error("Failed to read {} for upload: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
}

impl Error {
    pub fn not_found(what: &'static str, path: impl Into<PathBuf>) -> Self {
        Error::NotFound {
            what,
            path: path.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
