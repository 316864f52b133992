use chrono::Local;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const CONTAINER_LOG_DIR: &str = "/var/log/blob-backup";
pub const STANDALONE_LOG_DIR: &str = "./logs";

// The SDK logs every request at info; keep it to warnings unless RUST_LOG says otherwise.
const DEFAULT_FILTER: &str =
    "info,aws_config=warn,aws_smithy_runtime=warn,aws_sdk_s3=warn,hyper=warn";

/// Installs the global subscriber: console always, plus a daily file under
/// the resolved log directory when one is available.
///
/// Returns the log file path when file logging is active.
pub fn init(entry_point: &str, log_dir: Option<&str>) -> Option<PathBuf> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (file, problem) = match resolve_log_dir(log_dir, Path::new("/.dockerenv").exists()) {
        Some(dir) => match open_log_file(&dir, entry_point) {
            Ok(opened) => (Some(opened), None),
            Err(e) => (
                None,
                Some(format!(
                    "Cannot write to log directory {:?}: {}. Using console only.",
                    dir, e
                )),
            ),
        },
        None => (None, None),
    };

    let path = file.as_ref().map(|(path, _)| path.clone());
    let file_layer = file.map(|(_, handle)| {
        fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(handle))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()
        .ok();

    if let Some(problem) = problem {
        warn!("{}", problem);
    }
    if let Some(path) = &path {
        info!("Logging to file: {:?}", path);
    }
    path
}

/// An explicitly empty directory disables file logging; no setting at all
/// falls back to a location that depends on whether we run in a container.
pub fn resolve_log_dir(configured: Option<&str>, in_container: bool) -> Option<PathBuf> {
    match configured {
        Some("") => None,
        Some(dir) => Some(PathBuf::from(dir)),
        None if in_container => Some(PathBuf::from(CONTAINER_LOG_DIR)),
        None => Some(PathBuf::from(STANDALONE_LOG_DIR)),
    }
}

pub fn log_file_name(entry_point: &str, date: chrono::NaiveDate) -> String {
    format!("{}_{}.log", entry_point, date.format("%Y-%m-%d"))
}

fn open_log_file(dir: &Path, entry_point: &str) -> std::io::Result<(PathBuf, File)> {
    fs::create_dir_all(dir)?;
    let path = dir.join(log_file_name(entry_point, Local::now().date_naive()));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((path, file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_empty_log_dir_disables_file_logging() {
        assert_eq!(resolve_log_dir(Some(""), true), None);
        assert_eq!(resolve_log_dir(Some(""), false), None);
    }

    #[test]
    fn test_explicit_log_dir_wins() {
        assert_eq!(
            resolve_log_dir(Some("/tmp/backup-logs"), true),
            Some(PathBuf::from("/tmp/backup-logs"))
        );
    }

    #[test]
    fn test_default_log_dir_depends_on_container() {
        assert_eq!(
            resolve_log_dir(None, true),
            Some(PathBuf::from(CONTAINER_LOG_DIR))
        );
        assert_eq!(
            resolve_log_dir(None, false),
            Some(PathBuf::from(STANDALONE_LOG_DIR))
        );
    }

    #[test]
    fn test_log_file_is_named_per_entry_point_and_day() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(log_file_name("cleanup", date), "cleanup_2024-03-09.log");
    }

    #[test]
    fn test_open_log_file_creates_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("logs");

        let (path, _file) = open_log_file(&dir, "backup").unwrap();

        assert!(path.starts_with(&dir));
        assert!(path.exists());
    }
}
