use crate::error::ConfigError;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat, Map};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "BACKUP";
pub const DEFAULT_CONTAINER: &str = "backups";
pub const DEFAULT_SOURCE_DIR: &str = "/data";
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 9;
pub const DEFAULT_DELETE_CONCURRENCY: usize = 8;
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 100 * 1024 * 1024;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Smallest part S3 accepts in a multipart upload (except the last one).
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Process-wide settings, read once at start and handed to each component.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
    pub container: String,
    pub create_container: bool,
    pub source_dir: PathBuf,
    pub output_dir: Option<PathBuf>,
    pub retention_days: u32,
    pub compression_level: u32,
    pub delete_concurrency: usize,
    pub multipart_threshold: u64,
    pub max_attempts: u32,
    /// `Some("")` disables file logging, `None` picks a default location.
    pub log_dir: Option<String>,
}

/// Connection identity shared by every remote operation of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageSettings {
    pub region: String,
    pub endpoint_url: Option<String>,
    pub credentials: Option<StaticCredentials>,
    pub force_path_style: bool,
    pub container: String,
    pub create_container: bool,
    pub multipart_threshold: u64,
    pub max_attempts: u32,
}

#[derive(Clone, PartialEq, Eq)]
pub struct StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

impl Settings {
    /// Layers built-in defaults, `config/default.toml`, `config/<RUN_MODE>.toml`
    /// and `BACKUP_*` environment variables (including those from `.env`).
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let env = Self::run_mode();

        let builder = Self::defaults()?
            .add_source(File::new("config/default", FileFormat::Toml).required(false))
            .add_source(File::new(&format!("config/{}", env), FileFormat::Toml).required(false))
            .add_source(Self::environment());

        Self::build(builder)
    }

    /// Selects `config/<RUN_MODE>.toml`; `development` when unset.
    pub fn run_mode() -> String {
        std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into())
    }

    /// Same as [`Settings::load`] but reads variables from `vars` instead of
    /// the process environment, and skips configuration files.
    pub fn from_env_map(vars: Map<String, String>) -> Result<Self, ConfigError> {
        Self::build(Self::defaults()?.add_source(Self::environment().source(Some(vars))))
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        Ok(Config::builder()
            .set_default("force_path_style", false)?
            .set_default("container", DEFAULT_CONTAINER)?
            .set_default("create_container", true)?
            .set_default("source_dir", DEFAULT_SOURCE_DIR)?
            .set_default("retention_days", i64::from(DEFAULT_RETENTION_DAYS))?
            .set_default("compression_level", i64::from(DEFAULT_COMPRESSION_LEVEL))?
            .set_default("delete_concurrency", DEFAULT_DELETE_CONCURRENCY as i64)?
            .set_default("multipart_threshold", DEFAULT_MULTIPART_THRESHOLD as i64)?
            .set_default("max_attempts", i64::from(DEFAULT_MAX_ATTEMPTS))?)
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX).try_parsing(true)
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let mut settings: Settings = builder.build()?.try_deserialize()?;
        settings.normalize();
        settings.validate()?;
        Ok(settings)
    }

    fn normalize(&mut self) {
        for value in [
            &mut self.region,
            &mut self.endpoint_url,
            &mut self.access_key_id,
            &mut self.secret_access_key,
        ] {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *value = None;
            }
        }
        if self
            .output_dir
            .as_deref()
            .is_some_and(|dir| dir.as_os_str().is_empty())
        {
            self.output_dir = None;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.region.is_none() {
            return Err(ConfigError::Missing("region (BACKUP_REGION)"));
        }

        match (&self.access_key_id, &self.secret_access_key) {
            (Some(_), None) => return Err(ConfigError::Missing("secret_access_key (BACKUP_SECRET_ACCESS_KEY)")),
            (None, Some(_)) => return Err(ConfigError::Missing("access_key_id (BACKUP_ACCESS_KEY_ID)")),
            _ => {}
        }

        validate_container_name(&self.container)?;

        if self.compression_level > 9 {
            return Err(ConfigError::InvalidValue(format!(
                "compression_level must be between 0 and 9, got {}",
                self.compression_level
            )));
        }
        if self.delete_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "delete_concurrency must be at least 1".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.multipart_threshold < MIN_PART_SIZE {
            return Err(ConfigError::InvalidValue(format!(
                "multipart_threshold must be at least {} bytes, got {}",
                MIN_PART_SIZE, self.multipart_threshold
            )));
        }
        Ok(())
    }

    pub fn storage(&self) -> StorageSettings {
        let credentials = match (&self.access_key_id, &self.secret_access_key) {
            (Some(id), Some(secret)) => Some(StaticCredentials {
                access_key_id: id.clone(),
                secret_access_key: secret.clone(),
            }),
            _ => None,
        };

        StorageSettings {
            region: self.region.clone().unwrap_or_default(),
            endpoint_url: self.endpoint_url.clone(),
            credentials,
            force_path_style: self.force_path_style,
            container: self.container.clone(),
            create_container: self.create_container,
            multipart_threshold: self.multipart_threshold,
            max_attempts: self.max_attempts,
        }
    }

    /// Resolves the scratch directory for archives, creating it when missing
    /// and checking that it accepts new files.
    pub fn prepare_output_dir(&self, override_dir: Option<&Path>) -> Result<PathBuf, ConfigError> {
        let dir = override_dir
            .map(Path::to_path_buf)
            .or_else(|| self.output_dir.clone())
            .unwrap_or_else(std::env::temp_dir);

        std::fs::create_dir_all(&dir).map_err(|source| ConfigError::OutputDir {
            path: dir.clone(),
            source,
        })?;
        tempfile::tempfile_in(&dir).map_err(|source| ConfigError::OutputDir {
            path: dir.clone(),
            source,
        })?;

        Ok(dir)
    }
}

/// Bucket naming rules: 3-63 characters of lowercase letters, digits, `-` and
/// `.`, beginning and ending with a letter or digit.
pub fn validate_container_name(name: &str) -> Result<(), ConfigError> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
    let valid_edges = name
        .chars()
        .next()
        .zip(name.chars().last())
        .is_some_and(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric());

    if (3..=63).contains(&name.len()) && valid_chars && valid_edges {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue(format!(
            "invalid container name {:?}",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn vars(pairs: &[(&str, &str)]) -> Map<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_apply_when_only_region_is_set() {
        let settings = Settings::from_env_map(vars(&[("BACKUP_REGION", "eu-west-1")])).unwrap();

        assert_eq!(settings.region.as_deref(), Some("eu-west-1"));
        assert_eq!(settings.container, DEFAULT_CONTAINER);
        assert_eq!(settings.retention_days, DEFAULT_RETENTION_DAYS);
        assert_eq!(settings.source_dir, PathBuf::from(DEFAULT_SOURCE_DIR));
        assert_eq!(settings.compression_level, 9);
        assert_eq!(settings.delete_concurrency, 8);
        assert!(settings.create_container);
        assert!(settings.output_dir.is_none());
        assert!(settings.storage().credentials.is_none());
    }

    #[test]
    fn test_environment_overrides_defaults() {
        let settings = Settings::from_env_map(vars(&[
            ("BACKUP_REGION", "us-east-1"),
            ("BACKUP_CONTAINER", "nightly-backups"),
            ("BACKUP_RETENTION_DAYS", "7"),
            ("BACKUP_ENDPOINT_URL", "http://localhost:9000"),
            ("BACKUP_FORCE_PATH_STYLE", "true"),
            ("BACKUP_ACCESS_KEY_ID", "minio"),
            ("BACKUP_SECRET_ACCESS_KEY", "minio123"),
        ]))
        .unwrap();

        assert_eq!(settings.container, "nightly-backups");
        assert_eq!(settings.retention_days, 7);

        let storage = settings.storage();
        assert_eq!(storage.endpoint_url.as_deref(), Some("http://localhost:9000"));
        assert!(storage.force_path_style);
        assert_eq!(
            storage.credentials.map(|c| c.access_key_id),
            Some("minio".to_string())
        );
    }

    #[test]
    fn test_missing_region_is_fatal() {
        let err = Settings::from_env_map(vars(&[("BACKUP_CONTAINER", "backups")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn test_blank_region_counts_as_missing() {
        let err = Settings::from_env_map(vars(&[("BACKUP_REGION", "  ")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test_case(&[("BACKUP_ACCESS_KEY_ID", "id")] ; "key without secret")]
    #[test_case(&[("BACKUP_SECRET_ACCESS_KEY", "secret")] ; "secret without key")]
    fn test_credentials_come_in_pairs(extra: &[(&str, &str)]) {
        let mut env = vars(&[("BACKUP_REGION", "eu-west-1")]);
        env.extend(vars(extra));
        assert!(matches!(
            Settings::from_env_map(env),
            Err(ConfigError::Missing(_))
        ));
    }

    #[test_case("backups", true)]
    #[test_case("my.backup-bucket-01", true)]
    #[test_case("ab", false ; "too short")]
    #[test_case("Backups", false ; "uppercase")]
    #[test_case("-backups", false ; "leading dash")]
    #[test_case("backups.", false ; "trailing dot")]
    #[test_case("back_ups", false ; "underscore")]
    fn test_container_name_validation(name: &str, valid: bool) {
        assert_eq!(validate_container_name(name).is_ok(), valid);
    }

    #[test_case("BACKUP_COMPRESSION_LEVEL", "10")]
    #[test_case("BACKUP_DELETE_CONCURRENCY", "0")]
    #[test_case("BACKUP_MAX_ATTEMPTS", "0")]
    #[test_case("BACKUP_MULTIPART_THRESHOLD", "1024")]
    fn test_out_of_range_values_are_rejected(key: &str, value: &str) {
        let err = Settings::from_env_map(vars(&[("BACKUP_REGION", "eu-west-1"), (key, value)]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn test_secret_is_redacted_in_debug_output() {
        let creds = StaticCredentials {
            access_key_id: "id".into(),
            secret_access_key: "hunter2".into(),
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }

    #[test]
    fn test_prepare_output_dir_creates_missing_directory() {
        let root = tempfile::tempdir().unwrap();
        let scratch = root.path().join("scratch").join("nested");
        let settings = Settings::from_env_map(vars(&[("BACKUP_REGION", "eu-west-1")])).unwrap();

        let dir = settings.prepare_output_dir(Some(&scratch)).unwrap();

        assert_eq!(dir, scratch);
        assert!(scratch.is_dir());
        assert_eq!(std::fs::read_dir(&scratch).unwrap().count(), 0);
    }
}
