//! Store configuration shared by the primary and secondary processes.
//!
//! # Responsibility
//! - Describe where the shared container lives and which budgets apply.
//! - Load settings from TOML with conservative defaults.
//!
//! # Invariants
//! - File names are plain names inside `container_dir`, never paths.
//! - Limits and timeouts are strictly positive.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DB_FILE_NAME: &str = "healthsync.sqlite3";
pub const DEFAULT_CONTEXT_FILE_NAME: &str = "healthsync-context.json";
pub const DEFAULT_MEMORY_CEILING_MB: u64 = 48;
pub const DEFAULT_BATCH_LIMIT: u32 = 50;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_PUSH_TIMEOUT_MS: u64 = 15_000;

const BYTES_PER_MB: u64 = 1024 * 1024;

static FILE_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("file name pattern is valid"));

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(toml::de::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "invalid config TOML: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

/// Settings for one process's view of the shared store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Directory shared between the primary and secondary processes.
    pub container_dir: PathBuf,
    pub db_file_name: String,
    pub context_file_name: String,
    /// Resident memory ceiling checked before every accessor query.
    pub memory_ceiling_mb: u64,
    /// Upper bound on rows returned by one accessor call.
    pub batch_limit: u32,
    pub busy_timeout_ms: u64,
    /// Fixed timeout applied to each remote call during reconciliation.
    pub push_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            container_dir: PathBuf::new(),
            db_file_name: DEFAULT_DB_FILE_NAME.to_string(),
            context_file_name: DEFAULT_CONTEXT_FILE_NAME.to_string(),
            memory_ceiling_mb: DEFAULT_MEMORY_CEILING_MB,
            batch_limit: DEFAULT_BATCH_LIMIT,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            push_timeout_ms: DEFAULT_PUSH_TIMEOUT_MS,
        }
    }
}

impl StoreConfig {
    /// Default settings rooted at `container_dir`.
    pub fn for_container(container_dir: impl Into<PathBuf>) -> Self {
        Self {
            container_dir: container_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.container_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "container_dir cannot be empty".to_string(),
            ));
        }
        for (field, value) in [
            ("db_file_name", &self.db_file_name),
            ("context_file_name", &self.context_file_name),
        ] {
            if !FILE_NAME_PATTERN.is_match(value) {
                return Err(ConfigError::Invalid(format!(
                    "{field} must be a plain file name, got `{value}`"
                )));
            }
        }
        if self.db_file_name == self.context_file_name {
            return Err(ConfigError::Invalid(
                "db_file_name and context_file_name must differ".to_string(),
            ));
        }
        for (field, value) in [
            ("memory_ceiling_mb", self.memory_ceiling_mb),
            ("batch_limit", u64::from(self.batch_limit)),
            ("busy_timeout_ms", self.busy_timeout_ms),
            ("push_timeout_ms", self.push_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be positive")));
            }
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.container_dir.join(&self.db_file_name)
    }

    pub fn context_path(&self) -> PathBuf {
        self.container_dir.join(&self.context_file_name)
    }

    pub fn memory_ceiling_bytes(&self) -> u64 {
        self.memory_ceiling_mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, StoreConfig, DEFAULT_BATCH_LIMIT, DEFAULT_DB_FILE_NAME};
    use std::path::PathBuf;

    #[test]
    fn toml_overrides_merge_with_defaults() {
        let config = StoreConfig::from_toml_str(
            r#"
            container_dir = "/var/group/shared"
            memory_ceiling_mb = 24
            "#,
        )
        .unwrap();
        assert_eq!(config.container_dir, PathBuf::from("/var/group/shared"));
        assert_eq!(config.memory_ceiling_mb, 24);
        assert_eq!(config.batch_limit, DEFAULT_BATCH_LIMIT);
        assert_eq!(
            config.db_path(),
            PathBuf::from("/var/group/shared").join(DEFAULT_DB_FILE_NAME)
        );
        assert_eq!(config.memory_ceiling_bytes(), 24 * 1024 * 1024);
    }

    #[test]
    fn rejects_path_like_file_names() {
        let err = StoreConfig::from_toml_str(
            r#"
            container_dir = "/tmp/x"
            db_file_name = "../escape.db"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(message) if message.contains("db_file_name")));
    }

    #[test]
    fn rejects_zero_limits_and_unknown_keys() {
        let zero = StoreConfig::from_toml_str(
            r#"
            container_dir = "/tmp/x"
            batch_limit = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(zero, ConfigError::Invalid(_)));

        let unknown = StoreConfig::from_toml_str(
            r#"
            container_dir = "/tmp/x"
            colour = "blue"
            "#,
        )
        .unwrap_err();
        assert!(matches!(unknown, ConfigError::Parse(_)));
    }

    #[test]
    fn load_reads_file_and_reports_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.toml");
        std::fs::write(&path, "container_dir = \"/tmp/shared\"\npush_timeout_ms = 250\n").unwrap();

        let config = StoreConfig::load(&path).unwrap();
        assert_eq!(config.push_timeout().as_millis(), 250);

        let err = StoreConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn missing_container_dir_is_invalid() {
        let err = StoreConfig::from_toml_str("").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
