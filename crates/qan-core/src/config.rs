//! Per-instance analyzer configuration, persisted as `qan-<uuid>.conf`.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::fingerprint::{DEFAULT_KEY_FILTERS, Fingerprinter};

/// Where an instance's query statistics come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Statement digest summary rows.
    #[default]
    Perfschema,
    /// Profiler documents, fingerprinted.
    Profiler,
    /// PostgreSQL `pg_stat_statements`.
    PgStatements,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::Perfschema => "perfschema",
            SourceKind::Profiler => "profiler",
            SourceKind::PgStatements => "pg_statements",
        };
        f.write_str(name)
    }
}

fn default_interval() -> u64 {
    60
}

fn default_key_filters() -> Vec<String> {
    DEFAULT_KEY_FILTERS.iter().map(|s| s.to_string()).collect()
}

/// Analyzer configuration of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QanConfig {
    pub uuid: String,
    /// Interval length in seconds.
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub example_queries: bool,
    #[serde(default)]
    pub source: SourceKind,
    #[serde(default = "default_key_filters")]
    pub key_filters: Vec<String>,
}

impl Default for QanConfig {
    fn default() -> Self {
        Self {
            uuid: String::new(),
            interval: default_interval(),
            example_queries: false,
            source: SourceKind::default(),
            key_filters: default_key_filters(),
        }
    }
}

/// Error type for configuration handling.
#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: io::Error },
    Parse { path: PathBuf, message: String },
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            ConfigError::Parse { path, message } => {
                write!(f, "{}: invalid config: {}", path.display(), message)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ConfigError + '_ {
    move |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Path of the config file of instance `uuid` under `basedir`.
pub fn config_file(basedir: &Path, uuid: &str) -> PathBuf {
    basedir.join(format!("qan-{}.conf", uuid))
}

impl QanConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.uuid.is_empty() {
            return Err(ConfigError::Invalid("uuid is empty".to_string()));
        }
        if self
            .uuid
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        {
            return Err(ConfigError::Invalid(format!(
                "uuid {:?} has characters other than [A-Za-z0-9_-]",
                self.uuid
            )));
        }
        if self.interval == 0 {
            return Err(ConfigError::Invalid("interval must be at least 1 second".to_string()));
        }
        self.fingerprinter()
            .map(|_| ())
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Fingerprinter with this instance's key filters.
    pub fn fingerprinter(&self) -> Result<Fingerprinter, crate::fingerprint::FingerprintError> {
        Fingerprinter::new(self.key_filters.as_slice())
    }

    /// Reads and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(io_err(path))?;
        let config: QanConfig = serde_json::from_str(&data).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Writes `qan-<uuid>.conf` under `basedir`, replacing any previous file.
    pub fn save(&self, basedir: &Path) -> Result<PathBuf, ConfigError> {
        self.validate()?;
        let path = config_file(basedir, &self.uuid);
        let data = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.clone(),
            message: e.to_string(),
        })?;

        let tmp = path.with_extension("conf.tmp");
        fs::write(&tmp, data).map_err(io_err(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_err(&path))?;
        Ok(path)
    }

    /// Removes the config file of `uuid`. Missing files are not an error.
    pub fn remove(basedir: &Path, uuid: &str) -> Result<(), ConfigError> {
        let path = config_file(basedir, uuid);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConfigError::Io { path, source: e }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> QanConfig {
        QanConfig {
            uuid: "3c6b9e1f-db01".to_string(),
            interval: 60,
            example_queries: true,
            source: SourceKind::Profiler,
            key_filters: vec!["^shardVersion$".to_string(), "^_tmp".to_string()],
        }
    }

    #[test]
    fn save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = config().save(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("qan-3c6b9e1f-db01.conf"));
        assert!(!dir.path().join("qan-3c6b9e1f-db01.conf.tmp").exists());
        assert_eq!(QanConfig::load(&path).unwrap(), config());
    }

    #[test]
    fn save_overwrites_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        config().save(dir.path()).unwrap();
        let mut changed = config();
        changed.interval = 10;
        let path = changed.save(dir.path()).unwrap();
        assert_eq!(QanConfig::load(&path).unwrap().interval, 10);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qan-abc.conf");
        fs::write(&path, r#"{"uuid": "abc"}"#).unwrap();

        let c = QanConfig::load(&path).unwrap();
        assert_eq!(c.interval, 60);
        assert!(!c.example_queries);
        assert_eq!(c.source, SourceKind::Perfschema);
        assert_eq!(c.key_filters, vec!["^shardVersion$".to_string()]);
    }

    #[test]
    fn source_names_in_json() {
        let c = QanConfig {
            uuid: "x".to_string(),
            source: SourceKind::PgStatements,
            ..Default::default()
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["source"], "pg_statements");
        assert_eq!(SourceKind::PgStatements.to_string(), "pg_statements");
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = config().save(dir.path()).unwrap();
        QanConfig::remove(dir.path(), &config().uuid).unwrap();
        assert!(!path.exists());
        QanConfig::remove(dir.path(), &config().uuid).unwrap();
    }

    #[test]
    fn load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("qan-none.conf");
        assert!(matches!(QanConfig::load(&missing), Err(ConfigError::Io { .. })));

        let garbage = dir.path().join("qan-bad.conf");
        fs::write(&garbage, "interval = 5").unwrap();
        assert!(matches!(QanConfig::load(&garbage), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn validation() {
        assert!(config().validate().is_ok());

        let mut c = config();
        c.interval = 0;
        assert!(matches!(c.validate(), Err(ConfigError::Invalid(_))));

        let mut c = config();
        c.uuid = String::new();
        assert!(c.validate().is_err());

        let mut c = config();
        c.uuid = "../etc".to_string();
        assert!(c.validate().is_err());

        let mut c = config();
        c.key_filters = vec!["(".to_string()];
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("("));
    }
}
