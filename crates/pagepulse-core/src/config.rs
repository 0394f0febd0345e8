//! pagepulse configuration
//!
//! Loaded from a TOML file (`pagepulse.toml`); every field is optional and
//! falls back to the defaults below. A missing file means all defaults.
//!
//! ```toml
//! [buffer]
//! capacity = 1000
//! flush_interval_secs = 120
//!
//! [buffer.column_limits]
//! ip = 45
//!
//! [cache]
//! default_ttl_secs = 300
//!
//! [storage]
//! database_path = "/var/lib/pagepulse/pagepulse.db"
//! max_retries = 2
//! slow_query_ms = 2000
//! ```

use crate::buffer::BufferConfig;
use crate::error::CoreError;
use crate::models::ColumnLimits;
use crate::store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default config file name, looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "pagepulse.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    pub buffer: BufferSettings,
    pub cache: CacheSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    pub capacity: usize,
    pub flush_interval_secs: u64,
    pub column_limits: ColumnLimits,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            flush_interval_secs: 120,
            column_limits: ColumnLimits::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub default_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Defaults to `<data dir>/pagepulse/pagepulse.db`
    pub database_path: Option<PathBuf>,
    pub max_retries: u32,
    pub slow_query_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database_path: None,
            max_retries: 2,
            slow_query_ms: 2000,
        }
    }
}

impl PulseConfig {
    /// Load from `path`; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(CoreError::FileRead {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config = Self::from_toml_str(&content).map_err(|e| match e {
            CoreError::ConfigParse { message, .. } => CoreError::ConfigParse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;

        debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, CoreError> {
        let config: Self = toml::from_str(content).map_err(|e| CoreError::ConfigParse {
            path: PathBuf::new(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.buffer.capacity == 0 {
            return Err(CoreError::InvalidConfig {
                message: "buffer.capacity must be at least 1".to_string(),
            });
        }
        if self.buffer.flush_interval_secs == 0 {
            return Err(CoreError::InvalidConfig {
                message: "buffer.flush_interval_secs must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            capacity: self.buffer.capacity,
            flush_interval: Duration::from_secs(self.buffer.flush_interval_secs),
            column_limits: self.buffer.column_limits,
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_retries: self.storage.max_retries,
            slow_query: Duration::from_millis(self.storage.slow_query_ms),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.default_ttl_secs)
    }

    /// Configured database path, or the per-user default
    pub fn database_path(&self) -> Result<PathBuf, CoreError> {
        match &self.storage.database_path {
            Some(path) => Ok(path.clone()),
            None => default_database_path(),
        }
    }
}

/// `<data dir>/pagepulse/pagepulse.db`
pub fn default_database_path() -> Result<PathBuf, CoreError> {
    let data_dir = dirs::data_dir().ok_or(CoreError::DataDirNotFound)?;
    Ok(data_dir.join("pagepulse").join("pagepulse.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_buffer_and_cache() {
        let config = PulseConfig::default();
        let buffer = config.buffer_config();
        assert_eq!(buffer.capacity, 1000);
        assert_eq!(buffer.flush_interval, Duration::from_secs(120));
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.store_config().max_retries, 2);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = PulseConfig::from_toml_str(
            r#"
            [buffer]
            capacity = 50

            [buffer.column_limits]
            ip = 39

            [storage]
            database_path = "/tmp/views.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.buffer.capacity, 50);
        assert_eq!(config.buffer.flush_interval_secs, 120);
        assert_eq!(config.buffer.column_limits.ip, 39);
        assert_eq!(config.buffer.column_limits.referrer, 2048);
        assert_eq!(
            config.database_path().unwrap(),
            PathBuf::from("/tmp/views.db")
        );
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = PulseConfig::from_toml_str("[buffer]\ncapacity = 0\n").unwrap_err();
        assert!(matches!(err, CoreError::InvalidConfig { .. }));
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempdir().unwrap();
        let config = PulseConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, PulseConfig::default());
    }

    #[test]
    fn test_parse_error_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[buffer\ncapacity = ").unwrap();

        match PulseConfig::load(&path) {
            Err(CoreError::ConfigParse { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected parse error, got {:?}", other),
        }
    }
}
