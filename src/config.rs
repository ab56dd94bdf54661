//! Store configuration
//!
//! Loaded from `jqlstore.toml`, after a `.env` file next to it has been
//! applied to the process environment.
//!
//! ## Environment Variables
//!
//! The following environment variables override config file settings:
//!
//! - `JQLSTORE_MODE` - `embedded` (RocksDB) or `relational` (SQLite)
//! - `JQLSTORE_DATA_DIR` - RocksDB data directory
//! - `JQLSTORE_SQLITE_PATH` - SQLite database file
//! - `JQLSTORE_MAX_LISTENERS` - Maximum number of change listeners

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{DbError, DbResult};

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "jqlstore.toml";

/// Environment variable names
pub const ENV_MODE: &str = "JQLSTORE_MODE";
pub const ENV_DATA_DIR: &str = "JQLSTORE_DATA_DIR";
pub const ENV_SQLITE_PATH: &str = "JQLSTORE_SQLITE_PATH";
pub const ENV_MAX_LISTENERS: &str = "JQLSTORE_MAX_LISTENERS";

/// Which backend executes queries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// RocksDB key-value store, queries evaluated in memory
    #[default]
    Embedded,
    /// SQLite, queries translated to SQL
    Relational,
}

impl FromStr for StorageMode {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "embedded" | "rocksdb" => Ok(StorageMode::Embedded),
            "relational" | "sqlite" => Ok(StorageMode::Relational),
            other => Err(DbError::Config(format!("unknown storage mode '{}'", other))),
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageMode::Embedded => f.write_str("embedded"),
            StorageMode::Relational => f.write_str("relational"),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub mode: StorageMode,
    /// RocksDB data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// SQLite database file; defaults to `<data_dir>/jqlstore.sqlite3`
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
    #[serde(default = "default_max_listeners")]
    pub max_listeners: usize,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_max_listeners() -> usize {
    64
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::default(),
            data_dir: default_data_dir(),
            sqlite_path: None,
            max_listeners: default_max_listeners(),
        }
    }
}

impl StoreConfig {
    /// Embedded store under `data_dir`
    pub fn embedded(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            mode: StorageMode::Embedded,
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Relational store in the given SQLite file
    pub fn relational(sqlite_path: impl Into<PathBuf>) -> Self {
        Self {
            mode: StorageMode::Relational,
            sqlite_path: Some(sqlite_path.into()),
            ..Self::default()
        }
    }

    /// Load configuration from a directory
    ///
    /// Loads `.env` from the directory if present, reads `jqlstore.toml` if
    /// present (defaults otherwise) and applies environment overrides.
    pub fn load(dir: &Path) -> DbResult<Self> {
        let env_path = dir.join(".env");
        if env_path.exists() {
            let _ = dotenvy::from_path(&env_path);
        }

        let config_path = dir.join(CONFIG_FILE_NAME);
        let mut config = if config_path.exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a TOML configuration file
    pub fn from_file(path: &Path) -> DbResult<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| DbError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Apply overrides from `lookup` (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> DbResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(mode) = get(ENV_MODE) {
            self.mode = mode.parse()?;
        }

        if let Some(dir) = get(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }

        if let Some(path) = get(ENV_SQLITE_PATH) {
            self.sqlite_path = Some(PathBuf::from(path));
        }

        if let Some(max) = get(ENV_MAX_LISTENERS) {
            self.max_listeners = max.parse().map_err(|_| {
                DbError::Config(format!("{} must be a number, got '{}'", ENV_MAX_LISTENERS, max))
            })?;
        }

        Ok(())
    }

    /// SQLite file used in relational mode
    pub fn sqlite_file(&self) -> PathBuf {
        self.sqlite_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("jqlstore.sqlite3"))
    }

    /// Save configuration to a directory
    pub fn save(&self, dir: &Path) -> DbResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| DbError::Config(e.to_string()))?;
        std::fs::write(dir.join(CONFIG_FILE_NAME), content)?;
        Ok(())
    }
}
