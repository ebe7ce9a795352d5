//! Configuration module for imdash
//!
//! This module handles runtime configuration:
//! - connector settings (browse root, shared-memory directory, topic feeds)
//! - expression engine limits
//! - logging output
//!
//! # App Data Location
//!
//! The configuration file is stored in the platform-appropriate location:
//! - **Linux**: `~/.local/share/imdash/`
//! - **macOS**: `~/Library/Application Support/imdash/`
//! - **Windows**: `%APPDATA%\imdash\`
//!
//! # Files
//!
//! - `config.toml` - [`AppConfig`]
//! - Dashboard files (`.json`) - see [`dashboard`]
//!
//! # Example
//!
//! ```ignore
//! use imdash_core::config::AppConfig;
//!
//! let mut config = AppConfig::load_or_default();
//! config.stores.shm_dir = "/tmp/stores".into();
//! config.save()?;
//! ```

pub mod dashboard;

pub use dashboard::{DashboardFile, NamedExpression};

use crate::error::{DashError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for data directories
pub const APP_ID: &str = "imdash";

/// Config filename
pub const CONFIG_FILE: &str = "config.toml";

/// Default shared-memory directory for structured stores
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app data directory exists
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir()
        .ok_or_else(|| DashError::Config("Could not determine app data directory".to_string()))?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            DashError::Config(format!("Failed to create app data directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// Get the path to the config file
pub fn config_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== Sections ====================

/// Filesystem connector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemConfig {
    /// Directory listed when browsing for files
    pub browse_root: PathBuf,
    /// List dot-files when browsing
    pub show_hidden: bool,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            browse_root: dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("/")),
            show_hidden: false,
        }
    }
}

/// Shared structured store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory that store names are resolved against
    pub shm_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shm_dir: PathBuf::from(DEFAULT_SHM_DIR),
        }
    }
}

/// Live-topic connector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Feed carrying coordinate-frame transforms
    pub tf_topic: String,
    /// Feed carrying simulated time
    pub clock_topic: String,
    /// Simulated time counts as active while the clock published within this window
    pub sim_clock_timeout_ms: u64,
    /// Number of receive intervals kept for rate statistics
    pub rate_window: usize,
    /// Samples kept per transform edge
    pub tf_history: usize,
    /// How far (seconds) a transform lookup may reach past buffered samples
    pub tf_tolerance_secs: f64,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            tf_topic: "/tf".to_string(),
            clock_topic: "/clock".to_string(),
            sim_clock_timeout_ms: 2000,
            rate_window: 100,
            tf_history: 100,
            tf_tolerance_secs: 0.1,
        }
    }
}

/// Expression engine limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Maximum number of operations per evaluation (0 = unlimited)
    pub max_operations: u64,
    /// Maximum expression nesting depth
    pub max_expr_depth: usize,
    /// Maximum array length produced by an expression (0 = unlimited)
    pub max_array_size: usize,
    /// Maximum number of cached compiled expressions
    pub cache_capacity: usize,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            max_operations: 100_000,
            max_expr_depth: 64,
            max_array_size: 1_000_000,
            cache_capacity: 512,
        }
    }
}

/// Logging output settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub filter: Option<String>,
    /// Write a daily-rotated log file into this directory
    pub log_dir: Option<PathBuf>,
}

// ==================== App Config ====================

/// Complete runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub filesystem: FilesystemConfig,
    pub stores: StoreConfig,
    pub topics: TopicConfig,
    pub scripting: ScriptConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load a config file from disk
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DashError::Config(format!("Failed to read config {:?}: {}", path, e))
        })?;

        toml::from_str(&content)
            .map_err(|e| DashError::Config(format!("Failed to parse config {:?}: {}", path, e)))
    }

    /// Load the config from the default location, or defaults if it does not exist
    pub fn load() -> Result<Self> {
        let path = config_path()
            .ok_or_else(|| DashError::Config("Could not determine config path".to_string()))?;

        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(path)
    }

    /// Load the config, returning defaults on any error
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config to a specific file
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| DashError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| DashError::Config(format!("Failed to write config: {}", e)))
    }

    /// Save the config to the default location
    pub fn save(&self) -> Result<()> {
        let dir = ensure_app_data_dir()?;
        self.save_to(dir.join(CONFIG_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.stores.shm_dir, PathBuf::from("/dev/shm"));
        assert_eq!(config.topics.tf_topic, "/tf");
        assert_eq!(config.topics.clock_topic, "/clock");
        assert!(!config.filesystem.show_hidden);
        assert!(config.logging.log_dir.is_none());
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.stores.shm_dir = dir.path().to_path_buf();
        config.topics.rate_window = 7;
        config.scripting.max_operations = 10;
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[topics]\nclock_topic = \"/sim/clock\"\n").unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.topics.clock_topic, "/sim/clock");
        assert_eq!(loaded.topics.tf_topic, "/tf");
        assert_eq!(loaded.stores, StoreConfig::default());
    }

    #[test]
    fn test_invalid_config_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[topics\n").unwrap();
        assert!(matches!(AppConfig::load_from(&path), Err(DashError::Config(_))));
    }
}
