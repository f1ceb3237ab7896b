//! Configuration loading for the application file system.
//!
//! Layered config: defaults -> config file -> explicit file -> env vars.
//! The default config file lives at ~/.config/afs/config.{toml,json,...}.

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::AfsError;

/// Event bus and event log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsSettings {
    /// Record every published event in the durable per-topic log.
    #[serde(default)]
    pub log_enabled: bool,

    /// RocksDB directory for the event log.
    #[serde(default = "default_event_log_path")]
    pub log_path: String,

    /// Longest a publisher waits on one listener before dropping it (ms).
    #[serde(default = "default_listener_timeout_ms")]
    pub listener_timeout_ms: u64,

    /// Events buffered per listener before delivery blocks.
    #[serde(default = "default_listener_queue_capacity")]
    pub listener_queue_capacity: usize,
}

fn default_event_log_path() -> String {
    data_dir_path("events", "./events")
}

fn default_listener_timeout_ms() -> u64 {
    5000
}

fn default_listener_queue_capacity() -> usize {
    1024
}

impl Default for EventsSettings {
    fn default() -> Self {
        Self {
            log_enabled: false,
            log_path: default_event_log_path(),
            listener_timeout_ms: default_listener_timeout_ms(),
            listener_queue_capacity: default_listener_queue_capacity(),
        }
    }
}

impl EventsSettings {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.listener_timeout_ms == 0 {
            return Err("listener_timeout_ms must be > 0".to_string());
        }
        if self.listener_queue_capacity == 0 {
            return Err("listener_queue_capacity must be > 0".to_string());
        }
        Ok(())
    }
}

/// Storage engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Number of lock stripes guarding per-node read-modify-write sequences.
    #[serde(default = "default_lock_stripes")]
    pub lock_stripes: usize,

    /// Maximum number of entries held in the cache before eviction.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_lock_stripes() -> usize {
    64
}

fn default_cache_capacity() -> usize {
    10_000
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            lock_stripes: default_lock_stripes(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl StorageSettings {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.lock_stripes == 0 {
            return Err("lock_stripes must be > 0".to_string());
        }
        if self.cache_capacity == 0 {
            return Err("cache_capacity must be > 0".to_string());
        }
        Ok(())
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Name of the file system this store backs
    #[serde(default = "default_file_system_name")]
    pub file_system_name: String,

    /// Path to RocksDB storage directory
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub events: EventsSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

fn default_file_system_name() -> String {
    "afs".to_string()
}

fn default_db_path() -> String {
    data_dir_path("db", "./data")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn data_dir_path(leaf: &str, fallback: &str) -> String {
    ProjectDirs::from("", "", "afs")
        .map(|p| p.data_local_dir().join(leaf))
        .unwrap_or_else(|| PathBuf::from(fallback))
        .to_string_lossy()
        .to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            file_system_name: default_file_system_name(),
            db_path: default_db_path(),
            log_level: default_log_level(),
            events: EventsSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/afs/config.toml)
    /// 3. Explicit config file (optional)
    /// 4. Environment variables (AFS_*, nested keys joined with `__`)
    pub fn load(config_path: Option<&str>) -> Result<Self, AfsError> {
        let config_dir = ProjectDirs::from("", "", "afs")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("file_system_name", default_file_system_name())
            .map_err(|e| AfsError::Config(e.to_string()))?
            .set_default("db_path", default_db_path())
            .map_err(|e| AfsError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| AfsError::Config(e.to_string()))?
            .set_default("events.log_enabled", false)
            .map_err(|e| AfsError::Config(e.to_string()))?
            .set_default("events.log_path", default_event_log_path())
            .map_err(|e| AfsError::Config(e.to_string()))?
            .set_default(
                "events.listener_timeout_ms",
                default_listener_timeout_ms() as i64,
            )
            .map_err(|e| AfsError::Config(e.to_string()))?
            .set_default(
                "events.listener_queue_capacity",
                default_listener_queue_capacity() as i64,
            )
            .map_err(|e| AfsError::Config(e.to_string()))?
            .set_default("storage.lock_stripes", default_lock_stripes() as i64)
            .map_err(|e| AfsError::Config(e.to_string()))?
            .set_default("storage.cache_capacity", default_cache_capacity() as i64)
            .map_err(|e| AfsError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Format: AFS_DB_PATH, AFS_EVENTS__LOG_ENABLED, AFS_STORAGE__LOCK_STRIPES
        builder = builder.add_source(
            Environment::with_prefix("AFS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| AfsError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| AfsError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate nested sections.
    pub fn validate(&self) -> Result<(), AfsError> {
        if self.file_system_name.is_empty() {
            return Err(AfsError::Config("file_system_name is empty".to_string()));
        }
        self.events.validate().map_err(AfsError::Config)?;
        self.storage.validate().map_err(AfsError::Config)?;
        Ok(())
    }

    /// Settings for a store rooted in `dir`, as used by tests and tools.
    pub fn for_directory(dir: &std::path::Path, file_system_name: &str) -> Self {
        Self {
            file_system_name: file_system_name.to_string(),
            db_path: dir.join("db").to_string_lossy().to_string(),
            events: EventsSettings {
                log_path: dir.join("events").to_string_lossy().to_string(),
                ..EventsSettings::default()
            },
            ..Settings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.file_system_name, "afs");
        assert_eq!(settings.log_level, "info");
        assert!(!settings.events.log_enabled);
        assert_eq!(settings.events.listener_timeout_ms, 5000);
        assert_eq!(settings.storage.lock_stripes, 64);
    }

    #[test]
    fn test_load_with_defaults() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.events.listener_queue_capacity, 1024);
    }

    #[test]
    fn test_validation() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());

        settings.events.listener_timeout_ms = 0;
        assert!(settings.validate().is_err());

        settings.events.listener_timeout_ms = 10;
        settings.storage.lock_stripes = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_for_directory() {
        let settings = Settings::for_directory(std::path::Path::new("/tmp/x"), "fs1");
        assert_eq!(settings.file_system_name, "fs1");
        assert!(settings.db_path.ends_with("db"));
        assert!(settings.events.log_path.ends_with("events"));
    }

    #[test]
    fn test_settings_serialization() {
        let settings = Settings::default();
        let json = serde_json::to_string(&settings).unwrap();
        let decoded: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.storage.cache_capacity, 10_000);
    }
}
