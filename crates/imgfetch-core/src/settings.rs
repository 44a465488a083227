//! Persistent user settings for imgfetch
//!
//! Settings are stored in a TOML configuration file at:
//! - Linux/macOS: `~/.config/imgfetch/imgfetch_config.toml`
//! - Windows: `%APPDATA%\imgfetch\imgfetch_config.toml`
//!
//! # Example Configuration
//!
//! ```toml
//! [download]
//! connections = 4
//! timeout_secs = 30
//! retry_attempts = 3
//! retry_delay_ms = 1000
//! write_buffer_size = "256K"
//! location = "/var/cache/images"
//!
//! [checksum]
//! algorithm = "md5"
//! block_size = "1M"
//!
//! [progress]
//! initial_delay_ms = 2000
//! tick_interval_ms = 1000
//! smoothing_factor = 0.005
//! json = false
//! ```

use crate::config::{AcquireConfig, ProgressConfig, DEFAULT_READ_BLOCK_SIZE, DEFAULT_WRITE_BUFFER_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration file name
const CONFIG_FILE_NAME: &str = "imgfetch_config.toml";

/// Application name for config directory
const APP_NAME: &str = "imgfetch";

/// User settings loaded from configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Download settings
    pub download: DownloadSettings,

    /// Checksum settings
    pub checksum: ChecksumSettings,

    /// Progress reporting settings
    pub progress: ProgressSettings,
}

/// Settings for downloads
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DownloadSettings {
    /// Concurrent range fetches per download
    pub connections: usize,

    /// Connect/read timeout in seconds
    pub timeout_secs: u64,

    /// Reconnect attempts per segment
    pub retry_attempts: u32,

    /// Delay between reconnect attempts in milliseconds
    pub retry_delay_ms: u64,

    /// Per-segment write batch (e.g., "256K", "1M")
    pub write_buffer_size: String,

    /// Default download directory for network images
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<PathBuf>,
}

/// Settings for checksum operations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChecksumSettings {
    /// Default checksum algorithm
    pub algorithm: String,

    /// Read block size (e.g., "1M", "512K")
    pub block_size: String,
}

/// Settings for progress reporting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProgressSettings {
    /// Delay before the first speed sample in milliseconds
    pub initial_delay_ms: u64,

    /// Sampling cadence in milliseconds
    pub tick_interval_ms: u64,

    /// EWMA weight of the newest speed sample
    pub smoothing_factor: f64,

    /// Emit JSON progress lines instead of progress bars
    pub json: bool,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        let config = AcquireConfig::default();
        Self {
            connections: config.connections,
            timeout_secs: config.timeout.as_secs(),
            retry_attempts: config.retry_attempts,
            retry_delay_ms: config.retry_delay.as_millis() as u64,
            write_buffer_size: "256K".to_string(),
            location: None,
        }
    }
}

impl Default for ChecksumSettings {
    fn default() -> Self {
        Self {
            algorithm: "md5".to_string(),
            block_size: "1M".to_string(),
        }
    }
}

impl Default for ProgressSettings {
    fn default() -> Self {
        let progress = ProgressConfig::default();
        Self {
            initial_delay_ms: progress.initial_delay.as_millis() as u64,
            tick_interval_ms: progress.tick_interval.as_millis() as u64,
            smoothing_factor: progress.smoothing_factor,
            json: false,
        }
    }
}

impl Settings {
    /// Load settings from the configuration file
    ///
    /// Returns default settings if the file doesn't exist or can't be parsed
    pub fn load() -> Self {
        Self::load_from_path(Self::config_path())
    }

    /// Load settings from a specific path
    pub fn load_from_path(path: Option<PathBuf>) -> Self {
        let Some(path) = path else {
            tracing::debug!("No config path available, using defaults");
            return Self::default();
        };

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(settings) => {
                    tracing::debug!("Loaded settings from {:?}", path);
                    settings
                }
                Err(e) => {
                    tracing::warn!("Failed to parse config file {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Save settings to the configuration file
    pub fn save(&self) -> Result<PathBuf, SettingsError> {
        self.save_to_path(Self::config_path())
    }

    /// Save settings to a specific path
    pub fn save_to_path(&self, path: Option<PathBuf>) -> Result<PathBuf, SettingsError> {
        let path = path.ok_or(SettingsError::NoConfigDir)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SettingsError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let contents = toml::to_string_pretty(self).map_err(SettingsError::Serialize)?;

        std::fs::write(&path, contents).map_err(|e| SettingsError::Io {
            path: path.clone(),
            source: e,
        })?;

        tracing::info!("Saved settings to {:?}", path);
        Ok(path)
    }

    /// Get the path to the configuration file
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join(CONFIG_FILE_NAME))
    }

    /// Get the path to the configuration directory
    pub fn config_dir() -> Option<PathBuf> {
        dirs_next::config_dir().map(|p| p.join(APP_NAME))
    }

    /// Check if a configuration file exists
    pub fn config_exists() -> bool {
        Self::config_path().is_some_and(|p| p.exists())
    }

    /// Generate a default configuration file content as a string
    pub fn default_config_string() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate default config"))
    }

    /// Build the runtime configuration these settings describe
    ///
    /// Unparseable sizes fall back to their defaults with a warning.
    pub fn to_config(&self) -> AcquireConfig {
        let write_buffer_size = size_or_default(
            "download.write_buffer_size",
            &self.download.write_buffer_size,
            DEFAULT_WRITE_BUFFER_SIZE,
        );
        let read_block_size =
            size_or_default("checksum.block_size", &self.checksum.block_size, DEFAULT_READ_BLOCK_SIZE);

        let progress = ProgressConfig::new()
            .initial_delay(Duration::from_millis(self.progress.initial_delay_ms))
            .tick_interval(Duration::from_millis(self.progress.tick_interval_ms))
            .smoothing_factor(self.progress.smoothing_factor);

        AcquireConfig::new()
            .connections(self.download.connections)
            .timeout(Duration::from_secs(self.download.timeout_secs))
            .retry_attempts(self.download.retry_attempts)
            .retry_delay(Duration::from_millis(self.download.retry_delay_ms))
            .write_buffer_size(write_buffer_size)
            .read_block_size(read_block_size)
            .progress(progress)
    }
}

fn size_or_default(key: &str, value: &str, default: usize) -> usize {
    match parse_size(value) {
        Ok(size) if size > 0 => size,
        Ok(_) | Err(_) => {
            tracing::warn!("Invalid size {:?} for {}, using default", value, key);
            default
        }
    }
}

/// Parse a size such as `"512"`, `"256K"`, `"4M"` or `"1G"`
pub fn parse_size(s: &str) -> Result<usize, SettingsError> {
    let s = s.trim().to_uppercase();

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('K') {
        (n, 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else {
        (s.as_str(), 1)
    };

    num_str
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| SettingsError::InvalidSize(s.clone()))
}

/// Errors that can occur when working with settings
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// No configuration directory available
    #[error("Could not determine configuration directory")]
    NoConfigDir,

    /// Failed to read or write config file
    #[error("I/O error for {path}: {source}")]
    Io {
        /// Path that caused the error
        path: PathBuf,
        /// The underlying error
        source: std::io::Error,
    },

    /// Failed to serialize settings
    #[error("Failed to serialize settings: {0}")]
    Serialize(toml::ser::Error),

    /// A size value could not be parsed
    #[error("Invalid size: {0}")]
    InvalidSize(String),
}
