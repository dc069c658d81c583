//! Configuration file management.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use bend_core::{RetryConfig, SessionConfig, TimestampFormat};
use bend_types::{SampleRate, SelectionFilter};

use crate::cli::TimestampArg;

/// Default aggregation window in milliseconds
pub const DEFAULT_WINDOW_MS: u64 = 1000;

/// Default scan timeout in seconds
pub const DEFAULT_SCAN_TIMEOUT: u64 = 10;

/// Configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Advertised name prefix used to select a sensor
    #[serde(default)]
    pub prefix: Option<String>,

    /// Default sample rate in Hz
    #[serde(default)]
    pub rate: Option<u32>,

    /// Enable the stretch channel by default
    #[serde(default)]
    pub stretch: bool,

    /// Aggregation window in milliseconds
    #[serde(default)]
    pub window_ms: Option<u64>,

    /// Scan timeout in seconds
    #[serde(default)]
    pub scan_timeout: Option<u64>,

    /// Timestamp style in CSV exports
    #[serde(default)]
    pub timestamps: Option<TimestampFormat>,

    /// Disable colored output
    #[serde(default)]
    pub no_color: bool,

    /// Connection retry settings
    #[serde(default)]
    pub retry: RetrySettings,
}

/// Retry settings as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, doubled on each following retry
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Reconnect automatically when the link drops
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            auto_reconnect: true,
        }
    }
}

impl Config {
    /// Get the config file path
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bend")
            .join("config.toml")
    }

    /// Load config from file, or return default if not found
    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        eprintln!("Warning: Failed to parse config: {}", e);
                    }
                },
                Err(e) => {
                    eprintln!("Warning: Failed to read config: {}", e);
                }
            }
        }
        Self::default()
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Session settings derived from the retry section.
    pub fn session_config(&self) -> Result<SessionConfig> {
        let retry = RetryConfig::for_connect()
            .max_retries(self.retry.max_retries)
            .initial_delay(Duration::from_millis(self.retry.initial_delay_ms));
        let config = SessionConfig::new()
            .connect_retry(retry.clone())
            .reconnect_retry(retry)
            .auto_reconnect(self.retry.auto_reconnect);
        config.validate().context("Invalid retry settings in config")?;
        Ok(config)
    }
}

/// Build the selection filter, preferring the argument over the config file.
pub fn resolve_filter(prefix: Option<String>, config: &Config) -> SelectionFilter {
    let mut filter = SelectionFilter::default();
    if let Some(prefix) = prefix.or_else(|| config.prefix.clone()) {
        filter.name_prefix = prefix;
    }
    filter
}

/// Resolve the sample rate, validating a rate taken from the config file.
pub fn resolve_rate(rate: Option<SampleRate>, config: &Config) -> Result<SampleRate> {
    match (rate, config.rate) {
        (Some(rate), _) => Ok(rate),
        (None, Some(hz)) => SampleRate::try_from(hz)
            .map_err(|e| anyhow!("Invalid rate in config file: {}", e)),
        (None, None) => Ok(SampleRate::default()),
    }
}

pub fn resolve_window(window_ms: Option<u64>, config: &Config) -> Duration {
    Duration::from_millis(
        window_ms
            .or(config.window_ms)
            .unwrap_or(DEFAULT_WINDOW_MS),
    )
}

pub fn resolve_scan_timeout(timeout: Option<u64>, config: &Config) -> Duration {
    Duration::from_secs(
        timeout
            .or(config.scan_timeout)
            .unwrap_or(DEFAULT_SCAN_TIMEOUT),
    )
}

pub fn resolve_timestamps(arg: Option<TimestampArg>, config: &Config) -> TimestampFormat {
    match arg {
        Some(TimestampArg::Unix) => TimestampFormat::UnixMillis,
        Some(TimestampArg::Rfc3339) => TimestampFormat::Rfc3339,
        None => config.timestamps.unwrap_or_default(),
    }
}
