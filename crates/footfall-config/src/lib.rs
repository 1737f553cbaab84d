//! Configuration management for Footfall
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (`FOOTFALL_*` prefix, `__` between section and key)
//! 2. footfall.local.toml (gitignored, local overrides)
//! 3. footfall.toml (git-tracked, project config)
//! 4. ~/.config/footfall/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)
//!
//! Values are kept in their on-disk form here (seconds, milliseconds, zero
//! meaning "derive"). The tracker turns them into its runtime configuration
//! and clamps them into their valid bands.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main Footfall configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FootfallConfig {
    pub tracker: TrackerSettings,
    pub session: SessionSettings,
    pub fingerprint: FingerprintSettings,
    pub referrer: ReferrerSettings,
    pub filter: FilterSettings,
}

/// Ingestion pipeline sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    /// Number of worker threads; 0 uses the number of logical CPUs.
    pub workers: usize,
    /// Rows a worker collects before it writes a batch.
    pub worker_buffer_size: usize,
    /// Seconds after which a worker writes whatever it has collected.
    pub flush_timeout_secs: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            workers: 0,
            worker_buffer_size: 500,
            flush_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Maximum gap between two hits of the same session.
    pub max_age_secs: u64,
    /// Seconds between session cache generation swaps; 0 derives it from
    /// the flush timeout.
    pub cleanup_interval_secs: u64,
    /// Page views arriving faster than this are counted towards the bot score.
    pub bot_min_delay_ms: u64,
    /// Sessions at or above this score are ignored; 0 disables bot filtering.
    pub bot_threshold: u8,
    /// A session reaching this many page views is marked as a bot; 0 disables.
    pub max_page_views: u16,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_age_secs: 15 * 60,
            cleanup_interval_secs: 0,
            bot_min_delay_ms: 75,
            bot_threshold: 5,
            max_page_views: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintSettings {
    /// Global salt; empty generates a random salt at start-up.
    pub salt: String,
    /// First hashing key; 0 generates a random key at start-up.
    pub key0: u64,
    /// Second hashing key; 0 generates a random key at start-up.
    pub key1: u64,
    /// Include the calendar day in the fingerprint.
    pub rotate_daily: bool,
}

impl Default for FingerprintSettings {
    fn default() -> Self {
        Self {
            salt: String::new(),
            key0: 0,
            key1: 0,
            rotate_daily: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferrerSettings {
    /// Referrer hosts that are recorded as "no referrer".
    pub domain_blacklist: Vec<String>,
    /// Also match subdomains of blacklisted hosts.
    pub blacklist_includes_subdomains: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSettings {
    /// Drop requests sent with `DNT: 1`.
    pub respect_do_not_track: bool,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            respect_do_not_track: true,
        }
    }
}

impl FootfallConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parses a single TOML document, without layering.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::ParseError {
            origin: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a single TOML file, without layering.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::ParseError {
            origin: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    /// Rejects values that cannot be clamped into something meaningful.
    ///
    /// Out-of-band durations and sizes are not errors; the tracker clamps
    /// them. Blacklist entries must be bare hosts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for entry in &self.referrer.domain_blacklist {
            let entry = entry.trim();
            if entry.is_empty() {
                return Err(ConfigError::ValidationError(
                    "referrer.domain_blacklist contains an empty entry".to_string(),
                ));
            }
            if entry.contains("://") || entry.contains('/') {
                return Err(ConfigError::ValidationError(format!(
                    "referrer.domain_blacklist entry '{entry}' must be a host, not a URL"
                )));
            }
        }

        Ok(())
    }
}
