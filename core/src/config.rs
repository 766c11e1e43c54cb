//! Daemon configuration.
//!
//! [`DaemonSettings`] tunes high-water detection, shard passes and update
//! batch paging. Settings come from code (builder methods), from serde
//! (any format) or from `FOLDLINE_*` environment variables.
//!
//! # Example
//!
//! ```
//! use foldline_core::config::DaemonSettings;
//! use std::time::Duration;
//!
//! let settings = DaemonSettings::default()
//!     .with_update_batch_size(250)
//!     .with_safe_zone(Duration::from_secs(5));
//!
//! assert!(settings.validate().is_ok());
//! assert_eq!(settings.safe_zone(), Duration::from_secs(5));
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Largest accepted [`DaemonSettings::update_batch_size`].
pub const MAX_UPDATE_BATCH_SIZE: usize = 100_000;

/// Environment variable overriding [`DaemonSettings::update_batch_size`].
pub const ENV_UPDATE_BATCH_SIZE: &str = "FOLDLINE_UPDATE_BATCH_SIZE";
/// Environment variable overriding the safe zone, in milliseconds.
pub const ENV_SAFE_ZONE_MS: &str = "FOLDLINE_SAFE_ZONE_MS";
/// Environment variable overriding [`DaemonSettings::scan_page_size`].
pub const ENV_SCAN_PAGE_SIZE: &str = "FOLDLINE_SCAN_PAGE_SIZE";
/// Environment variable overriding [`DaemonSettings::shard_batch_size`].
pub const ENV_SHARD_BATCH_SIZE: &str = "FOLDLINE_SHARD_BATCH_SIZE";
/// Environment variable overriding the fetching cooldown, in milliseconds.
pub const ENV_FETCHING_COOLDOWN_MS: &str = "FOLDLINE_FETCHING_COOLDOWN_MS";
/// Environment variable overriding [`DaemonSettings::max_slice_parallelism`].
pub const ENV_MAX_SLICE_PARALLELISM: &str = "FOLDLINE_MAX_SLICE_PARALLELISM";

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable was set but could not be parsed.
    #[error("Failed to parse {key}: {reason}")]
    Parse {
        /// Variable name.
        key: String,
        /// Parser message.
        reason: String,
    },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Settings shared by every shard of a daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Maximum operations per page.
    pub update_batch_size: usize,
    /// Trailing window in which gaps are presumed in flight, in milliseconds.
    pub safe_zone_ms: u64,
    /// Sequences read per high-water scan page.
    pub scan_page_size: usize,
    /// Maximum events fetched per shard pass.
    pub shard_batch_size: u64,
    /// Idle delay between shard passes when nothing is new, in milliseconds.
    pub fetching_cooldown_ms: u64,
    /// Slices folded concurrently within one pass.
    pub max_slice_parallelism: usize,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            update_batch_size: 500,
            safe_zone_ms: 3_000,
            scan_page_size: 1_000,
            shard_batch_size: 500,
            fetching_cooldown_ms: 500,
            max_slice_parallelism: 8,
        }
    }
}

impl DaemonSettings {
    /// Load settings from `FOLDLINE_*` environment variables, falling back to
    /// defaults for unset ones.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable does not parse or the result fails
    /// validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through `lookup`, which maps a variable name to its value.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a value does not parse or the result fails
    /// validation.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let settings = Self {
            update_batch_size: parse_or(&lookup, ENV_UPDATE_BATCH_SIZE, defaults.update_batch_size)?,
            safe_zone_ms: parse_or(&lookup, ENV_SAFE_ZONE_MS, defaults.safe_zone_ms)?,
            scan_page_size: parse_or(&lookup, ENV_SCAN_PAGE_SIZE, defaults.scan_page_size)?,
            shard_batch_size: parse_or(&lookup, ENV_SHARD_BATCH_SIZE, defaults.shard_batch_size)?,
            fetching_cooldown_ms: parse_or(
                &lookup,
                ENV_FETCHING_COOLDOWN_MS,
                defaults.fetching_cooldown_ms,
            )?,
            max_slice_parallelism: parse_or(
                &lookup,
                ENV_MAX_SLICE_PARALLELISM,
                defaults.max_slice_parallelism,
            )?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` if a size or parallelism is zero, or
    /// if `update_batch_size` exceeds [`MAX_UPDATE_BATCH_SIZE`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.update_batch_size == 0 {
            return Err(ConfigError::Validation(
                "update_batch_size must be > 0".to_string(),
            ));
        }
        if self.update_batch_size > MAX_UPDATE_BATCH_SIZE {
            return Err(ConfigError::Validation(format!(
                "update_batch_size must be <= {MAX_UPDATE_BATCH_SIZE}"
            )));
        }
        if self.scan_page_size == 0 {
            return Err(ConfigError::Validation(
                "scan_page_size must be > 0".to_string(),
            ));
        }
        if self.shard_batch_size == 0 {
            return Err(ConfigError::Validation(
                "shard_batch_size must be > 0".to_string(),
            ));
        }
        if self.max_slice_parallelism == 0 {
            return Err(ConfigError::Validation(
                "max_slice_parallelism must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Safe zone as a `Duration`.
    #[must_use]
    pub const fn safe_zone(&self) -> Duration {
        Duration::from_millis(self.safe_zone_ms)
    }

    /// Fetching cooldown as a `Duration`.
    #[must_use]
    pub const fn fetching_cooldown(&self) -> Duration {
        Duration::from_millis(self.fetching_cooldown_ms)
    }

    /// Set the page size.
    #[must_use]
    pub const fn with_update_batch_size(mut self, size: usize) -> Self {
        self.update_batch_size = size;
        self
    }

    /// Set the safe zone.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Durations beyond u64 milliseconds are not meaningful here
    pub const fn with_safe_zone(mut self, safe_zone: Duration) -> Self {
        self.safe_zone_ms = safe_zone.as_millis() as u64;
        self
    }

    /// Set the high-water scan page size.
    #[must_use]
    pub const fn with_scan_page_size(mut self, size: usize) -> Self {
        self.scan_page_size = size;
        self
    }

    /// Set the maximum events per shard pass.
    #[must_use]
    pub const fn with_shard_batch_size(mut self, size: u64) -> Self {
        self.shard_batch_size = size;
        self
    }

    /// Set the idle cooldown between passes.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // Durations beyond u64 milliseconds are not meaningful here
    pub const fn with_fetching_cooldown(mut self, cooldown: Duration) -> Self {
        self.fetching_cooldown_ms = cooldown.as_millis() as u64;
        self
    }

    /// Set the fold parallelism.
    #[must_use]
    pub const fn with_max_slice_parallelism(mut self, parallelism: usize) -> Self {
        self.max_slice_parallelism = parallelism;
        self
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Parse {
            key: key.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let settings = DaemonSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.update_batch_size, 500);
        assert_eq!(settings.safe_zone(), Duration::from_secs(3));
        assert_eq!(settings.fetching_cooldown(), Duration::from_millis(500));
    }

    #[test]
    fn lookup_overrides_defaults() {
        let settings = DaemonSettings::from_lookup(lookup_from(&[
            (ENV_UPDATE_BATCH_SIZE, "25"),
            (ENV_SAFE_ZONE_MS, " 1500 "),
        ]))
        .unwrap();

        assert_eq!(settings.update_batch_size, 25);
        assert_eq!(settings.safe_zone(), Duration::from_millis(1500));
        assert_eq!(settings.scan_page_size, 1_000);
    }

    #[test]
    fn unparsable_value_names_the_variable() {
        let err =
            DaemonSettings::from_lookup(lookup_from(&[(ENV_SCAN_PAGE_SIZE, "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { ref key, .. } if key == ENV_SCAN_PAGE_SIZE));
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let err = DaemonSettings::from_lookup(lookup_from(&[(ENV_UPDATE_BATCH_SIZE, "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn oversized_page_size_is_rejected() {
        let settings = DaemonSettings::default().with_update_batch_size(usize::MAX);
        assert!(matches!(settings.validate(), Err(ConfigError::Validation(_))));

        let largest = DaemonSettings::default().with_update_batch_size(MAX_UPDATE_BATCH_SIZE);
        assert!(largest.validate().is_ok());
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: DaemonSettings =
            serde_json::from_str(r#"{ "shard_batch_size": 50 }"#).unwrap();
        assert_eq!(settings.shard_batch_size, 50);
        assert_eq!(settings.update_batch_size, 500);
    }
}
