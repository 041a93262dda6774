//! Registry configuration.
//!
//! `MAX_CLASSES` and `HANDLE_BITS` are fixed at build time (see
//! [`crate::handle`]); everything tunable at init time lives here.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The bucket count must be a non-zero power of two.
    #[error("lfht_buckets must be a non-zero power of two, got {0}")]
    InvalidBucketCount(usize),

    /// The JSON document could not be parsed.
    #[error("malformed registry configuration: {0}")]
    Parse(String),
}

/// Init-time options of a [`crate::Registry`].
///
/// # Examples
///
/// ```rust
/// use idreg::RegistryConfig;
///
/// let config = RegistryConfig {
///     max_desired_rec_fl_len: 64,
///     dump_stats_on_shutdown: true,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Soft cap on the record free-list length.
    ///
    /// Reallocable records beyond this are returned to the heap by the
    /// maintenance pass.
    pub max_desired_rec_fl_len: usize,

    /// Soft cap on the class-descriptor free-list length.
    pub max_desired_class_fl_len: usize,

    /// Emit a statistics snapshot (at `info`) when the registry drops.
    pub dump_stats_on_shutdown: bool,

    /// Permit the slow-path scan that reuses released class indices once
    /// the monotonic fast-path counter is exhausted.
    pub recycle_class_ids: bool,

    /// Number of buckets in each class's hash table. Power of two.
    pub lfht_buckets: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_desired_rec_fl_len: 1024,
            max_desired_class_fl_len: 16,
            dump_stats_on_shutdown: false,
            recycle_class_ids: true,
            lfht_buckets: 256,
        }
    }
}

impl RegistryConfig {
    /// Checks the options for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lfht_buckets == 0 || !self.lfht_buckets.is_power_of_two() {
            return Err(ConfigError::InvalidBucketCount(self.lfht_buckets));
        }
        Ok(())
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration from `IDREG_*` environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse("IDREG_MAX_REC_FL_LEN") {
            config.max_desired_rec_fl_len = v;
        }
        if let Some(v) = env_parse("IDREG_MAX_CLASS_FL_LEN") {
            config.max_desired_class_fl_len = v;
        }
        if let Some(v) = env_flag("IDREG_DUMP_STATS") {
            config.dump_stats_on_shutdown = v;
        }
        if let Some(v) = env_flag("IDREG_RECYCLE_CLASS_IDS") {
            config.recycle_class_ids = v;
        }
        if let Some(v) = env_parse::<usize>("IDREG_LFHT_BUCKETS") {
            if v.is_power_of_two() {
                config.lfht_buckets = v;
            } else {
                tracing::warn!(value = v, "ignoring IDREG_LFHT_BUCKETS: not a power of two");
            }
        }

        config
    }
}

fn env_parse<T: core::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(RegistryConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_odd_bucket_counts() {
        let config = RegistryConfig { lfht_buckets: 100, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::InvalidBucketCount(100)));
        let config = RegistryConfig { lfht_buckets: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_fills_defaults() {
        let config = RegistryConfig::from_json(r#"{ "lfht_buckets": 64 }"#).unwrap();
        assert_eq!(config.lfht_buckets, 64);
        assert_eq!(config.max_desired_rec_fl_len, 1024);
        assert!(RegistryConfig::from_json(r#"{ "lfht_buckets": 3 }"#).is_err());
        assert!(matches!(RegistryConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }
}
