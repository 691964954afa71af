//! Configuration types for pmdedup
//!
//! All sections deserialize with defaults so a partial document (or an
//! empty one) yields a usable configuration.

use crate::error::{Error, Result};
use crate::types::DedupMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the deduplication engine
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Number of metadata entries (0 = one per device block)
    pub num_entries: u64,
    /// log2 of the bucket count of each fingerprint table
    pub index_bucket_bits: u32,
    /// Number of striped locks for entries and for index buckets
    pub lock_pool_size: usize,
    /// Mode controller configuration
    pub mode: ModeConfig,
    /// Background finalizer configuration
    pub finalizer: FinalizerConfig,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            num_entries: 0,
            index_bucket_bits: 16,
            lock_pool_size: 64,
            mode: ModeConfig::default(),
            finalizer: FinalizerConfig::default(),
        }
    }
}

impl DedupConfig {
    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(1..=24).contains(&self.index_bucket_bits) {
            return Err(Error::configuration(format!(
                "index_bucket_bits must be in 1..=24, got {}",
                self.index_bucket_bits
            )));
        }
        if self.lock_pool_size == 0 {
            return Err(Error::configuration("lock_pool_size must be positive"));
        }
        self.mode.validate()
    }

    /// Resolve the entry count against a device capacity
    #[must_use]
    pub const fn entries_for(&self, device_capacity: u64) -> u64 {
        if self.num_entries == 0 {
            device_capacity
        } else {
            self.num_entries
        }
    }
}

/// Adaptive mode controller configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    /// Recompute the mode from the observed duplicates (false = pinned)
    pub adaptive: bool,
    /// Mode used until the first window completes
    pub initial_mode: DedupMode,
    /// Number of submitted blocks per sampling window
    pub window_size: u64,
    /// Duplicates per window above which every block is strongly fingerprinted
    pub high_threshold: u64,
    /// Duplicates per window above which the weak pre-filter is used
    pub low_threshold: u64,
    /// Probability of choosing no-fingerprint when duplication is rare
    pub explore_probability: f64,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            adaptive: true,
            initial_mode: DedupMode::WeakThenStrong,
            window_size: 1000,
            high_threshold: 500,
            low_threshold: 100,
            explore_probability: 0.5,
        }
    }
}

impl ModeConfig {
    /// Configuration that never leaves `mode`
    #[must_use]
    pub fn pinned(mode: DedupMode) -> Self {
        Self {
            adaptive: false,
            initial_mode: mode,
            ..Default::default()
        }
    }

    /// Check window and threshold consistency
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::configuration("mode window_size must be positive"));
        }
        if self.low_threshold > self.high_threshold {
            return Err(Error::configuration(format!(
                "mode low_threshold {} exceeds high_threshold {}",
                self.low_threshold, self.high_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.explore_probability) {
            return Err(Error::configuration(format!(
                "mode explore_probability must be in [0, 1], got {}",
                self.explore_probability
            )));
        }
        Ok(())
    }
}

/// Background finalizer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizerConfig {
    /// Start the finalizer thread when the engine is created
    pub enabled: bool,
    /// Periodic wake-up interval in milliseconds
    pub interval_ms: u64,
}

impl Default for FinalizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5_000,
        }
    }
}

impl FinalizerConfig {
    /// Periodic wake-up interval
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DedupConfig::default();
        config.validate().unwrap();
        assert_eq!(config.entries_for(128), 128);
        assert_eq!(config.mode.initial_mode, DedupMode::WeakThenStrong);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: DedupConfig = serde_json::from_str(
            r#"{
                "index_bucket_bits": 10,
                "mode": { "initial_mode": "strong_first", "window_size": 100 },
                "finalizer": { "enabled": false }
            }"#,
        )
        .unwrap();

        assert_eq!(config.index_bucket_bits, 10);
        assert_eq!(config.lock_pool_size, 64);
        assert_eq!(config.mode.initial_mode, DedupMode::StrongFirst);
        assert_eq!(config.mode.window_size, 100);
        assert_eq!(config.mode.high_threshold, 500);
        assert!(!config.finalizer.enabled);
        assert_eq!(config.finalizer.interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = DedupConfig {
            index_bucket_bits: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        config.index_bucket_bits = 12;
        config.lock_pool_size = 0;
        assert!(config.validate().is_err());

        config.lock_pool_size = 8;
        config.mode.low_threshold = 900;
        assert!(config.validate().is_err());

        config.mode.low_threshold = 10;
        config.mode.explore_probability = 1.5;
        assert!(config.validate().is_err());

        config.mode.explore_probability = 1.0;
        config.validate().unwrap();
    }

    #[test]
    fn test_pinned_mode() {
        let mode = ModeConfig::pinned(DedupMode::NoFingerprint);
        assert!(!mode.adaptive);
        assert_eq!(mode.initial_mode, DedupMode::NoFingerprint);
        mode.validate().unwrap();
    }
}
