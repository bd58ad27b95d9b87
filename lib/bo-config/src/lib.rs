// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Buffer Organizer Configuration Library
//!
//! Centralized configuration for the organizer worker pool, the scoring
//! bandwidth range, and the flush drain cadence.
//!
//! Configuration sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. System config file at /etc/strata/bo.toml
//! 3. TOML file from STRATA_BO_CONFIG_PATH environment variable
//! 4. Environment variables (STRATA_BO_* prefixed)

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Configuration error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Top-level buffer organizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = validate_bandwidth_range))]
pub struct BoConfig {
    /// Number of worker tasks draining the two-priority queues.
    #[validate(range(min = 1, max = 256))]
    pub num_worker_threads: usize,

    /// Capacity of each priority queue. Submissions beyond this bound fail
    /// with a queue-full error instead of growing without limit.
    #[validate(range(min = 1))]
    pub queue_capacity: usize,

    /// Convergence tolerance used when an organize request does not supply
    /// its own epsilon.
    #[validate(range(min = 0.000001, exclusive_max = 1.0))]
    pub default_epsilon: f64,

    /// Diagnostic tick for the flush drain loop, in milliseconds.
    #[validate(range(min = 1))]
    pub flush_tick_ms: u64,

    /// Log the outstanding-flush count every N diagnostic ticks.
    #[validate(range(min = 1))]
    pub flush_log_every: u32,

    /// Bandwidth of the slowest device in the hierarchy, in MB/s. Together
    /// with `max_device_bw_mbps` this defines the normalization interval for
    /// blob access scores.
    #[validate(range(min = 0.001))]
    pub min_device_bw_mbps: f32,

    /// Bandwidth of the fastest device in the hierarchy, in MB/s.
    #[validate(range(min = 0.001))]
    pub max_device_bw_mbps: f32,
}

impl Default for BoConfig {
    fn default() -> Self {
        Self {
            num_worker_threads: 4,
            queue_capacity: 1024,
            default_epsilon: 0.05,
            flush_tick_ms: 500,
            flush_log_every: 10,
            min_device_bw_mbps: 100.0,
            max_device_bw_mbps: 6000.0,
        }
    }
}

fn validate_bandwidth_range(config: &BoConfig) -> Result<(), ValidationError> {
    if config.min_device_bw_mbps >= config.max_device_bw_mbps {
        return Err(ValidationError::new("bandwidth_range")
            .with_message("min_device_bw_mbps must be strictly below max_device_bw_mbps".into()));
    }
    Ok(())
}

impl BoConfig {
    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var("STRATA_BO_CONFIG_PATH").unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(BoConfig::default()))
            .merge(Toml::file("/etc/strata/bo.toml"))
            .merge(Toml::file(&config_path))
            // STRATA_BO_NUM_WORKER_THREADS, STRATA_BO_QUEUE_CAPACITY, ...
            .merge(Env::prefixed("STRATA_BO_"))
    }

    /// Load and validate configuration from all sources.
    pub fn load() -> Result<Self, ConfigError> {
        let config: BoConfig = Self::figment().extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = BoConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = BoConfig {
            num_worker_threads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_bandwidth_range_rejected() {
        let config = BoConfig {
            min_device_bw_mbps: 1000.0,
            max_device_bw_mbps: 100.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_epsilon_must_be_below_one() {
        let config = BoConfig {
            default_epsilon: 1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bo.toml");
        std::fs::write(&path, "num_worker_threads = 8\nqueue_capacity = 16\n").unwrap();

        let config: BoConfig = Figment::new()
            .merge(Serialized::defaults(BoConfig::default()))
            .merge(Toml::file(&path))
            .extract()
            .unwrap();

        assert_eq!(config.num_worker_threads, 8);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.flush_log_every, 10);
    }
}
