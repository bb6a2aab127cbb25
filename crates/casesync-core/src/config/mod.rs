//! Engine configuration.
//!
//! `SyncEngineConfig` can come from defaults, the environment or a JSON
//! file. Every source goes through the same range checks.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
const MAX_CHUNK_SIZE: usize = 100_000;
const MAX_PLANNING_TIMEOUT_SECS: u64 = 3_600;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Tuning knobs for planning and the cleanliness cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncEngineConfig {
    /// Case ids fetched per store round trip
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Create cleanliness flags for owners seen for the first time in a change event
    #[serde(default = "default_track_new_owners")]
    pub track_new_owners: bool,
    /// Deadline for one planning run, checked between chunks
    #[serde(default)]
    pub planning_timeout_secs: Option<u64>,
}

const fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

const fn default_track_new_owners() -> bool {
    true
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            track_new_owners: true,
            planning_timeout_secs: None,
        }
    }
}

impl SyncEngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let chunk_size = value_or_default(&lookup, "CASESYNC_CHUNK_SIZE", "1000")
            .parse::<usize>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "CASESYNC_CHUNK_SIZE must be an integer in [1, 100000]".to_string(),
                )
            })?;

        let track_new_owners = parse_bool(&value_or_default(
            &lookup,
            "CASESYNC_TRACK_NEW_OWNERS",
            "true",
        ))
        .ok_or_else(|| {
            ConfigError::Invalid("CASESYNC_TRACK_NEW_OWNERS must be true or false".to_string())
        })?;

        let planning_timeout_secs = optional_trimmed(&lookup, "CASESYNC_PLANNING_TIMEOUT_SECS")
            .map(|value| {
                value.parse::<u64>().map_err(|_| {
                    ConfigError::Invalid(
                        "CASESYNC_PLANNING_TIMEOUT_SECS must be an integer in [1, 3600]"
                            .to_string(),
                    )
                })
            })
            .transpose()?;

        let config = Self {
            chunk_size,
            track_new_owners,
            planning_timeout_secs,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            ConfigError::Invalid(format!("failed to read {}: {error}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|error| {
            ConfigError::Invalid(format!("invalid config {}: {error}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(ConfigError::Invalid(
                "chunk_size must be in [1, 100000]".to_string(),
            ));
        }
        if let Some(timeout) = self.planning_timeout_secs {
            if !(1..=MAX_PLANNING_TIMEOUT_SECS).contains(&timeout) {
                return Err(ConfigError::Invalid(
                    "planning_timeout_secs must be in [1, 3600]".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn planning_timeout(&self) -> Option<Duration> {
        self.planning_timeout_secs.map(Duration::from_secs)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
