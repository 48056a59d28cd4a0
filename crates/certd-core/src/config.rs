//! Refresh Configuration
//!
//! Timing knobs for the lifecycle manager. All values are whole seconds in
//! the config file.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest accepted refresh margin (one day)
pub const MAX_REFRESH_EARLIER_BY_SECS: u64 = 24 * 60 * 60;

/// Lifecycle manager timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Refresh this long before the issuer's refresh time, so the app and
    /// the tunnel process are less likely to refresh at the same moment
    pub refresh_earlier_by_secs: u64,
    /// First retry delay is twice this value
    pub backoff_seed_secs: u64,
    /// A refresh running longer than this is presumed stuck
    pub refresh_timeout_secs: u64,
    /// Longest single timer sleep before the wall clock is read again
    pub max_tick_secs: u64,
}

impl RefreshConfig {
    pub fn refresh_earlier_by(&self) -> Duration {
        Duration::from_secs(self.refresh_earlier_by_secs)
    }

    pub fn backoff_seed(&self) -> Duration {
        Duration::from_secs(self.backoff_seed_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn max_tick(&self) -> Duration {
        Duration::from_secs(self.max_tick_secs)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_earlier_by_secs > MAX_REFRESH_EARLIER_BY_SECS {
            return Err(ConfigError::MarginTooLarge(self.refresh_earlier_by_secs));
        }
        if self.backoff_seed_secs == 0 {
            return Err(ConfigError::ZeroBackoffSeed);
        }
        if self.max_tick_secs == 0 {
            return Err(ConfigError::ZeroTick);
        }
        Ok(())
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            refresh_earlier_by_secs: 60,
            backoff_seed_secs: 10,
            refresh_timeout_secs: 3 * 60,
            max_tick_secs: 60,
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Backoff seed must be at least one second")]
    ZeroBackoffSeed,

    #[error("Timer tick must be at least one second")]
    ZeroTick,

    #[error("Refresh margin of {0}s exceeds one day")]
    MarginTooLarge(u64),

    #[error("Failed to parse config: {0}")]
    ParseError(String),
}
