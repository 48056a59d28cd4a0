//! Agent Configuration
//!
//! One file (TOML, or JSON by extension) holding the store location, API
//! settings, refresh timing, and the connection features to request.

use anyhow::{Context, Result};
use certd_api::ApiConfig;
use certd_core::{ConnectionFeatures, RefreshConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "CERTD_CONFIG";

/// Where keys and the certificate are kept
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory shared with the tunnel process
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/certd"),
        }
    }
}

/// Agent configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub store: StoreConfig,
    pub api: ApiConfig,
    pub refresh: RefreshConfig,
    /// API session file; `credentials.json` in the store directory if unset
    pub credentials_path: Option<PathBuf>,
    /// Features to request; when unset the stored ones are kept
    pub features: Option<ConnectionFeatures>,
}

impl AgentConfig {
    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse TOML config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content).context("Failed to parse JSON config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from file, JSON if the extension says so, TOML otherwise
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        };
        config.with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Config path from the first argument, else `CERTD_CONFIG`
    pub fn locate(args: &[String]) -> Option<PathBuf> {
        args.get(1)
            .map(PathBuf::from)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.refresh.validate().context("Invalid [refresh] section")?;
        self.api.validate().context("Invalid [api] section")?;
        Ok(())
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.credentials_path
            .clone()
            .unwrap_or_else(|| self.store.dir.join("credentials.json"))
    }
}
