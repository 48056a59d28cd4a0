//! API Configuration

use crate::client::HttpClientConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// VPN API client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API root, e.g. `https://api.protonvpn.ch`
    pub base_url: String,
    /// Sent as `x-pm-appversion`
    pub app_version: String,
    pub user_agent: String,
    /// Name the certificate is registered under
    pub device_name: String,
    /// Requested certificate lifetime, e.g. `"30 minutes"`; the API
    /// default applies when unset
    pub certificate_duration: Option<String>,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        let version = env!("CARGO_PKG_VERSION");
        Self {
            base_url: "https://api.protonvpn.ch".to_string(),
            app_version: format!("linux-vpn@{}", version),
            user_agent: format!("certd/{}", version),
            device_name: default_device_name(),
            certificate_duration: None,
            timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "certd".to_string())
}

impl ApiConfig {
    /// Parsed base URL with a trailing slash, so relative joins keep any path prefix
    pub fn base(&self) -> Result<Url, ApiConfigError> {
        let mut raw = self.base_url.clone();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let url = Url::parse(&raw).map_err(|e| ApiConfigError::InvalidBaseUrl(e.to_string()))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ApiConfigError::InvalidBaseUrl(format!(
                "unsupported scheme {}",
                other
            ))),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ApiConfigError> {
        self.base()?;
        if self.timeout_secs == 0 {
            return Err(ApiConfigError::ZeroTimeout);
        }
        if self.device_name.is_empty() {
            return Err(ApiConfigError::EmptyDeviceName);
        }
        Ok(())
    }

    /// Transport settings derived from this config
    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            user_agent: self.user_agent.clone(),
            ..HttpClientConfig::default()
        }
    }
}

/// API configuration errors
#[derive(Debug, Clone, Error)]
pub enum ApiConfigError {
    #[error("Invalid base URL: {0}")]
    InvalidBaseUrl(String),

    #[error("Request timeout must be at least one second")]
    ZeroTimeout,

    #[error("Device name must not be empty")]
    EmptyDeviceName,
}
