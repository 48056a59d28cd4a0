//! Certificate Model
//!
//! A short-lived client certificate as returned by the issuer, and the
//! connection features it was issued for.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Signed client certificate and its validity window
///
/// Instances are never mutated; a successful issuance supersedes the stored
/// value as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// Signed credential (PEM as delivered by the issuer)
    pub certificate: String,
    /// After this instant the certificate can no longer authenticate the tunnel
    #[serde(with = "chrono::serde::ts_seconds")]
    pub valid_until: DateTime<Utc>,
    /// Issuer-chosen instant at which renewal should start
    #[serde(with = "chrono::serde::ts_seconds")]
    pub refresh_time: DateTime<Utc>,
}

impl Certificate {
    /// Create a certificate, enforcing `refresh_time <= valid_until`
    pub fn new(
        certificate: impl Into<String>,
        valid_until: DateTime<Utc>,
        refresh_time: DateTime<Utc>,
    ) -> Self {
        Self {
            certificate: certificate.into(),
            valid_until,
            refresh_time: refresh_time.min(valid_until),
        }
    }

    /// Renewal instant pulled forward by `earlier_by`, saturating at the
    /// earliest representable instant
    pub fn refresh_deadline(&self, earlier_by: Duration) -> DateTime<Utc> {
        self.refresh_time
            .checked_sub_signed(earlier_by)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Past the margin-adjusted refresh time
    pub fn needs_refresh_at(&self, now: DateTime<Utc>, earlier_by: Duration) -> bool {
        self.refresh_deadline(earlier_by) <= now
    }
}

/// NetShield filtering level requested for the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetShieldLevel {
    #[default]
    Off,
    Level1,
    Level2,
}

impl NetShieldLevel {
    /// Numeric value used on the wire
    pub fn as_u8(&self) -> u8 {
        match self {
            NetShieldLevel::Off => 0,
            NetShieldLevel::Level1 => 1,
            NetShieldLevel::Level2 => 2,
        }
    }
}

/// NAT behaviour requested for the session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    #[default]
    StrictNat,
    ModerateNat,
}

/// Connection features baked into a certificate
///
/// Changing any of these requires a new certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionFeatures {
    #[serde(default)]
    pub netshield: NetShieldLevel,
    #[serde(default = "default_true")]
    pub vpn_accelerator: bool,
    #[serde(default)]
    pub bouncing: Option<String>,
    #[serde(default)]
    pub nat_type: NatType,
    #[serde(default)]
    pub safe_mode: Option<bool>,
}

fn default_true() -> bool {
    true
}

impl Default for ConnectionFeatures {
    fn default() -> Self {
        Self {
            netshield: NetShieldLevel::Off,
            vpn_accelerator: true,
            bouncing: None,
            nat_type: NatType::StrictNat,
            safe_mode: None,
        }
    }
}

/// Certificate persisted together with the features it was requested for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateWithFeatures {
    pub certificate: Certificate,
    #[serde(default)]
    pub features: Option<ConnectionFeatures>,
}
