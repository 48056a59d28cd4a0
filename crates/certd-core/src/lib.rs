//! certd core - Client Certificate Lifecycle
//!
//! Keeps a short-lived, server-issued client certificate valid for a VPN
//! client. The certificate binds the client's long-lived public key to the
//! account session and is presented when the tunnel connects.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  CertificateRefreshManager                │
//! │                                                          │
//! │  ┌──────────────┐   fire    ┌──────────────────────────┐ │
//! │  │ Refresh      │─────────▶│ re-check store            │ │
//! │  │ Scheduler    │◀─────────│ refresh / retry (Backoff) │ │
//! │  └──────────────┘  re-arm   └──────┬────────────┬──────┘ │
//! │                                    │            │        │
//! └────────────────────────────────────│────────────│────────┘
//!                                      ▼            ▼
//!                          ┌────────────────┐  ┌──────────────────┐
//!                          │ Certificate    │  │ Issuance client  │
//!                          │ Store (shared) │  │ (certd-api)      │
//!                          └────────────────┘  └──────────────────┘
//! ```
//!
//! # Features
//!
//! - **Safety margin**: refreshes ahead of the issuer's refresh time
//! - **Wall-clock timer**: fires promptly after the device wakes from sleep
//! - **Exponential backoff**: failed refreshes retry at 2x, 4x, 8x the seed
//! - **Shared store**: the app and the tunnel process see each other's refreshes

mod backoff;
mod certificate;
mod clock;
mod config;
mod issuance;
mod keys;
mod manager;
mod scheduler;
mod store;

pub use backoff::Backoff;
pub use certificate::{
    Certificate, CertificateWithFeatures, ConnectionFeatures, NatType, NetShieldLevel,
};
pub use clock::{Clock, SystemClock};
pub use config::{ConfigError, RefreshConfig};
pub use issuance::{IssuanceClient, IssuanceError};
pub use keys::{KeyError, KeyPair, PrivateKey, PublicKey, WireGuardKey};
pub use manager::{CertificateRefreshManager, RefreshError, RefreshState};
pub use scheduler::RefreshScheduler;
pub use store::{CertificateStore, FileStore, MemoryStore, StoreError};
