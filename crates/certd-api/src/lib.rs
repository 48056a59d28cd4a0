//! certd API - Certificate Issuance over HTTPS
//!
//! Talks to the VPN API on behalf of the certificate lifecycle manager.
//!
//! Flow:
//! 1. Build `POST vpn/v1/certificate` with the client public key (PEM) and
//!    the requested connection features
//! 2. Authenticate with the stored session (`Authorization`, `x-pm-uid`)
//! 3. On 401, rotate the access token through `auth/refresh` once, persist
//!    it, and repeat the request
//! 4. Map the response onto a `Certificate` or an `IssuanceError`

mod certificate_api;
mod client;
mod config;
mod credentials;

#[cfg(test)]
mod test_server;

pub use certificate_api::{ApiError, ApiIssuanceClient};
pub use client::{HttpClient, HttpClientConfig, HttpError, Response};
pub use config::{ApiConfig, ApiConfigError};
pub use credentials::{AuthCredentials, CredentialsError, CredentialsFile};
