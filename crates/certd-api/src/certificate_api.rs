//! Certificate Issuance over the VPN API
//!
//! `POST vpn/v1/certificate` trades the client public key for a signed
//! session certificate. A rejected access token (401) is rotated once via
//! `POST auth/refresh` and the request repeated; anything else is mapped
//! onto [`IssuanceError`] for the lifecycle manager.

use crate::client::{HttpClient, HttpError, Response};
use crate::config::{ApiConfig, ApiConfigError};
use crate::credentials::{AuthCredentials, CredentialsError, CredentialsFile};
use certd_core::{
    Certificate, ConnectionFeatures, IssuanceClient, IssuanceError, NatType, PublicKey,
};
use chrono::{DateTime, Utc};
use hyper::StatusCode;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const CERTIFICATE_ENDPOINT: &str = "vpn/v1/certificate";
const TOKEN_REFRESH_ENDPOINT: &str = "auth/refresh";
const API_VERSION: &str = "3";
const ACCEPT: &str = "application/vnd.protonmail.v1+json";
/// API code for a refresh token the server no longer accepts
const CODE_INVALID_REFRESH_TOKEN: i64 = 10013;

/// Client construction errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid API configuration: {0}")]
    Config(#[from] ApiConfigError),

    #[error("Credentials error: {0}")]
    Credentials(#[from] CredentialsError),
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CertificateRequest<'a> {
    client_public_key: String,
    client_public_key_mode: &'a str,
    device_name: &'a str,
    mode: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    features: Option<FeaturesBody<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct FeaturesBody<'a> {
    net_shield_level: u8,
    #[serde(rename = "SplitTCP")]
    split_tcp: bool,
    #[serde(rename = "RandomNAT")]
    random_nat: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    bouncing: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    safe_mode: Option<bool>,
}

impl<'a> From<&'a ConnectionFeatures> for FeaturesBody<'a> {
    fn from(features: &'a ConnectionFeatures) -> Self {
        Self {
            net_shield_level: features.netshield.as_u8(),
            split_tcp: features.vpn_accelerator,
            random_nat: features.nat_type == NatType::StrictNat,
            bouncing: features.bouncing.as_deref(),
            safe_mode: features.safe_mode,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CertificateResponse {
    certificate: String,
    expiration_time: i64,
    refresh_time: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct TokenRefreshRequest<'a> {
    response_type: &'a str,
    grant_type: &'a str,
    refresh_token: &'a str,
    #[serde(rename = "RedirectURI")]
    redirect_uri: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TokenRefreshResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    error: Option<String>,
}

/// Issuance client backed by the VPN API
pub struct ApiIssuanceClient {
    http: HttpClient,
    config: ApiConfig,
    certificate_url: String,
    token_url: String,
    credentials: Mutex<Option<AuthCredentials>>,
    credentials_file: Option<CredentialsFile>,
}

impl ApiIssuanceClient {
    /// Create a client with in-memory credentials
    pub fn new(config: ApiConfig, credentials: Option<AuthCredentials>) -> Result<Self, ApiError> {
        config.validate()?;
        let base = config.base()?;
        let endpoint = |path: &str| {
            base.join(path)
                .map(|url| url.to_string())
                .map_err(|e| ApiConfigError::InvalidBaseUrl(e.to_string()))
        };

        let certificate_url = endpoint(CERTIFICATE_ENDPOINT)?;
        let token_url = endpoint(TOKEN_REFRESH_ENDPOINT)?;

        info!("VPN API client for {}", config.base_url);

        Ok(Self {
            http: HttpClient::new(config.http_config()),
            config,
            certificate_url,
            token_url,
            credentials: Mutex::new(credentials),
            credentials_file: None,
        })
    }

    /// Create a client whose session lives in `file`; rotated tokens are written back
    pub fn with_credentials_file(config: ApiConfig, file: CredentialsFile) -> Result<Self, ApiError> {
        let credentials = file.load()?;
        if credentials.is_none() {
            warn!(
                "No API credentials at {}; certificate requests will fail until a session is stored",
                file.path().display()
            );
        }

        let mut client = Self::new(config, credentials)?;
        client.credentials_file = Some(file);
        Ok(client)
    }

    /// Current session
    pub fn credentials(&self) -> Option<AuthCredentials> {
        self.lock_credentials().clone()
    }

    /// Replace the session (e.g. after a new login)
    pub fn set_credentials(&self, credentials: Option<AuthCredentials>) {
        *self.lock_credentials() = credentials;
    }

    fn lock_credentials(&self) -> MutexGuard<'_, Option<AuthCredentials>> {
        self.credentials
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn base_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("x-pm-appversion", self.config.app_version.clone()),
            ("x-pm-apiversion", API_VERSION.to_string()),
            ("content-type", "application/json".to_string()),
            ("accept", ACCEPT.to_string()),
        ]
    }

    fn request_body(
        &self,
        public_key: &PublicKey,
        features: Option<&ConnectionFeatures>,
    ) -> Result<Vec<u8>, IssuanceError> {
        let pem = public_key
            .to_pem()
            .map_err(|e| IssuanceError::Parse(format!("cannot encode public key: {}", e)))?;

        let request = CertificateRequest {
            client_public_key: pem,
            client_public_key_mode: "EC",
            device_name: &self.config.device_name,
            mode: "session",
            duration: self.config.certificate_duration.as_deref(),
            features: features.map(FeaturesBody::from),
        };

        serde_json::to_vec(&request).map_err(|e| IssuanceError::Parse(e.to_string()))
    }

    async fn post_certificate(
        &self,
        credentials: &AuthCredentials,
        body: &[u8],
    ) -> Result<Response, IssuanceError> {
        let mut headers = self.base_headers();
        headers.push(("authorization", format!("Bearer {}", credentials.access_token)));
        headers.push(("x-pm-uid", credentials.uid.clone()));

        self.http
            .post_json(&self.certificate_url, &headers, body.to_vec())
            .await
            .map_err(transport_error)
    }

    /// Rotate the access token, store the new pair, and return it
    async fn refresh_token(
        &self,
        credentials: &AuthCredentials,
    ) -> Result<AuthCredentials, IssuanceError> {
        debug!("Will try to refresh API token");

        let body = serde_json::to_vec(&TokenRefreshRequest {
            response_type: "token",
            grant_type: "refresh_token",
            refresh_token: &credentials.refresh_token,
            redirect_uri: "http://protonmail.ch",
        })
        .map_err(|e| IssuanceError::Parse(e.to_string()))?;

        // Session header only; the access token is the thing being replaced
        let mut headers = self.base_headers();
        headers.push(("x-pm-uid", credentials.uid.clone()));

        let response = self
            .http
            .post_json(&self.token_url, &headers, body)
            .await
            .map_err(transport_error)?;

        if response.status != StatusCode::OK {
            let err = error_from_response(&response);
            error!("API token refresh failed: {}", err);
            return Err(match err {
                IssuanceError::Http { status, .. } if (400..500).contains(&status) => {
                    IssuanceError::SessionExpired
                }
                other => other,
            });
        }

        let parsed: TokenRefreshResponse = serde_json::from_slice(&response.body)
            .map_err(|e| IssuanceError::Parse(format!("token refresh response: {}", e)))?;

        let expires_at = parsed
            .expires_in
            .and_then(chrono::Duration::try_seconds)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime));
        let updated = credentials.with_tokens(parsed.access_token, parsed.refresh_token, expires_at);

        self.set_credentials(Some(updated.clone()));
        if let Some(file) = &self.credentials_file {
            if let Err(e) = file.save(&updated) {
                warn!("API token refreshed but could not be saved: {}", e);
            }
        }

        info!("API token updated");
        Ok(updated)
    }

    async fn issue(
        &self,
        public_key: PublicKey,
        features: Option<ConnectionFeatures>,
    ) -> Result<Certificate, IssuanceError> {
        let Some(credentials) = self.credentials() else {
            info!("No API credentials available. Won't refresh certificate.");
            return Err(IssuanceError::NoCredentials);
        };

        let body = self.request_body(&public_key, features.as_ref())?;
        let mut response = self.post_certificate(&credentials, &body).await?;

        if response.status == StatusCode::UNAUTHORIZED {
            let refreshed = self.refresh_token(&credentials).await?;
            response = self.post_certificate(&refreshed, &body).await?;

            if response.status == StatusCode::UNAUTHORIZED {
                error!("Certificate request rejected after token refresh");
                return Err(IssuanceError::SessionExpired);
            }
        }

        if !response.is_success() {
            let err = error_from_response(&response);
            error!("Error refreshing certificate: {}", err);
            return Err(err);
        }

        let certificate = parse_certificate(&response.body)?;
        info!("Response cert is valid until: {}", certificate.valid_until);
        Ok(certificate)
    }
}

impl IssuanceClient for ApiIssuanceClient {
    fn refresh(
        &self,
        public_key: PublicKey,
        features: Option<ConnectionFeatures>,
    ) -> impl Future<Output = Result<Certificate, IssuanceError>> + Send {
        self.issue(public_key, features)
    }
}

fn transport_error(e: HttpError) -> IssuanceError {
    IssuanceError::Transport(e.to_string())
}

fn parse_certificate(body: &[u8]) -> Result<Certificate, IssuanceError> {
    let parsed: CertificateResponse = serde_json::from_slice(body).map_err(|e| {
        error!(
            "Can't parse response JSON: {} ({})",
            e,
            String::from_utf8_lossy(body)
        );
        IssuanceError::Parse(e.to_string())
    })?;

    let timestamp = |secs: i64, field: &str| {
        DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| IssuanceError::Parse(format!("{} out of range: {}", field, secs)))
    };

    Ok(Certificate::new(
        parsed.certificate,
        timestamp(parsed.expiration_time, "ExpirationTime")?,
        timestamp(parsed.refresh_time, "RefreshTime")?,
    ))
}

fn error_from_response(response: &Response) -> IssuanceError {
    let body: ApiErrorBody = serde_json::from_slice(&response.body).unwrap_or_default();

    match response.status {
        StatusCode::UNAUTHORIZED => IssuanceError::SessionExpired,
        StatusCode::CONFLICT => IssuanceError::KeyConflict,
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response
                .header("retry-after")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            IssuanceError::TooManyRequests { retry_after }
        }
        StatusCode::UNPROCESSABLE_ENTITY if body.code == Some(CODE_INVALID_REFRESH_TOKEN) => {
            IssuanceError::SessionExpired
        }
        status => IssuanceError::Http {
            status: status.as_u16(),
            code: body.code,
            message: body
                .error
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string()),
        },
    }
}
