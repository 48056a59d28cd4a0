//! Certificate Issuance
//!
//! The network exchange that trades the client public key for a freshly
//! signed certificate. The lifecycle manager only sees this trait; the HTTP
//! implementation lives in `certd-api`.

use crate::certificate::{Certificate, ConnectionFeatures};
use crate::keys::PublicKey;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Obtains new certificates from the issuer
pub trait IssuanceClient: Send + Sync + 'static {
    /// Request a certificate for `public_key`
    ///
    /// No timeout is applied by the caller; the implementation owns it.
    fn refresh(
        &self,
        public_key: PublicKey,
        features: Option<ConnectionFeatures>,
    ) -> impl Future<Output = Result<Certificate, IssuanceError>> + Send;
}

impl<T: IssuanceClient> IssuanceClient for Arc<T> {
    fn refresh(
        &self,
        public_key: PublicKey,
        features: Option<ConnectionFeatures>,
    ) -> impl Future<Output = Result<Certificate, IssuanceError>> + Send {
        (**self).refresh(public_key, features)
    }
}

/// Issuance failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum IssuanceError {
    #[error("No API credentials available")]
    NoCredentials,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        code: Option<i64>,
        message: String,
    },

    #[error("API session expired or missing")]
    SessionExpired,

    #[error("Too many certificate requests")]
    TooManyRequests { retry_after: Option<Duration> },

    #[error("Public key already in use; new keys are needed")]
    KeyConflict,

    #[error("Unreadable issuer response: {0}")]
    Parse(String),
}

impl IssuanceError {
    /// Network or server-side failure, as opposed to a client-side condition
    pub fn is_transport(&self) -> bool {
        match self {
            IssuanceError::Transport(_) => true,
            IssuanceError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
