use std::time::Duration;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Every error this daemon can produce, with a machine-readable [`Error::code`] alongside the
/// human-readable [`std::fmt::Display`] message so the bus can hand callers something more
/// stable than a formatted string.
#[derive(Debug, Error)]
pub enum Error {
    #[error("client id/secret not configured")]
    CredentialsUnset,

    #[error("invalid credentials: client id and secret must be non-empty")]
    InvalidCredentials,

    #[error("no refresh token available, re-authorization required")]
    NoRefreshToken,

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("request was unauthorized")]
    Unauthorized,

    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("failed to decrypt stored data")]
    Decrypt,

    #[error("failed to persist data: {0}")]
    Persist(String),
}

impl Error {
    /// A stable, machine-readable identifier for this error variant, for callers (e.g. a bus
    /// client) that want to branch on error kind without parsing `Display` output.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CredentialsUnset => "credentials_unset",
            Self::InvalidCredentials => "invalid_credentials",
            Self::NoRefreshToken => "no_refresh_token",
            Self::RefreshFailed(_) => "refresh_failed",
            Self::Unauthorized => "unauthorized",
            Self::Upstream { .. } => "upstream_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout => "timeout",
            Self::Network(_) => "network_error",
            Self::Decrypt => "decrypt_failed",
            Self::Persist(_) => "persist_failed",
        }
    }

    /// True for transport failures that the HTTP client's retry loop should treat as
    /// transient (5xx, network-level failures); used so call sites don't need to duplicate
    /// the classification.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
            || matches!(self, Self::Upstream { status, .. } if *status >= 500)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Persist(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Persist(err.to_string())
    }
}

impl From<aes_gcm::Error> for Error {
    fn from(_: aes_gcm::Error) -> Self {
        Self::Decrypt
    }
}
