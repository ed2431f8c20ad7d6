//! Validation errors
//!
//! Messages here are for logs and the educational flow display. The bearer
//! boundary never forwards them to the token presenter.

use common::FailureKind;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("algorithm not allowed: {0}")]
    UnsupportedAlgorithm(String),

    #[error("key set unavailable for {issuer}: {reason}")]
    KeySetUnavailable { issuer: String, reason: String },

    #[error("no key matching kid {kid:?} for {issuer}")]
    KeyNotFound { issuer: String, kid: Option<String> },

    #[error("signature verification failed: {0}")]
    InvalidSignature(String),

    #[error("token expired at {exp}")]
    Expired { exp: i64 },

    #[error("token not valid before {nbf}")]
    NotYetValid { nbf: i64 },

    #[error("issuer {actual:?} does not match expected issuer")]
    InvalidIssuer { actual: Option<String> },

    #[error("audience does not include the expected audience")]
    InvalidAudience,

    #[error("missing required scope(s): {}", .missing.join(" "))]
    InsufficientScope { missing: Vec<String> },

    #[error("timed out: {0}")]
    Timeout(String),
}

impl Error {
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::MalformedToken(_) => FailureKind::MalformedToken,
            Error::UnsupportedAlgorithm(_) => FailureKind::UnsupportedAlgorithm,
            Error::KeySetUnavailable { .. } => FailureKind::KeySetUnavailable,
            Error::KeyNotFound { .. } => FailureKind::KeyNotFound,
            Error::InvalidSignature(_) => FailureKind::InvalidSignature,
            Error::Expired { .. } => FailureKind::Expired,
            Error::NotYetValid { .. } => FailureKind::NotYetValid,
            Error::InvalidIssuer { .. } => FailureKind::InvalidIssuer,
            Error::InvalidAudience => FailureKind::InvalidAudience,
            Error::InsufficientScope { .. } => FailureKind::InsufficientScope,
            Error::Timeout(_) => FailureKind::Timeout,
        }
    }
}

/// Result alias for validation operations.
pub type Result<T> = std::result::Result<T, Error>;
