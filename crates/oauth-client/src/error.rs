//! Error types for client-side OAuth operations

use common::FailureKind;

/// Errors from PKCE generation, URL building and the token endpoint.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("code verifier length {0} outside 43..=128")]
    InvalidLength(usize),

    #[error("code verifier contains characters outside the unreserved set")]
    InvalidVerifier,

    #[error("invalid endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token endpoint returned {status}: {error}")]
    TokenEndpoint {
        status: u16,
        error: String,
        description: Option<String>,
    },

    #[error("invalid token response: {0}")]
    InvalidResponse(String),
}

impl Error {
    /// Taxonomy kind for flow steps and logging.
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::InvalidLength(_) => FailureKind::InvalidLength,
            Error::InvalidVerifier => FailureKind::InvalidVerifier,
            Error::InvalidUrl(_)
            | Error::Http(_)
            | Error::TokenEndpoint { .. }
            | Error::InvalidResponse(_) => FailureKind::TransportError,
        }
    }
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;
