//! Failure taxonomy shared by every protocol component
//!
//! `FailureKind` is the full-fidelity reason a token, callback or flow was
//! rejected. It is logged and shown on flow steps. At the RFC 6750 boundary
//! several kinds collapse into one `BoundaryCategory` so a caller probing
//! forged tokens cannot learn which stage rejected them.

use serde::Serialize;
use std::fmt;

/// Why an operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MalformedToken,
    UnsupportedAlgorithm,
    KeySetUnavailable,
    KeyNotFound,
    InvalidSignature,
    Expired,
    NotYetValid,
    InvalidIssuer,
    InvalidAudience,
    InsufficientScope,
    StateNotFound,
    StateExpired,
    StateFlowMismatch,
    StateAlreadyUsed,
    FlowNotFound,
    FlowAlreadyTerminal,
    Timeout,
    TransportError,
    InvalidLength,
    InvalidVerifier,
    NonceMismatch,
    AuthorizationDenied,
}

/// Externally visible outcome at the bearer-token boundary (RFC 6750 §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryCategory {
    /// Missing or unparseable credentials. 400, or 401 without an error code
    /// when no credentials were sent at all.
    InvalidRequest,
    /// Authentication failed. 401.
    InvalidToken,
    /// Valid token lacking a required scope. 403.
    InsufficientScope,
}

impl FailureKind {
    /// Stable label for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::MalformedToken => "malformed_token",
            FailureKind::UnsupportedAlgorithm => "unsupported_algorithm",
            FailureKind::KeySetUnavailable => "key_set_unavailable",
            FailureKind::KeyNotFound => "key_not_found",
            FailureKind::InvalidSignature => "invalid_signature",
            FailureKind::Expired => "expired",
            FailureKind::NotYetValid => "not_yet_valid",
            FailureKind::InvalidIssuer => "invalid_issuer",
            FailureKind::InvalidAudience => "invalid_audience",
            FailureKind::InsufficientScope => "insufficient_scope",
            FailureKind::StateNotFound => "state_not_found",
            FailureKind::StateExpired => "state_expired",
            FailureKind::StateFlowMismatch => "state_flow_mismatch",
            FailureKind::StateAlreadyUsed => "state_already_used",
            FailureKind::FlowNotFound => "flow_not_found",
            FailureKind::FlowAlreadyTerminal => "flow_already_terminal",
            FailureKind::Timeout => "timeout",
            FailureKind::TransportError => "transport_error",
            FailureKind::InvalidLength => "invalid_length",
            FailureKind::InvalidVerifier => "invalid_verifier",
            FailureKind::NonceMismatch => "nonce_mismatch",
            FailureKind::AuthorizationDenied => "authorization_denied",
        }
    }

    /// Collapse into the RFC 6750 category used on the wire.
    ///
    /// Everything that is not a scope problem is an authentication failure:
    /// signature, key, claims and structural problems are indistinguishable
    /// to the presenter of the token.
    pub fn boundary_category(&self) -> BoundaryCategory {
        match self {
            FailureKind::InsufficientScope => BoundaryCategory::InsufficientScope,
            _ => BoundaryCategory::InvalidToken,
        }
    }

    /// Transport-level failures may succeed when the caller retries with
    /// backoff. Cryptographic, claims and replay failures never do.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::KeySetUnavailable | FailureKind::Timeout | FailureKind::TransportError
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BoundaryCategory {
    /// RFC 6750 `error` attribute value.
    pub fn error_code(&self) -> &'static str {
        match self {
            BoundaryCategory::InvalidRequest => "invalid_request",
            BoundaryCategory::InvalidToken => "invalid_token",
            BoundaryCategory::InsufficientScope => "insufficient_scope",
        }
    }

    /// HTTP status prescribed for the category.
    pub fn http_status(&self) -> u16 {
        match self {
            BoundaryCategory::InvalidRequest => 400,
            BoundaryCategory::InvalidToken => 401,
            BoundaryCategory::InsufficientScope => 403,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_scope_failures_map_to_insufficient_scope() {
        assert_eq!(
            FailureKind::InsufficientScope.boundary_category(),
            BoundaryCategory::InsufficientScope
        );
        for kind in [
            FailureKind::MalformedToken,
            FailureKind::InvalidSignature,
            FailureKind::KeyNotFound,
            FailureKind::Expired,
            FailureKind::InvalidAudience,
        ] {
            assert_eq!(
                kind.boundary_category(),
                BoundaryCategory::InvalidToken,
                "{kind} must collapse to invalid_token"
            );
        }
    }

    #[test]
    fn categories_carry_rfc6750_codes_and_statuses() {
        assert_eq!(BoundaryCategory::InvalidToken.error_code(), "invalid_token");
        assert_eq!(BoundaryCategory::InvalidToken.http_status(), 401);
        assert_eq!(BoundaryCategory::InsufficientScope.http_status(), 403);
        assert_eq!(BoundaryCategory::InvalidRequest.http_status(), 400);
    }

    #[test]
    fn retryable_kinds_are_transport_only() {
        assert!(FailureKind::TransportError.is_retryable());
        assert!(FailureKind::Timeout.is_retryable());
        assert!(!FailureKind::InvalidSignature.is_retryable());
        assert!(!FailureKind::StateAlreadyUsed.is_retryable());
    }

    #[test]
    fn serialized_form_matches_label() {
        let json = serde_json::to_string(&FailureKind::StateFlowMismatch).unwrap();
        assert_eq!(json, "\"state_flow_mismatch\"");
        assert_eq!(FailureKind::StateFlowMismatch.to_string(), "state_flow_mismatch");
        for kind in [
            FailureKind::StateNotFound,
            FailureKind::NotYetValid,
            FailureKind::KeySetUnavailable,
            FailureKind::AuthorizationDenied,
        ] {
            assert_eq!(serde_json::to_value(kind).unwrap(), kind.as_str());
        }
    }
}
