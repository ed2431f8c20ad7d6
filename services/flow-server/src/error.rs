//! HTTP error responses
//!
//! Flow failures are rendered with their internal failure kind: this API is
//! for observing flows. The protected resource never uses this type; it
//! answers through the RFC 6750 challenge instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::FailureKind;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    /// A `FailureKind` name, or `invalid_request` / `internal_error`.
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: kind.as_str(),
            message: message.into(),
        }
    }

    /// The request itself could not be understood.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_request",
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal_error",
            message: message.into(),
        }
    }
}

impl From<flow::Error> for ApiError {
    fn from(err: flow::Error) -> Self {
        let kind = err.kind().as_str();
        let status = match &err {
            flow::Error::FlowNotFound(_) => StatusCode::NOT_FOUND,
            flow::Error::FlowAlreadyTerminal { .. } => StatusCode::CONFLICT,
            flow::Error::State(_) | flow::Error::AuthorizationDenied { .. } => {
                StatusCode::BAD_REQUEST
            }
            flow::Error::Validation { .. } | flow::Error::NonceMismatch => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            flow::Error::Client(_) => StatusCode::BAD_GATEWAY,
            flow::Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            flow::Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "type": self.kind,
                "message": self.message,
            }
        });
        (
            self.status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow::FlowStatus;
    use oauth_client::StateError;

    #[test]
    fn statuses_follow_failure() {
        let cases = [
            (flow::Error::FlowNotFound("flow_x".into()), StatusCode::NOT_FOUND),
            (
                flow::Error::FlowAlreadyTerminal {
                    flow_id: "flow_x".into(),
                    status: FlowStatus::Complete,
                },
                StatusCode::CONFLICT,
            ),
            (flow::Error::State(StateError::AlreadyUsed), StatusCode::BAD_REQUEST),
            (flow::Error::NonceMismatch, StatusCode::UNPROCESSABLE_ENTITY),
            (
                flow::Error::Timeout(std::time::Duration::from_secs(30)),
                StatusCode::GATEWAY_TIMEOUT,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[tokio::test]
    async fn body_names_the_failure_kind() {
        let response = ApiError::from(flow::Error::State(StateError::Expired)).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["type"], FailureKind::StateExpired.as_str());
    }

    #[test]
    fn helper_constructors() {
        let err = ApiError::invalid_request("bad body");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.kind, "invalid_request");
        assert_eq!(ApiError::internal("boom").status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            ApiError::bad_request(FailureKind::StateNotFound, "unknown").kind,
            "state_not_found"
        );
    }
}
