//! Orchestrator errors

use common::FailureKind;
use oauth_client::StateError;

use crate::model::FlowStatus;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("flow {0} not found")]
    FlowNotFound(String),

    #[error("flow {flow_id} is {} and no longer accepts callbacks", .status.as_str())]
    FlowAlreadyTerminal { flow_id: String, status: FlowStatus },

    #[error("callback rejected: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Client(#[from] oauth_client::Error),

    #[error("{which} token rejected: {detail}")]
    Validation {
        which: &'static str,
        kind: FailureKind,
        detail: String,
    },

    #[error("ID token nonce does not match the flow")]
    NonceMismatch,

    #[error("authorization server returned {error}")]
    AuthorizationDenied {
        error: String,
        description: Option<String>,
    },

    #[error("flow did not finish within {0:?}")]
    Timeout(std::time::Duration),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::FlowNotFound(_) => FailureKind::FlowNotFound,
            Error::FlowAlreadyTerminal { .. } => FailureKind::FlowAlreadyTerminal,
            Error::State(e) => e.kind(),
            Error::Client(e) => e.kind(),
            Error::Validation { kind, .. } => *kind,
            Error::NonceMismatch => FailureKind::NonceMismatch,
            Error::AuthorizationDenied { .. } => FailureKind::AuthorizationDenied,
            Error::Timeout(_) => FailureKind::Timeout,
            Error::Internal(_) => FailureKind::TransportError,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
