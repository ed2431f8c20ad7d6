//! Shared types for the OAuth flow workspace
//!
//! The failure taxonomy lives here because the validator, the client helpers
//! and the orchestrator all report through it.

mod error;
mod failure;
mod secret;

pub use error::{Error, Result};
pub use failure::{BoundaryCategory, FailureKind};
pub use secret::Secret;
