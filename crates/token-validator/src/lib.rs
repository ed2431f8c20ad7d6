//! Bearer token validation pipeline
//!
//! Verifies JWT access and ID tokens per RFC 7519 / RFC 9068 against keys
//! published in the issuer's JWKS (RFC 7517), then enforces scope policy for
//! protected resources (RFC 6750).
//!
//! Pipeline, each stage short-circuiting:
//! 1. structural decode
//! 2. header inspection against an asymmetric algorithm allow-list
//! 3. key resolution through `jwks::JwksCache` (single-flight refresh)
//! 4. signature verification
//! 5. claims: exp, nbf, iss, aud
//!
//! `bearer::BearerGuard` wraps the pipeline plus `scope` checks and collapses
//! failures into the RFC 6750 response categories.

pub mod bearer;
pub mod error;
pub mod jwks;
pub mod scope;
pub mod validator;

#[cfg(test)]
mod testing;

pub use bearer::{BearerGuard, BearerOutcome, BearerRejection};
pub use error::{Error, Result};
pub use jwks::{
    HttpJwksSource, JwksCache, JwksCacheConfig, JwksSource, KeyFamily, ResolvedKey, SourceError,
    StalePolicy, StaticJwksSource,
};
pub use scope::{ScopeDecision, ScopeMode, ScopePolicy, check, check_policy, parse_scopes};
pub use validator::{TokenValidator, ValidationResult, ValidatorConfig};
