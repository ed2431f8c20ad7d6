//! RFC 6750 bearer-token boundary
//!
//! Maps the full-fidelity validation outcome onto the three externally
//! visible categories. The challenge descriptions are fixed strings so a
//! caller cannot tell a bad signature from an unknown key or a wrong audience.

use std::collections::BTreeSet;
use std::sync::Arc;

use common::{BoundaryCategory, FailureKind};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::scope::ScopePolicy;
use crate::validator::TokenValidator;

const INVALID_REQUEST_DESCRIPTION: &str = "The request is missing a valid bearer credential";
const INVALID_TOKEN_DESCRIPTION: &str = "The access token is invalid";
const INSUFFICIENT_SCOPE_DESCRIPTION: &str =
    "The request requires higher privileges than provided by the access token";

#[derive(Debug, Clone)]
pub enum BearerOutcome {
    Authorized {
        claims: Map<String, Value>,
        scopes: BTreeSet<String>,
    },
    Rejected(BearerRejection),
}

/// A refused request, ready to render as a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerRejection {
    /// Internal reason. `None` when no credentials were presented.
    pub kind: Option<FailureKind>,
    pub category: BoundaryCategory,
    /// False when the request carried no bearer credentials at all.
    pub credentials_present: bool,
    /// Scopes to advertise on `insufficient_scope`.
    pub required_scopes: Vec<String>,
}

impl BearerRejection {
    fn missing() -> Self {
        Self {
            kind: None,
            category: BoundaryCategory::InvalidRequest,
            credentials_present: false,
            required_scopes: Vec::new(),
        }
    }

    fn malformed() -> Self {
        Self {
            kind: Some(FailureKind::MalformedToken),
            category: BoundaryCategory::InvalidRequest,
            credentials_present: true,
            required_scopes: Vec::new(),
        }
    }

    /// 401 for a bare challenge, otherwise the category's status.
    pub fn http_status(&self) -> u16 {
        if self.credentials_present {
            self.category.http_status()
        } else {
            401
        }
    }

    /// `WWW-Authenticate` header value (RFC 6750 §3).
    pub fn www_authenticate(&self, realm: &str) -> String {
        let realm = quote(realm);
        if !self.credentials_present {
            return format!("Bearer realm=\"{realm}\"");
        }
        let description = match self.category {
            BoundaryCategory::InvalidRequest => INVALID_REQUEST_DESCRIPTION,
            BoundaryCategory::InvalidToken => INVALID_TOKEN_DESCRIPTION,
            BoundaryCategory::InsufficientScope => INSUFFICIENT_SCOPE_DESCRIPTION,
        };
        let mut challenge = format!(
            "Bearer realm=\"{realm}\", error=\"{}\", error_description=\"{description}\"",
            self.category.error_code()
        );
        if self.category == BoundaryCategory::InsufficientScope && !self.required_scopes.is_empty() {
            challenge.push_str(&format!(", scope=\"{}\"", quote(&self.required_scopes.join(" "))));
        }
        challenge
    }
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Pull the token out of an `Authorization` header value.
///
/// `Ok(None)` means no bearer credentials were sent (absent header or
/// another scheme); `Err` means a `Bearer` header that carries no usable
/// token.
fn bearer_token(header: Option<&str>) -> Result<Option<&str>, ()> {
    let Some(header) = header else {
        return Ok(None);
    };
    let header = header.trim();
    let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Ok(None);
    }
    let token = rest.trim();
    if token.is_empty() || token.contains(char::is_whitespace) {
        return Err(());
    }
    Ok(Some(token))
}

/// Guards one protected resource.
#[derive(Clone)]
pub struct BearerGuard {
    validator: Arc<TokenValidator>,
    issuer: String,
    audience: String,
    policy: ScopePolicy,
}

impl BearerGuard {
    pub fn new(
        validator: Arc<TokenValidator>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
        policy: ScopePolicy,
    ) -> Self {
        Self {
            validator,
            issuer: issuer.into(),
            audience: audience.into(),
            policy,
        }
    }

    pub fn policy(&self) -> &ScopePolicy {
        &self.policy
    }

    /// Authorize a request given its raw `Authorization` header.
    pub async fn authorize(&self, authorization: Option<&str>) -> BearerOutcome {
        self.authorize_with(authorization, &self.policy).await
    }

    /// Same as `authorize` with an explicit per-route policy.
    pub async fn authorize_with(
        &self,
        authorization: Option<&str>,
        policy: &ScopePolicy,
    ) -> BearerOutcome {
        let token = match bearer_token(authorization) {
            Ok(Some(token)) => token,
            Ok(None) => return reject(BearerRejection::missing()),
            Err(()) => return reject(BearerRejection::malformed()),
        };

        let result = self
            .validator
            .validate_for_resource(token, &self.issuer, &self.audience, policy)
            .await;

        match (result.valid, result.failure, result.claims) {
            (true, _, Some(claims)) => {
                metrics::counter!("bearer_requests_total", "outcome" => "authorized").increment(1);
                debug!(scopes = ?result.validated_scopes, "bearer request authorized");
                BearerOutcome::Authorized {
                    claims,
                    scopes: result.validated_scopes,
                }
            }
            (_, failure, _) => {
                let kind = failure.unwrap_or(FailureKind::MalformedToken);
                warn!(
                    failure = %kind,
                    detail = result.failure_detail.as_deref().unwrap_or(""),
                    "bearer request rejected"
                );
                reject(BearerRejection {
                    kind: Some(kind),
                    category: kind.boundary_category(),
                    credentials_present: true,
                    required_scopes: policy.required.clone(),
                })
            }
        }
    }
}

fn reject(rejection: BearerRejection) -> BearerOutcome {
    let outcome = match rejection.kind {
        None => "missing",
        Some(_) => rejection.category.error_code(),
    };
    metrics::counter!("bearer_requests_total", "outcome" => outcome).increment(1);
    BearerOutcome::Rejected(rejection)
}
