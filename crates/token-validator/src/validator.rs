//! JWT validation pipeline
//!
//! Stages run in a fixed order and the first failure wins. Claims are only
//! exposed on the result once the signature has verified, so nothing from an
//! unauthenticated payload leaks into callers.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::FailureKind;
use jsonwebtoken::Algorithm;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::jwks::{JwksCache, ResolvedKey};
use crate::scope::{ScopeDecision, ScopePolicy, check_policy, parse_scopes};

/// Asymmetric signature algorithms accepted by default.
pub const DEFAULT_ALLOWED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::EdDSA,
];

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub allowed_algorithms: Vec<Algorithm>,
    /// Clock skew tolerated on `exp` and `nbf`.
    pub leeway: Duration,
    /// Require the RFC 9068 `typ` header (`at+jwt`).
    pub require_access_token_type: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            allowed_algorithms: DEFAULT_ALLOWED_ALGORITHMS.to_vec(),
            leeway: Duration::ZERO,
            require_access_token_type: false,
        }
    }
}

/// Outcome of one validation. `claims` is only set once the signature has
/// verified; `validated_scopes` is empty unless `valid`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub claims: Option<Map<String, Value>>,
    pub failure: Option<FailureKind>,
    /// Internal reason for logs and flow steps. Never sent to a token
    /// presenter.
    pub failure_detail: Option<String>,
    pub validated_scopes: BTreeSet<String>,
    pub stale_keys: bool,
    pub algorithm: Option<String>,
    pub key_id: Option<String>,
}

impl ValidationResult {
    pub fn claim_str(&self, name: &str) -> Option<&str> {
        self.claims.as_ref()?.get(name)?.as_str()
    }

    /// Display-safe digest of the token for a flow step.
    pub fn summary(&self) -> Value {
        let claims = self.claims.as_ref();
        let pick = |name: &str| claims.and_then(|c| c.get(name)).cloned().unwrap_or(Value::Null);
        json!({
            "valid": self.valid,
            "failure": self.failure,
            "algorithm": self.algorithm,
            "kid": self.key_id,
            "stale_keys": self.stale_keys,
            "iss": pick("iss"),
            "sub": pick("sub"),
            "aud": pick("aud"),
            "exp": pick("exp"),
            "scopes": self.validated_scopes,
        })
    }

    fn fail(&mut self, err: Error) {
        self.valid = false;
        self.failure = Some(err.kind());
        self.failure_detail = Some(err.to_string());
        self.validated_scopes.clear();
    }
}

/// Validates JWTs against one shared JWKS cache.
#[derive(Clone)]
pub struct TokenValidator {
    jwks: Arc<JwksCache>,
    config: ValidatorConfig,
}

struct Segments<'t> {
    header: Map<String, Value>,
    payload: Map<String, Value>,
    signing_input: &'t str,
    signature: &'t str,
}

impl TokenValidator {
    pub fn new(jwks: Arc<JwksCache>, config: ValidatorConfig) -> Self {
        Self { jwks, config }
    }

    pub fn jwks(&self) -> &Arc<JwksCache> {
        &self.jwks
    }

    /// Run the full pipeline against `expected_issuer` / `expected_audience`.
    #[instrument(skip_all, fields(issuer = %expected_issuer, audience = %expected_audience))]
    pub async fn validate(
        &self,
        token: &str,
        expected_issuer: &str,
        expected_audience: &str,
    ) -> ValidationResult {
        let result = self
            .evaluate(token, expected_issuer, expected_audience)
            .await;
        record(&result);
        result
    }

    /// `validate`, then enforce `policy`. On success `validated_scopes` is
    /// narrowed to the required scopes the token carries.
    #[instrument(skip_all, fields(issuer = %expected_issuer, audience = %expected_audience))]
    pub async fn validate_for_resource(
        &self,
        token: &str,
        expected_issuer: &str,
        expected_audience: &str,
        policy: &ScopePolicy,
    ) -> ValidationResult {
        let mut result = self
            .evaluate(token, expected_issuer, expected_audience)
            .await;
        if result.valid {
            match check_policy(&result.validated_scopes, policy) {
                ScopeDecision::Granted { matched } => {
                    if !policy.required.is_empty() {
                        result.validated_scopes = matched;
                    }
                }
                ScopeDecision::InsufficientScope { missing } => {
                    result.fail(Error::InsufficientScope { missing });
                }
            }
        }
        record(&result);
        result
    }

    async fn evaluate(&self, token: &str, issuer: &str, audience: &str) -> ValidationResult {
        let mut result = ValidationResult::default();
        match self.run(token, issuer, audience, &mut result).await {
            Ok(()) => result.valid = true,
            Err(err) => {
                debug!(failure = %err.kind(), detail = %err, "token rejected");
                result.fail(err);
            }
        }
        result
    }

    async fn run(
        &self,
        token: &str,
        issuer: &str,
        audience: &str,
        result: &mut ValidationResult,
    ) -> Result<()> {
        let segments = split(token)?;

        let (alg, kid) = self.inspect_header(&segments.header)?;
        result.algorithm = Some(format!("{alg:?}"));
        result.key_id = kid.clone();

        // Keys come from the issuer we expect, never the one the token names.
        let key = self.jwks.get_key(issuer, kid.as_deref()).await?;
        result.stale_keys = key.stale;

        verify_signature(&segments, alg, &key)?;
        result.claims = Some(segments.payload.clone());

        self.check_claims(&segments.payload, issuer, audience)?;
        result.validated_scopes = token_scopes(&segments.payload);
        Ok(())
    }

    fn inspect_header(&self, header: &Map<String, Value>) -> Result<(Algorithm, Option<String>)> {
        let alg = header
            .get("alg")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedToken("header has no alg".into()))?;
        let alg = Algorithm::from_str(alg)
            .ok()
            .filter(|a| self.config.allowed_algorithms.contains(a))
            .ok_or_else(|| Error::UnsupportedAlgorithm(alg.to_string()))?;

        if self.config.require_access_token_type {
            let typ = header.get("typ").and_then(Value::as_str).unwrap_or_default();
            if !typ.eq_ignore_ascii_case("at+jwt") && !typ.eq_ignore_ascii_case("application/at+jwt") {
                return Err(Error::MalformedToken(format!("typ {typ:?} is not at+jwt")));
            }
        }

        let kid = match header.get("kid") {
            None | Some(Value::Null) => None,
            Some(Value::String(kid)) => Some(kid.clone()),
            Some(_) => return Err(Error::MalformedToken("kid is not a string".into())),
        };
        Ok((alg, kid))
    }

    fn check_claims(&self, claims: &Map<String, Value>, issuer: &str, audience: &str) -> Result<()> {
        let now = unix_now();
        let leeway = self.config.leeway.as_secs() as i64;

        let exp = numeric_claim(claims, "exp")?
            .ok_or_else(|| Error::MalformedToken("missing exp".into()))?;
        if exp.saturating_add(leeway) <= now {
            return Err(Error::Expired { exp });
        }

        if let Some(nbf) = numeric_claim(claims, "nbf")?
            && nbf > now.saturating_add(leeway)
        {
            return Err(Error::NotYetValid { nbf });
        }

        let actual_issuer = claims.get("iss").and_then(Value::as_str);
        if actual_issuer != Some(issuer) {
            return Err(Error::InvalidIssuer {
                actual: actual_issuer.map(str::to_string),
            });
        }

        let audience_ok = match claims.get("aud") {
            Some(Value::String(aud)) => aud == audience,
            Some(Value::Array(auds)) => auds.iter().any(|a| a.as_str() == Some(audience)),
            _ => false,
        };
        if !audience_ok {
            return Err(Error::InvalidAudience);
        }
        Ok(())
    }
}

fn record(result: &ValidationResult) {
    let label = match result.failure {
        Some(kind) => kind.as_str(),
        None => "valid",
    };
    metrics::counter!("token_validations_total", "result" => label).increment(1);
}

fn split(token: &str) -> Result<Segments<'_>> {
    let parts: Vec<&str> = token.split('.').collect();
    let &[header, payload, signature] = parts.as_slice() else {
        return Err(Error::MalformedToken(format!(
            "expected 3 segments, found {}",
            parts.len()
        )));
    };
    if header.is_empty() || payload.is_empty() || signature.is_empty() {
        return Err(Error::MalformedToken("empty segment".into()));
    }

    Ok(Segments {
        header: json_segment(header, "header")?,
        payload: json_segment(payload, "payload")?,
        signing_input: &token[..header.len() + 1 + payload.len()],
        signature,
    })
}

fn json_segment(segment: &str, name: &str) -> Result<Map<String, Value>> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| Error::MalformedToken(format!("{name} is not base64url: {e}")))?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(Error::MalformedToken(format!("{name} is not a JSON object"))),
        Err(e) => Err(Error::MalformedToken(format!("{name} is not JSON: {e}"))),
    }
}

fn verify_signature(segments: &Segments<'_>, alg: Algorithm, key: &ResolvedKey) -> Result<()> {
    if !key.family.supports(alg) {
        return Err(Error::InvalidSignature(format!(
            "{alg:?} cannot be verified with a {:?} key",
            key.family
        )));
    }
    if let Some(pinned) = key.algorithm
        && pinned != alg
    {
        return Err(Error::InvalidSignature(format!(
            "key is pinned to {pinned:?}, token uses {alg:?}"
        )));
    }

    match jsonwebtoken::crypto::verify(
        segments.signature,
        segments.signing_input.as_bytes(),
        &key.key,
        alg,
    ) {
        Ok(true) => Ok(()),
        Ok(false) => Err(Error::InvalidSignature("signature mismatch".into())),
        Err(e) => Err(Error::InvalidSignature(e.to_string())),
    }
}

fn numeric_claim(claims: &Map<String, Value>, name: &str) -> Result<Option<i64>> {
    match claims.get(name) {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.floor() as i64))
            .map(Some)
            .ok_or_else(|| Error::MalformedToken(format!("{name} out of range"))),
        Some(_) => Err(Error::MalformedToken(format!("{name} is not numeric"))),
    }
}

/// `scope` (RFC 8693 space-delimited) with a fallback to an `scp` array.
fn token_scopes(claims: &Map<String, Value>) -> BTreeSet<String> {
    match (claims.get("scope"), claims.get("scp")) {
        (Some(Value::String(scope)), _) => parse_scopes(scope),
        (_, Some(Value::Array(scp))) => scp
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        (_, Some(Value::String(scp))) => parse_scopes(scp),
        _ => BTreeSet::new(),
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
