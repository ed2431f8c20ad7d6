//! Token endpoint client (RFC 6749 §4.1.3)
//!
//! `TokenEndpoint` is the seam the orchestrator consumes: given a code and
//! the PKCE verifier it returns tokens or a transport/protocol error. The
//! HTTP implementation POSTs the form-encoded grant; tests and demos swap in
//! their own implementations.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use common::Secret;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};

/// Input to a code-for-token exchange.
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    pub token_endpoint: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub code: Secret<String>,
    /// `None` when the flow ran without PKCE.
    pub code_verifier: Option<Secret<String>>,
}

/// Tokens returned by a successful exchange. Token values are wrapped so they
/// cannot end up in logs or flow steps by accident.
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: Secret<String>,
    pub token_type: String,
    pub expires_in: Option<u64>,
    pub refresh_token: Option<Secret<String>>,
    pub id_token: Option<Secret<String>>,
    pub scope: Option<String>,
}

/// Successful token response body.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// RFC 6749 §5.2 error body.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl From<TokenResponse> for TokenSet {
    fn from(r: TokenResponse) -> Self {
        Self {
            access_token: Secret::new(r.access_token),
            token_type: r.token_type,
            expires_in: r.expires_in,
            refresh_token: r.refresh_token.map(Secret::new),
            id_token: r.id_token.map(Secret::new),
            scope: r.scope,
        }
    }
}

/// Code-for-token exchange. Uses `Pin<Box<dyn Future>>` so the orchestrator
/// can hold an `Arc<dyn TokenEndpoint>`.
pub trait TokenEndpoint: Send + Sync {
    fn exchange<'a>(
        &'a self,
        request: &'a ExchangeRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TokenSet>> + Send + 'a>>;
}

/// Token endpoint client over reqwest.
#[derive(Clone)]
pub struct HttpTokenEndpoint {
    client: reqwest::Client,
    client_secret: Option<Secret<String>>,
    timeout: Duration,
}

impl HttpTokenEndpoint {
    /// `client_secret` is sent as a form field (`client_secret_post`) for
    /// confidential clients; public clients pass `None` and rely on PKCE.
    pub fn new(
        client: reqwest::Client,
        client_secret: Option<Secret<String>>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            client_secret,
            timeout,
        }
    }

    #[instrument(skip_all, fields(endpoint = %request.token_endpoint, client_id = %request.client_id))]
    async fn exchange_inner(&self, request: &ExchangeRequest) -> Result<TokenSet> {
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "authorization_code"),
            ("code", request.code.expose().as_str()),
            ("redirect_uri", request.redirect_uri.as_str()),
            ("client_id", request.client_id.as_str()),
        ];
        if let Some(verifier) = &request.code_verifier {
            form.push(("code_verifier", verifier.expose().as_str()));
        }
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.expose().as_str()));
        }

        let started = Instant::now();
        let response = self
            .client
            .post(&request.token_endpoint)
            .timeout(self.timeout)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Http(format!("token exchange request failed: {e}")))?;
        metrics::histogram!("token_exchange_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            let (error, description) = match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(parsed) => (parsed.error, parsed.error_description),
                Err(_) => ("unparseable_error".to_string(), None),
            };
            warn!(status = status.as_u16(), error = %error, "token endpoint rejected exchange");
            return Err(Error::TokenEndpoint {
                status: status.as_u16(),
                error,
                description,
            });
        }

        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;

        if !token.token_type.eq_ignore_ascii_case("bearer") {
            return Err(Error::InvalidResponse(format!(
                "unsupported token_type {}",
                token.token_type
            )));
        }

        debug!(
            has_id_token = token.id_token.is_some(),
            has_refresh_token = token.refresh_token.is_some(),
            "token exchange succeeded"
        );
        Ok(token.into())
    }
}

impl TokenEndpoint for HttpTokenEndpoint {
    fn exchange<'a>(
        &'a self,
        request: &'a ExchangeRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TokenSet>> + Send + 'a>> {
        Box::pin(self.exchange_inner(request))
    }
}
