//! Authorization Code + PKCE flow orchestrator
//!
//! Flows live in a sharded map of per-flow async mutexes. Every transition
//! happens under the owning flow's lock, and the lock is never held across a
//! network call: the callback path claims the flow (`awaiting_callback ->
//! exchanging`) under the lock, then runs the token exchange and validation
//! in a spawned task that re-locks only to record steps. A second callback for
//! the same flow finds it already `exchanging` and is refused, so each flow
//! performs at most one exchange.

use std::sync::Arc;
use std::time::Duration;

use common::{FailureKind, Secret};
use dashmap::DashMap;
use oauth_client::{
    AuthorizationRequest, ChallengeMethod, ExchangeRequest, PkcePair, StateError, StateRegistry,
    TokenEndpoint, TokenSet, build_authorization_url,
};
use serde::Serialize;
use serde_json::json;
use token_validator::TokenValidator;
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout_at};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::{FlowEvent, FlowEventSink};
use crate::model::{
    ClientConfig, Flow, FlowStatus, FlowStep, HttpSnapshot, ServerConfig, StepStatus,
    VulnerabilityConfig,
};

pub const STEP_AUTHORIZATION_REQUEST: &str = "Authorization Request";
pub const STEP_AUTHORIZATION_CALLBACK: &str = "Authorization Callback";
pub const STEP_TOKEN_EXCHANGE: &str = "Token Exchange";
pub const STEP_TOKEN_VALIDATION: &str = "Token Validation";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Budget for exchange plus validation after a callback.
    pub callback_timeout: Duration,
    pub max_flow_age: Duration,
    /// How long a finished flow stays visible.
    pub terminal_retention: Duration,
    pub verifier_length: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            callback_timeout: Duration::from_secs(30),
            max_flow_age: Duration::from_secs(24 * 60 * 60),
            terminal_retention: Duration::from_secs(60 * 60),
            verifier_length: oauth_client::constants::DEFAULT_VERIFIER_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartedFlow {
    pub flow_id: String,
    pub authorization_url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub flows_removed: usize,
    pub states_removed: usize,
}

/// Everything the exchange task needs, captured while the flow is locked.
struct PendingExchange {
    request: ExchangeRequest,
    exchange_step: u32,
    issuer: String,
    audience: String,
    client_id: String,
    nonce: Option<String>,
}

struct Inner {
    flows: DashMap<String, Arc<Mutex<Flow>>>,
    states: Arc<StateRegistry>,
    token_endpoint: Arc<dyn TokenEndpoint>,
    validator: Arc<TokenValidator>,
    events: Arc<dyn FlowEventSink>,
    config: OrchestratorConfig,
}

/// Cheap to clone; clones share the same flows.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        states: Arc<StateRegistry>,
        token_endpoint: Arc<dyn TokenEndpoint>,
        validator: Arc<TokenValidator>,
        events: Arc<dyn FlowEventSink>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                flows: DashMap::new(),
                states,
                token_endpoint,
                validator,
                events,
                config,
            }),
        }
    }

    /// Create a flow and return the URL to send the user agent to.
    #[instrument(skip_all, fields(client_id = %client.client_id))]
    pub fn start(
        &self,
        client: ClientConfig,
        server: ServerConfig,
        vulnerabilities: VulnerabilityConfig,
    ) -> Result<StartedFlow> {
        let flow_id = format!("flow_{}", Uuid::new_v4().simple());
        let max_age_millis = self.inner.config.max_flow_age.as_millis() as u64;
        let mut flow = Flow::new(flow_id.clone(), client, server, vulnerabilities, max_age_millis);

        let pkce = if vulnerabilities.disable_pkce {
            None
        } else {
            let method = if vulnerabilities.downgrade_pkce_to_plain {
                ChallengeMethod::Plain
            } else {
                ChallengeMethod::S256
            };
            Some(PkcePair::generate(self.inner.config.verifier_length, method)?)
        };
        let nonce = flow
            .client
            .scopes
            .iter()
            .any(|s| s == "openid")
            .then(|| self.inner.states.issue_nonce());
        let state = self.inner.states.issue(&flow_id);

        let authorization_url = build_authorization_url(&AuthorizationRequest {
            authorization_endpoint: &flow.server.authorization_endpoint,
            client_id: &flow.client.client_id,
            redirect_uri: &flow.client.redirect_uri,
            scopes: &flow.client.scopes,
            state: Some(&state.value),
            pkce: pkce.as_ref(),
            nonce: nonce.as_deref(),
        })?;

        let step = FlowStep::new(STEP_AUTHORIZATION_REQUEST, StepStatus::Complete)
            .with_request(HttpSnapshot::request("GET", &authorization_url))
            .with_description(describe_request(&vulnerabilities, pkce.as_ref(), nonce.is_some()))
            .with_details(json!({
                "pkce": pkce.is_some(),
                "code_challenge_method": pkce.as_ref().map(|p| p.method().as_str()),
                "nonce": nonce.is_some(),
                "vulnerabilities": vulnerabilities,
            }));

        flow.authorization_url = authorization_url.clone();
        flow.pkce = pkce;
        flow.nonce = nonce;
        self.append(&mut flow, step)?;
        flow.transition(FlowStatus::AwaitingCallback)?;

        self.inner
            .flows
            .insert(flow_id.clone(), Arc::new(Mutex::new(flow)));
        metrics::counter!("oauth_flows_started_total").increment(1);
        info!(flow_id = %flow_id, "flow started");

        Ok(StartedFlow {
            flow_id,
            authorization_url,
        })
    }

    /// Handle the redirect back from the authorization server.
    ///
    /// Returns the completed flow, or the error that ended it. A flow that is
    /// already past `awaiting_callback` is left untouched and reported as
    /// `FlowAlreadyTerminal`.
    #[instrument(skip(self, code, state))]
    pub async fn handle_callback(
        &self,
        flow_id: &str,
        code: &str,
        state: Option<&str>,
    ) -> Result<Flow> {
        let entry = self.entry(flow_id)?;

        let pending = {
            let mut flow = entry.lock().await;
            ensure_awaiting(&flow)?;
            let state_note = self.verify_state(&mut flow, state, code)?;

            let callback = FlowStep::new(STEP_AUTHORIZATION_CALLBACK, StepStatus::Complete)
                .with_request(callback_snapshot(&flow.client.redirect_uri, &[
                    ("code", Some(code)),
                    ("state", state),
                ]))
                .with_description(format!("Authorization code received; {state_note}"));
            self.append(&mut flow, callback)?;
            flow.transition(FlowStatus::Exchanging)?;

            let request = ExchangeRequest {
                token_endpoint: flow.server.token_endpoint.clone(),
                client_id: flow.client.client_id.clone(),
                redirect_uri: flow.client.redirect_uri.clone(),
                code: Secret::new(code.to_string()),
                code_verifier: flow.pkce.as_ref().map(|p| p.verifier().clone()),
            };
            let exchange = FlowStep::new(STEP_TOKEN_EXCHANGE, StepStatus::Running)
                .with_request(exchange_snapshot(&request))
                .with_description(if request.code_verifier.is_some() {
                    "Exchanging the authorization code with the PKCE verifier"
                } else {
                    "Exchanging the authorization code without a PKCE verifier"
                });
            self.append(&mut flow, exchange)?;

            PendingExchange {
                request,
                exchange_step: flow.steps.len() as u32,
                issuer: flow.server.issuer.clone(),
                audience: flow.server.audience.clone(),
                client_id: flow.client.client_id.clone(),
                nonce: flow.nonce.clone(),
            }
        };

        // Detached so that a caller giving up cannot strand the flow in
        // `exchanging`.
        let this = self.clone();
        let task = tokio::spawn(async move { this.finish_exchange(entry, pending).await });
        task.await
            .map_err(|e| Error::Internal(format!("exchange task failed: {e}")))?
    }

    /// Handle an RFC 6749 §4.1.2.1 error redirect (`error=access_denied`...).
    ///
    /// The state is consumed exactly like a callback's. Returns the flow,
    /// now in `error` with `AuthorizationDenied`.
    #[instrument(skip(self, state, description))]
    pub async fn handle_authorization_error(
        &self,
        flow_id: &str,
        state: Option<&str>,
        error: &str,
        description: Option<&str>,
    ) -> Result<Flow> {
        let entry = self.entry(flow_id)?;
        let mut flow = entry.lock().await;
        ensure_awaiting(&flow)?;
        self.verify_state(&mut flow, state, "")?;

        let text = match description {
            Some(d) => format!("Authorization server returned {error}: {d}"),
            None => format!("Authorization server returned {error}"),
        };
        let step = FlowStep::new(STEP_AUTHORIZATION_CALLBACK, StepStatus::Error)
            .with_request(callback_snapshot(&flow.client.redirect_uri, &[
                ("error", Some(error)),
                ("error_description", description),
                ("state", state),
            ]))
            .with_details(json!({ "error": error, "error_description": description }))
            .failed(FailureKind::AuthorizationDenied, text);
        self.append(&mut flow, step)?;
        self.fail(&mut flow, FailureKind::AuthorizationDenied);
        Ok(flow.clone())
    }

    /// Point-in-time copy of a flow.
    pub async fn snapshot(&self, flow_id: &str) -> Result<Flow> {
        let entry = self.entry(flow_id)?;
        let flow = entry.lock().await;
        Ok(flow.clone())
    }

    /// Flow a state value was issued for, without consuming it.
    pub fn flow_for_state(&self, state: &str) -> Option<String> {
        self.inner.states.flow_id_for(state)
    }

    pub fn len(&self) -> usize {
        self.inner.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.flows.is_empty()
    }

    /// Drop expired and long-finished flows, then sweep the state registry.
    ///
    /// Flows whose lock is held are skipped this round.
    pub fn cleanup(&self) -> CleanupReport {
        let now = Instant::now();
        let max_age = self.inner.config.max_flow_age;
        let retention = self.inner.config.terminal_retention;
        let mut removed = Vec::new();

        self.inner.flows.retain(|id, entry| {
            let Ok(flow) = entry.try_lock() else {
                return true;
            };
            let too_old = now.duration_since(flow.started) >= max_age;
            let retired = flow
                .terminal_at
                .is_some_and(|t| now.duration_since(t) >= retention);
            if too_old || retired {
                removed.push(id.clone());
                false
            } else {
                true
            }
        });

        for id in &removed {
            self.inner.events.close(id);
        }
        CleanupReport {
            flows_removed: removed.len(),
            states_removed: self.inner.states.sweep(),
        }
    }

    fn entry(&self, flow_id: &str) -> Result<Arc<Mutex<Flow>>> {
        self.inner
            .flows
            .get(flow_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::FlowNotFound(flow_id.to_string()))
    }

    /// Consume the callback's state unless the flow was started with state
    /// validation disabled. A rejected state ends the flow.
    fn verify_state(
        &self,
        flow: &mut Flow,
        state: Option<&str>,
        code: &str,
    ) -> Result<&'static str> {
        if flow.vulnerabilities.skip_state_validation {
            warn!(flow_id = %flow.id, "state validation skipped");
            return Ok("state validation SKIPPED (vulnerability mode)");
        }

        let outcome = match state {
            Some(value) => self.inner.states.consume(value, &flow.id),
            None => Err(StateError::NotFound),
        };
        match outcome {
            Ok(()) => Ok("state verified and consumed"),
            Err(e) => {
                warn!(flow_id = %flow.id, error = %e, "callback state rejected");
                let code = (!code.is_empty()).then_some(code);
                let step = FlowStep::new(STEP_AUTHORIZATION_CALLBACK, StepStatus::Error)
                    .with_request(callback_snapshot(&flow.client.redirect_uri, &[
                        ("code", code),
                        ("state", state),
                    ]))
                    .failed(e.kind(), format!("Callback rejected: {e}"));
                self.append(flow, step)?;
                self.fail(flow, e.kind());
                Err(e.into())
            }
        }
    }

    async fn finish_exchange(&self, entry: Arc<Mutex<Flow>>, pending: PendingExchange) -> Result<Flow> {
        let deadline = Instant::now() + self.inner.config.callback_timeout;
        let outcome = self.exchange_and_validate(&entry, &pending, deadline).await;

        let mut flow = entry.lock().await;
        match outcome {
            Ok(()) => {
                flow.transition(FlowStatus::Complete)?;
                record_finished(&flow);
                self.inner.events.close(&flow.id);
                info!(flow_id = %flow.id, "flow complete");
                Ok(flow.clone())
            }
            Err(e) => {
                self.fail(&mut flow, e.kind());
                Err(e)
            }
        }
    }

    async fn exchange_and_validate(
        &self,
        entry: &Mutex<Flow>,
        pending: &PendingExchange,
        deadline: Instant,
    ) -> Result<()> {
        let timeout = self.inner.config.callback_timeout;
        let exchanged = timeout_at(deadline, self.inner.token_endpoint.exchange(&pending.request)).await;

        let tokens = match exchanged {
            Ok(Ok(tokens)) => tokens,
            Ok(Err(e)) => {
                let (kind, text) = (e.kind(), format!("Token exchange failed: {e}"));
                self.update_exchange_step(entry, pending, |step| {
                    *step = step.clone().failed(kind, text);
                })
                .await?;
                return Err(e.into());
            }
            Err(_) => {
                self.update_exchange_step(entry, pending, |step| {
                    *step = step
                        .clone()
                        .failed(FailureKind::Timeout, format!("Token exchange timed out after {timeout:?}"));
                })
                .await?;
                return Err(Error::Timeout(timeout));
            }
        };

        let response = token_response_snapshot(&tokens);
        self.update_exchange_step(entry, pending, |step| {
            step.status = StepStatus::Complete;
            step.response = Some(response);
            step.description = Some("Tokens received from the token endpoint".into());
        })
        .await?;

        let access = match timeout_at(
            deadline,
            self.inner.validator.validate(
                tokens.access_token.expose(),
                &pending.issuer,
                &pending.audience,
            ),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                let step = FlowStep::new(STEP_TOKEN_VALIDATION, StepStatus::Error)
                    .failed(FailureKind::Timeout, format!("Token validation timed out after {timeout:?}"));
                self.append_locked(entry, step).await?;
                return Err(Error::Timeout(timeout));
            }
        };
        let mut details = json!({ "access_token": access.summary() });
        if !access.valid {
            return self
                .reject_token(entry, "access", &access, details)
                .await;
        }

        if let Some(id_token) = &tokens.id_token {
            let id = match timeout_at(
                deadline,
                self.inner
                    .validator
                    .validate(id_token.expose(), &pending.issuer, &pending.client_id),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    let step = FlowStep::new(STEP_TOKEN_VALIDATION, StepStatus::Error)
                        .failed(FailureKind::Timeout, format!("ID token validation timed out after {timeout:?}"));
                    self.append_locked(entry, step).await?;
                    return Err(Error::Timeout(timeout));
                }
            };
            details["id_token"] = id.summary();
            if !id.valid {
                return self.reject_token(entry, "ID", &id, details).await;
            }
            if let Some(expected) = &pending.nonce
                && id.claim_str("nonce") != Some(expected.as_str())
            {
                let step = FlowStep::new(STEP_TOKEN_VALIDATION, StepStatus::Error)
                    .with_details(details)
                    .failed(FailureKind::NonceMismatch, "ID token nonce does not match the authorization request");
                self.append_locked(entry, step).await?;
                return Err(Error::NonceMismatch);
            }
        }

        let scopes: Vec<&str> = access.validated_scopes.iter().map(String::as_str).collect();
        let step = FlowStep::new(STEP_TOKEN_VALIDATION, StepStatus::Complete)
            .with_details(details)
            .with_description(format!(
                "Access token signature and claims verified; scopes: {}",
                scopes.join(" ")
            ));
        self.append_locked(entry, step).await
    }

    async fn reject_token(
        &self,
        entry: &Mutex<Flow>,
        which: &'static str,
        result: &token_validator::ValidationResult,
        details: serde_json::Value,
    ) -> Result<()> {
        let kind = result.failure.unwrap_or(FailureKind::MalformedToken);
        let detail = result.failure_detail.clone().unwrap_or_default();
        let step = FlowStep::new(STEP_TOKEN_VALIDATION, StepStatus::Error)
            .with_details(details)
            .failed(kind, format!("{which} token rejected: {detail}"));
        self.append_locked(entry, step).await?;
        Err(Error::Validation {
            which,
            kind,
            detail,
        })
    }

    async fn update_exchange_step(
        &self,
        entry: &Mutex<Flow>,
        pending: &PendingExchange,
        update: impl FnOnce(&mut FlowStep),
    ) -> Result<()> {
        let mut flow = entry.lock().await;
        let step = flow.update_step(pending.exchange_step, update)?.clone();
        self.emit(&flow.id, step);
        Ok(())
    }

    async fn append_locked(&self, entry: &Mutex<Flow>, step: FlowStep) -> Result<()> {
        let mut flow = entry.lock().await;
        self.append(&mut flow, step)
    }

    fn append(&self, flow: &mut Flow, step: FlowStep) -> Result<()> {
        let step = flow.push_step(step)?.clone();
        self.emit(&flow.id, step);
        Ok(())
    }

    fn emit(&self, flow_id: &str, step: FlowStep) {
        self.inner.events.emit(FlowEvent {
            flow_id: flow_id.to_string(),
            step,
        });
    }

    fn fail(&self, flow: &mut Flow, kind: FailureKind) {
        if flow.mark_failed(kind).is_ok() {
            record_finished(flow);
            self.inner.events.close(&flow.id);
            warn!(flow_id = %flow.id, failure = %kind, "flow failed");
        }
    }
}

fn ensure_awaiting(flow: &Flow) -> Result<()> {
    if flow.status == FlowStatus::AwaitingCallback {
        Ok(())
    } else {
        Err(Error::FlowAlreadyTerminal {
            flow_id: flow.id.clone(),
            status: flow.status,
        })
    }
}

fn record_finished(flow: &Flow) {
    metrics::counter!(
        "oauth_flows_finished_total",
        "status" => flow.status.as_str(),
        "failure" => flow.failure.map(|k| k.as_str()).unwrap_or("none")
    )
    .increment(1);
}

fn describe_request(
    vulnerabilities: &VulnerabilityConfig,
    pkce: Option<&PkcePair>,
    oidc: bool,
) -> String {
    let mut parts = vec!["Redirect the user agent to the authorization endpoint".to_string()];
    match pkce {
        Some(p) if p.method() == ChallengeMethod::Plain => {
            parts.push("PKCE DOWNGRADED to plain (vulnerability mode)".into())
        }
        Some(_) => parts.push("PKCE S256 challenge attached".into()),
        None => parts.push("PKCE DISABLED (vulnerability mode)".into()),
    }
    if vulnerabilities.skip_state_validation {
        parts.push("state will NOT be validated (vulnerability mode)".into());
    }
    if oidc {
        parts.push("OIDC nonce attached".into());
    }
    parts.join("; ")
}

fn callback_snapshot(redirect_uri: &str, params: &[(&str, Option<&str>)]) -> HttpSnapshot {
    let url = match url::Url::parse(redirect_uri) {
        Ok(mut url) => {
            {
                let mut query = url.query_pairs_mut();
                for (name, value) in params {
                    if let Some(value) = value {
                        query.append_pair(name, value);
                    }
                }
            }
            url.to_string()
        }
        Err(_) => redirect_uri.to_string(),
    };
    HttpSnapshot::request("GET", &url)
}

fn exchange_snapshot(request: &ExchangeRequest) -> HttpSnapshot {
    let mut fields = vec![
        ("grant_type", "authorization_code"),
        ("code", request.code.expose().as_str()),
        ("redirect_uri", request.redirect_uri.as_str()),
        ("client_id", request.client_id.as_str()),
    ];
    if let Some(verifier) = &request.code_verifier {
        fields.push(("code_verifier", verifier.expose().as_str()));
    }
    HttpSnapshot::request("POST", &request.token_endpoint)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .form(fields)
}

fn token_response_snapshot(tokens: &TokenSet) -> HttpSnapshot {
    HttpSnapshot::response(200)
        .header("Content-Type", "application/json")
        .json(json!({
            "access_token": tokens.access_token,
            "token_type": tokens.token_type,
            "expires_in": tokens.expires_in,
            "refresh_token": tokens.refresh_token,
            "id_token": tokens.id_token,
            "scope": tokens.scope,
        }))
}
