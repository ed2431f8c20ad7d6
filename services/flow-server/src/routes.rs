//! HTTP surface
//!
//! - POST /flows                 start a flow, returns the authorization URL
//! - GET  /flows/{id}            flow snapshot with its steps
//! - GET  /flows/{id}/events     server-sent step events
//! - POST /flows/{id}/callback   deliver `code` + `state` by hand
//! - GET  /callback              the redirect target registered at the IdP
//! - GET  /api/resource          bearer-protected demo resource
//! - GET  /health, GET /metrics

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use common::FailureKind;
use flow::{
    BroadcastEventSink, ClientConfig, FanoutEventSink, FlowEventSink, FlowStep, Orchestrator,
    ServerConfig, StepStatus, TracingEventSink, VulnerabilityConfig,
};
use futures_util::stream::{self, BoxStream, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use oauth_client::{HttpTokenEndpoint, StateRegistry};
use serde::Deserialize;
use token_validator::{
    BearerGuard, BearerOutcome, HttpJwksSource, JwksCache, TokenValidator, ValidatorConfig,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::ApiError;

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub events: Arc<BroadcastEventSink>,
    pub guard: BearerGuard,
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub realm: String,
    pub prometheus: PrometheusHandle,
    pub started_at: Instant,
}

impl AppState {
    /// Wire the orchestrator, validator and bearer guard from config.
    pub fn from_config(config: &Config, http: reqwest::Client, prometheus: PrometheusHandle) -> Self {
        let jwks = Arc::new(JwksCache::new(
            Arc::new(HttpJwksSource::new(http.clone(), config.jwks_uris())),
            config.jwks_cache_config(),
        ));
        let validator = Arc::new(TokenValidator::new(
            jwks,
            ValidatorConfig {
                leeway: Duration::from_secs(config.jwks.leeway_secs),
                ..Default::default()
            },
        ));
        let token_endpoint = Arc::new(HttpTokenEndpoint::new(
            http,
            config.client.client_secret.clone(),
            Duration::from_secs(config.authorization_server.token_timeout_secs),
        ));
        let state_ttl = Duration::from_secs(config.flows.state_ttl_secs);
        let states = Arc::new(StateRegistry::new(
            state_ttl,
            Duration::from_secs(oauth_client::constants::DEFAULT_STATE_RETENTION_SECS),
        ));

        let events = Arc::new(BroadcastEventSink::new(
            config.flows.event_buffer,
            config.flows.overflow_policy,
        ));
        let sinks: Vec<Arc<dyn FlowEventSink>> = vec![events.clone(), Arc::new(TracingEventSink)];

        let orchestrator = Orchestrator::new(
            states,
            token_endpoint,
            validator.clone(),
            Arc::new(FanoutEventSink::new(sinks)),
            config.orchestrator_config(),
        );
        let server = config.server_config();
        let guard = BearerGuard::new(
            validator,
            server.issuer.clone(),
            server.audience.clone(),
            config.scope_policy(),
        );

        Self {
            orchestrator,
            events,
            guard,
            client: config.client_config(),
            server,
            realm: config.resource.realm.clone(),
            prometheus,
            started_at: Instant::now(),
        }
    }
}

/// Build the axum router with all routes and shared state.
pub fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/flows", post(start_flow))
        .route("/flows/{id}", get(get_flow))
        .route("/flows/{id}/events", get(flow_events))
        .route("/flows/{id}/callback", post(post_callback))
        .route("/callback", get(redirect_callback))
        .route("/api/resource", get(protected_resource))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(axum::middleware::from_fn(crate::metrics::track_requests))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn json_response(status: StatusCode, body: &impl serde::Serialize) -> Response {
    match serde_json::to_string(body) {
        Ok(body) => (status, [(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => ApiError::internal(format!("failed to serialize response: {e}")).into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct StartFlowBody {
    /// Overrides the configured scopes for this flow.
    #[serde(default)]
    scopes: Option<Vec<String>>,
    #[serde(default)]
    vulnerabilities: VulnerabilityConfig,
}

/// POST /flows. An empty body starts a flow with the configured client.
async fn start_flow(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let request: StartFlowBody = if body.is_empty() {
        StartFlowBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::invalid_request(format!("invalid request body: {e}")))?
    };

    let mut client = state.client.clone();
    if let Some(scopes) = request.scopes {
        client.scopes = scopes;
    }
    let started = state
        .orchestrator
        .start(client, state.server.clone(), request.vulnerabilities)?;
    Ok(json_response(StatusCode::CREATED, &started))
}

/// GET /flows/{id}
async fn get_flow(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let flow = state.orchestrator.snapshot(&id).await?;
    Ok(json_response(StatusCode::OK, &flow))
}

#[derive(Debug, Deserialize)]
struct CallbackBody {
    code: String,
    state: Option<String>,
}

/// POST /flows/{id}/callback
async fn post_callback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    axum::Json(body): axum::Json<CallbackBody>,
) -> Result<Response, ApiError> {
    let flow = state
        .orchestrator
        .handle_callback(&id, &body.code, body.state.as_deref())
        .await?;
    Ok(json_response(StatusCode::OK, &flow))
}

#[derive(Debug, Deserialize)]
struct RedirectParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// GET /callback: the authorization server's redirect. The flow is found
/// through the state value, so a missing or unknown state cannot be tied to
/// any flow and is rejected outright.
async fn redirect_callback(
    State(state): State<AppState>,
    Query(params): Query<RedirectParams>,
) -> Result<Response, ApiError> {
    let flow_id = params
        .state
        .as_deref()
        .and_then(|s| state.orchestrator.flow_for_state(s))
        .ok_or_else(|| {
            warn!("redirect callback with unknown state");
            ApiError::bad_request(FailureKind::StateNotFound, "state value not recognised")
        })?;

    let (error, description) = match (params.code.as_deref(), params.error.as_deref()) {
        (Some(code), None) => {
            let flow = state
                .orchestrator
                .handle_callback(&flow_id, code, params.state.as_deref())
                .await?;
            return Ok(json_response(StatusCode::OK, &flow));
        }
        (_, Some(error)) => (error, params.error_description.as_deref()),
        (None, None) => ("invalid_request", Some("redirect carried neither code nor error")),
    };

    state
        .orchestrator
        .handle_authorization_error(&flow_id, params.state.as_deref(), error, description)
        .await?;
    info!(flow_id = %flow_id, error, "authorization server denied the request");
    Err(flow::Error::AuthorizationDenied {
        error: error.to_string(),
        description: description.map(str::to_string),
    }
    .into())
}

fn step_event(step: &FlowStep) -> Result<Event, Infallible> {
    Ok(Event::default()
        .event("step")
        .id(step.step_number.to_string())
        .json_data(step)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string())))
}

/// GET /flows/{id}/events: replays recorded steps, then follows live ones
/// until the flow finishes.
async fn flow_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<KeepAliveStream<BoxStream<'static, Result<Event, Infallible>>>>, ApiError> {
    // Subscribe before the snapshot so no step falls between the two.
    let rx = state.events.subscribe(&id);
    let flow = match state.orchestrator.snapshot(&id).await {
        Ok(flow) => flow,
        Err(e) => {
            state.events.close(&id);
            return Err(e.into());
        }
    };

    let seen: Vec<(u32, StepStatus)> = flow
        .steps
        .iter()
        .map(|s| (s.step_number, s.status))
        .collect();
    let replay = stream::iter(flow.steps.iter().map(step_event).collect::<Vec<_>>());

    let stream = if flow.status.is_terminal() {
        state.events.close(&id);
        replay.boxed()
    } else {
        let live = stream::unfold((rx, seen), |(mut rx, seen)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if seen.contains(&(event.step.step_number, event.step.status)) {
                            continue;
                        }
                        return Some((step_event(&event.step), (rx, seen)));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event observer lagging, skipped steps");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        replay.chain(live).boxed()
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// GET /api/resource: RFC 6750 protected resource.
async fn protected_resource(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match state.guard.authorize(authorization).await {
        BearerOutcome::Authorized { claims, scopes } => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "message": "access granted",
                "sub": claims.get("sub"),
                "scopes": scopes,
            }),
        ),
        BearerOutcome::Rejected(rejection) => {
            let status = StatusCode::from_u16(rejection.http_status())
                .unwrap_or(StatusCode::UNAUTHORIZED);
            let challenge = rejection.www_authenticate(&state.realm);
            let body = if rejection.credentials_present {
                serde_json::json!({ "error": rejection.category.error_code() })
            } else {
                serde_json::json!({ "error": "unauthorized" })
            };
            (
                status,
                [
                    (header::WWW_AUTHENTICATE, challenge),
                    (header::CONTENT_TYPE, "application/json".to_string()),
                ],
                body.to_string(),
            )
                .into_response()
        }
    }
}

/// Health endpoint: liveness plus a few gauges.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "healthy",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "active_flows": state.orchestrator.len(),
        "event_channels": state.events.open_channels(),
    });
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}
