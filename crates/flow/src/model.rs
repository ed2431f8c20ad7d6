//! Flow records and their transitions
//!
//! A `Flow` is append-only from the outside: steps get the next number and
//! are never removed, and status only moves forward along
//! `started -> awaiting_callback -> exchanging -> complete`, with `error`
//! reachable from any non-terminal status.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use common::FailureKind;
use oauth_client::PkcePair;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Query/form/body fields never shown verbatim on a step.
const SENSITIVE_FIELDS: &[&str] = &[
    "code",
    "code_verifier",
    "client_secret",
    "access_token",
    "refresh_token",
    "id_token",
    "authorization",
];

const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Started,
    AwaitingCallback,
    Exchanging,
    Complete,
    Error,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowStatus::Complete | FlowStatus::Error)
    }

    pub fn can_transition_to(&self, next: FlowStatus) -> bool {
        use FlowStatus::*;
        matches!(
            (self, next),
            (Started, AwaitingCallback)
                | (AwaitingCallback, Exchanging)
                | (Exchanging, Complete)
                | (Started | AwaitingCallback | Exchanging, Error)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Started => "started",
            FlowStatus::AwaitingCallback => "awaiting_callback",
            FlowStatus::Exchanging => "exchanging",
            FlowStatus::Complete => "complete",
            FlowStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Complete,
    Error,
}

/// Redacted view of one HTTP exchange.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HttpSnapshot {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl HttpSnapshot {
    /// Snapshot of a request to `url`; sensitive query parameters are masked.
    pub fn request(method: &str, url: &str) -> Self {
        Self {
            method: method.to_string(),
            url: redact_url(url),
            ..Default::default()
        }
    }

    pub fn response(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        let value = if is_sensitive(name) { REDACTED } else { value };
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    /// Attach a form or JSON body given as key/value pairs.
    pub fn form<'a>(mut self, fields: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let body = fields
            .into_iter()
            .map(|(k, v)| {
                let v = if is_sensitive(k) { REDACTED } else { v };
                (k.to_string(), Value::String(v.to_string()))
            })
            .collect::<serde_json::Map<_, _>>();
        self.body = Some(Value::Object(body));
        self
    }

    /// Attach a JSON body, masking sensitive top-level members.
    pub fn json(mut self, mut body: Value) -> Self {
        if let Value::Object(map) = &mut body {
            for (key, value) in map.iter_mut() {
                if is_sensitive(key) && !value.is_null() {
                    *value = Value::String(REDACTED.to_string());
                }
            }
        }
        self.body = Some(body);
        self
    }
}

fn is_sensitive(name: &str) -> bool {
    SENSITIVE_FIELDS
        .iter()
        .any(|s| s.eq_ignore_ascii_case(name))
}

fn redact_url(raw: &str) -> String {
    let Ok(mut url) = url::Url::parse(raw) else {
        return raw.to_string();
    };
    if url.query().is_none() {
        return url.into();
    }
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if is_sensitive(&k) {
                REDACTED.to_string()
            } else {
                v.into_owned()
            };
            (k.into_owned(), v)
        })
        .collect();
    url.query_pairs_mut().clear().extend_pairs(pairs);
    url.into()
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowStep {
    pub step_number: u32,
    pub name: String,
    pub status: StepStatus,
    /// Unix millis of the last status change.
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<HttpSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<HttpSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl FlowStep {
    /// A step not yet numbered; `Flow::push_step` assigns the number.
    pub fn new(name: &str, status: StepStatus) -> Self {
        Self {
            step_number: 0,
            name: name.to_string(),
            status,
            timestamp: unix_millis(),
            request: None,
            response: None,
            description: None,
            failure: None,
            details: None,
        }
    }

    pub fn with_request(mut self, request: HttpSnapshot) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_response(mut self, response: HttpSnapshot) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn failed(mut self, kind: FailureKind, description: impl Into<String>) -> Self {
        self.status = StepStatus::Error;
        self.failure = Some(kind);
        self.description = Some(description.into());
        self
    }
}

/// Client registration used for one flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Authorization server the flow talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    /// Audience expected in the access token.
    pub audience: String,
}

/// Deliberate weaknesses for demonstrating attacks. Captured at `start` and
/// fixed for the lifetime of the flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VulnerabilityConfig {
    pub disable_pkce: bool,
    pub downgrade_pkce_to_plain: bool,
    pub skip_state_validation: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Flow {
    pub id: String,
    pub status: FlowStatus,
    pub steps: Vec<FlowStep>,
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub vulnerabilities: VulnerabilityConfig,
    pub authorization_url: String,
    /// Unix millis.
    pub created_at: u64,
    /// Unix millis after which cleanup drops the flow.
    pub expires_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,

    #[serde(skip)]
    pub(crate) pkce: Option<PkcePair>,
    #[serde(skip)]
    pub(crate) nonce: Option<String>,
    #[serde(skip)]
    pub(crate) started: Instant,
    #[serde(skip)]
    pub(crate) terminal_at: Option<Instant>,
}

impl Flow {
    pub(crate) fn new(
        id: String,
        client: ClientConfig,
        server: ServerConfig,
        vulnerabilities: VulnerabilityConfig,
        max_age_millis: u64,
    ) -> Self {
        let created_at = unix_millis();
        Self {
            id,
            status: FlowStatus::Started,
            steps: Vec::new(),
            client,
            server,
            vulnerabilities,
            authorization_url: String::new(),
            created_at,
            expires_at: created_at.saturating_add(max_age_millis),
            failure: None,
            pkce: None,
            nonce: None,
            started: Instant::now(),
            terminal_at: None,
        }
    }

    /// Append `step` with the next step number. Returns the stored step.
    pub(crate) fn push_step(&mut self, mut step: FlowStep) -> Result<&FlowStep> {
        self.ensure_open()?;
        step.step_number = self.steps.len() as u32 + 1;
        self.steps.push(step);
        self.steps.last().ok_or_else(|| Error::Internal("step vanished".into()))
    }

    /// Advance the status of an existing step (`running -> complete/error`).
    pub(crate) fn update_step(
        &mut self,
        step_number: u32,
        update: impl FnOnce(&mut FlowStep),
    ) -> Result<&FlowStep> {
        self.ensure_open()?;
        let step = self
            .steps
            .iter_mut()
            .find(|s| s.step_number == step_number)
            .ok_or_else(|| Error::Internal(format!("no step {step_number}")))?;
        update(step);
        step.timestamp = unix_millis();
        Ok(&*step)
    }

    pub(crate) fn transition(&mut self, next: FlowStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::FlowAlreadyTerminal {
                flow_id: self.id.clone(),
                status: self.status,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.terminal_at = Some(Instant::now());
        }
        Ok(())
    }

    pub(crate) fn mark_failed(&mut self, kind: FailureKind) -> Result<()> {
        self.transition(FlowStatus::Error)?;
        self.failure = Some(kind);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::FlowAlreadyTerminal {
                flow_id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> Flow {
        Flow::new(
            "flow_test".into(),
            ClientConfig {
                client_id: "demo".into(),
                redirect_uri: "http://localhost/cb".into(),
                scopes: vec![],
            },
            ServerConfig {
                issuer: "https://idp.example".into(),
                authorization_endpoint: "https://idp.example/auth".into(),
                token_endpoint: "https://idp.example/token".into(),
                audience: "api".into(),
            },
            VulnerabilityConfig::default(),
            1000,
        )
    }

    #[test]
    fn status_only_moves_forward() {
        use FlowStatus::*;
        assert!(Started.can_transition_to(AwaitingCallback));
        assert!(AwaitingCallback.can_transition_to(Exchanging));
        assert!(Exchanging.can_transition_to(Complete));
        assert!(AwaitingCallback.can_transition_to(Error));
        assert!(!Exchanging.can_transition_to(AwaitingCallback));
        assert!(!AwaitingCallback.can_transition_to(Complete));
        assert!(!Complete.can_transition_to(Error));
        assert!(!Error.can_transition_to(Error));
    }

    #[test]
    fn steps_are_numbered_without_gaps() {
        let mut flow = flow();
        for name in ["a", "b", "c"] {
            flow.push_step(FlowStep::new(name, StepStatus::Complete)).unwrap();
        }
        let numbers: Vec<u32> = flow.steps.iter().map(|s| s.step_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn terminal_flow_rejects_new_steps() {
        let mut flow = flow();
        flow.push_step(FlowStep::new("a", StepStatus::Running)).unwrap();
        flow.mark_failed(FailureKind::Timeout).unwrap();
        assert!(flow.terminal_at.is_some());
        assert!(matches!(
            flow.push_step(FlowStep::new("b", StepStatus::Complete)),
            Err(Error::FlowAlreadyTerminal { .. })
        ));
        assert!(flow.update_step(1, |s| s.status = StepStatus::Complete).is_err());
        assert_eq!(flow.steps.len(), 1);
    }

    #[test]
    fn snapshots_mask_secrets() {
        let snapshot = HttpSnapshot::request(
            "GET",
            "https://app.example/cb?code=abc123&state=xyz",
        )
        .header("Authorization", "Bearer eyJ...")
        .form([("code_verifier", "v3r1f13r"), ("grant_type", "authorization_code")]);

        assert!(!snapshot.url.contains("abc123"));
        assert!(snapshot.url.contains("state=xyz"));
        assert_eq!(snapshot.headers["Authorization"], REDACTED);
        let body = snapshot.body.unwrap();
        assert_eq!(body["code_verifier"], REDACTED);
        assert_eq!(body["grant_type"], "authorization_code");

        let response = HttpSnapshot::response(200).json(serde_json::json!({
            "access_token": "at",
            "token_type": "Bearer",
            "id_token": null,
        }));
        let body = response.body.unwrap();
        assert_eq!(body["access_token"], REDACTED);
        assert_eq!(body["token_type"], "Bearer");
        assert!(body["id_token"].is_null());
    }

    #[test]
    fn serialized_flow_hides_pkce_and_nonce() {
        let mut flow = flow();
        flow.pkce = Some(PkcePair::generate_default());
        flow.nonce = Some("n0nce".into());
        let json = serde_json::to_string(&flow).unwrap();
        assert!(!json.contains("n0nce"));
        assert!(!json.contains(flow.pkce.as_ref().unwrap().verifier().expose().as_str()));
        assert!(json.contains("\"status\":\"started\""));
    }
}
