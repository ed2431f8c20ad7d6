//! Single-use CSRF state registry
//!
//! Every authorization request gets an unguessable `state` bound to its flow.
//! The callback must present it back exactly once. Records live in a sharded
//! map: `consume` performs its check-and-mark while holding the shard lock for
//! that one key, so two concurrent callbacks carrying the same value cannot
//! both succeed, and unrelated flows never contend on one global lock.
//!
//! Record lifecycle is independent of the flow that owns it: the sweeper drops
//! records once they have been expired or used for longer than the retention
//! window, whether or not the flow still exists.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::FailureKind;
use dashmap::DashMap;
use rand::RngExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::constants::{DEFAULT_STATE_RETENTION_SECS, DEFAULT_STATE_TTL_SECS, STATE_ENTROPY_BYTES};

/// Why a state value was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("state value not recognised")]
    NotFound,

    #[error("state value expired")]
    Expired,

    #[error("state value belongs to a different flow")]
    FlowMismatch,

    #[error("state value already used")]
    AlreadyUsed,
}

impl StateError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StateError::NotFound => FailureKind::StateNotFound,
            StateError::Expired => FailureKind::StateExpired,
            StateError::FlowMismatch => FailureKind::StateFlowMismatch,
            StateError::AlreadyUsed => FailureKind::StateAlreadyUsed,
        }
    }
}

/// An issued state value.
#[derive(Debug, Clone)]
pub struct StateRecord {
    pub value: String,
    /// Back-reference to the owning flow, not ownership.
    pub flow_id: String,
    pub used: bool,
    pub created_at: Instant,
    pub expires_at: Instant,
    pub used_at: Option<Instant>,
}

impl StateRecord {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    /// Point after which the record only serves to report late replays.
    fn retired_at(&self) -> Instant {
        match self.used_at {
            Some(used_at) => used_at.min(self.expires_at),
            None => self.expires_at,
        }
    }
}

/// Registry of outstanding state values.
pub struct StateRegistry {
    records: DashMap<String, StateRecord>,
    ttl: Duration,
    retention: Duration,
}

impl Default for StateRegistry {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_STATE_TTL_SECS),
            Duration::from_secs(DEFAULT_STATE_RETENTION_SECS),
        )
    }
}

impl StateRegistry {
    pub fn new(ttl: Duration, retention: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
            retention,
        }
    }

    /// Issue a fresh state value bound to `flow_id`.
    pub fn issue(&self, flow_id: &str) -> StateRecord {
        let now = Instant::now();
        let record = StateRecord {
            value: random_token(),
            flow_id: flow_id.to_owned(),
            used: false,
            created_at: now,
            expires_at: now + self.ttl,
            used_at: None,
        };
        self.records.insert(record.value.clone(), record.clone());
        debug!(flow_id, "state issued");
        record
    }

    /// Generate an OIDC nonce. Nonces are checked against the ID token, not
    /// against this registry, so they are not recorded.
    pub fn issue_nonce(&self) -> String {
        random_token()
    }

    /// Validate and burn `value` for `expected_flow_id`.
    ///
    /// Checks run in order: unknown, expired, wrong flow, already used. Only a
    /// fully successful check marks the record used.
    pub fn consume(&self, value: &str, expected_flow_id: &str) -> Result<(), StateError> {
        let now = Instant::now();
        let mut record = self.records.get_mut(value).ok_or(StateError::NotFound)?;

        if record.is_expired(now) {
            return Err(StateError::Expired);
        }
        if record.flow_id != expected_flow_id {
            warn!(
                expected_flow_id,
                bound_flow_id = %record.flow_id,
                "state presented for the wrong flow"
            );
            return Err(StateError::FlowMismatch);
        }
        if record.used {
            warn!(flow_id = expected_flow_id, "state replay rejected");
            return Err(StateError::AlreadyUsed);
        }

        record.used = true;
        record.used_at = Some(now);
        Ok(())
    }

    /// Look up which flow a state value belongs to without consuming it.
    pub fn flow_id_for(&self, value: &str) -> Option<String> {
        self.records.get(value).map(|r| r.flow_id.clone())
    }

    /// Drop records that have been expired or used for longer than the
    /// retention window. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records.retain(|_, record| {
            let retired = record.used || record.is_expired(now);
            !(retired && now >= record.retired_at() + self.retention)
        });
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!(removed, "swept state records");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// 256-bit random value, base64url without padding.
fn random_token() -> String {
    let mut bytes = [0u8; STATE_ENTROPY_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
