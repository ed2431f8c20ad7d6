//! Authorization Code + PKCE flow orchestration
//!
//! Drives a flow from `start` (authorization URL) through the callback, token
//! exchange and token validation, recording each step for display. State,
//! PKCE and token handling come from `oauth-client`; signature and claim
//! checks from `token-validator`.

pub mod cleanup;
pub mod error;
pub mod events;
pub mod model;
pub mod orchestrator;

#[cfg(test)]
mod testing;

pub use cleanup::{DEFAULT_CLEANUP_INTERVAL, spawn_cleanup_task};
pub use error::{Error, Result};
pub use events::{
    BroadcastEventSink, FanoutEventSink, FlowEvent, FlowEventSink, OverflowPolicy,
    TracingEventSink,
};
pub use model::{
    ClientConfig, Flow, FlowStatus, FlowStep, HttpSnapshot, ServerConfig, StepStatus,
    VulnerabilityConfig,
};
pub use orchestrator::{CleanupReport, Orchestrator, OrchestratorConfig, StartedFlow};
