//! Flow step events
//!
//! The orchestrator emits every appended or updated step while it holds the
//! flow lock, so per-flow order matches step order. `emit` must never block:
//! sinks buffer or drop.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::model::FlowStep;

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct FlowEvent {
    pub flow_id: String,
    pub step: FlowStep,
}

/// Receives flow events. Implementations must return promptly.
pub trait FlowEventSink: Send + Sync {
    fn emit(&self, event: FlowEvent);

    /// The flow will emit nothing more.
    fn close(&self, _flow_id: &str) {}
}

/// What a full per-flow buffer gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Overwrite the oldest buffered event; slow observers see a lag.
    #[default]
    DropOldest,
    /// Discard the incoming event.
    DropNewest,
}

/// One bounded broadcast channel per flow.
pub struct BroadcastEventSink {
    channels: DashMap<String, broadcast::Sender<FlowEvent>>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY, OverflowPolicy::default())
    }
}

impl BroadcastEventSink {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    /// Observe events for `flow_id` from now on.
    pub fn subscribe(&self, flow_id: &str) -> broadcast::Receiver<FlowEvent> {
        self.channels
            .entry(flow_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }
}

impl FlowEventSink for BroadcastEventSink {
    fn emit(&self, event: FlowEvent) {
        // Nobody subscribed yet: nothing to deliver.
        let Some(sender) = self.channels.get(&event.flow_id) else {
            return;
        };

        if sender.len() >= self.capacity {
            metrics::counter!("oauth_flow_events_dropped_total").increment(1);
            if self.policy == OverflowPolicy::DropNewest {
                debug!(flow_id = %event.flow_id, step = event.step.step_number, "event buffer full, dropping newest");
                return;
            }
            debug!(flow_id = %event.flow_id, "event buffer full, overwriting oldest");
        }

        // Err only means every receiver is gone.
        let _ = sender.send(event);
    }

    fn close(&self, flow_id: &str) {
        self.channels.remove(flow_id);
    }
}

/// Logs every step.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl FlowEventSink for TracingEventSink {
    fn emit(&self, event: FlowEvent) {
        info!(
            flow_id = %event.flow_id,
            step = event.step.step_number,
            name = %event.step.name,
            status = ?event.step.status,
            failure = event.step.failure.map(|k| k.as_str()).unwrap_or(""),
            "flow step"
        );
    }
}

/// Forward to several sinks in order.
#[derive(Default, Clone)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn FlowEventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<Arc<dyn FlowEventSink>>) -> Self {
        Self { sinks }
    }
}

impl FlowEventSink for FanoutEventSink {
    fn emit(&self, event: FlowEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }

    fn close(&self, flow_id: &str) {
        for sink in &self.sinks {
            sink.close(flow_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepStatus;
    use tokio::sync::broadcast::error::TryRecvError;

    fn event(flow_id: &str, n: u32) -> FlowEvent {
        let mut step = FlowStep::new(&format!("step {n}"), StepStatus::Complete);
        step.step_number = n;
        FlowEvent {
            flow_id: flow_id.to_string(),
            step,
        }
    }

    #[test]
    fn events_arrive_in_order_per_flow() {
        let sink = BroadcastEventSink::default();
        let mut a = sink.subscribe("flow_a");
        let mut b = sink.subscribe("flow_b");

        for n in 1..=3 {
            sink.emit(event("flow_a", n));
        }
        sink.emit(event("flow_b", 1));

        let seen: Vec<u32> = (0..3).map(|_| a.try_recv().unwrap().step.step_number).collect();
        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(b.try_recv().unwrap().flow_id, "flow_b");
        assert!(matches!(b.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn drop_newest_keeps_the_buffered_events() {
        let sink = BroadcastEventSink::new(2, OverflowPolicy::DropNewest);
        let mut rx = sink.subscribe("flow_a");
        for n in 1..=4 {
            sink.emit(event("flow_a", n));
        }
        assert_eq!(rx.try_recv().unwrap().step.step_number, 1);
        assert_eq!(rx.try_recv().unwrap().step.step_number, 2);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn drop_oldest_lags_slow_observer() {
        let sink = BroadcastEventSink::new(2, OverflowPolicy::DropOldest);
        let mut rx = sink.subscribe("flow_a");
        for n in 1..=4 {
            sink.emit(event("flow_a", n));
        }
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Lagged(2))));
        assert_eq!(rx.try_recv().unwrap().step.step_number, 3);
        assert_eq!(rx.try_recv().unwrap().step.step_number, 4);
    }

    #[test]
    fn close_ends_the_stream() {
        let sink = BroadcastEventSink::default();
        let mut rx = sink.subscribe("flow_a");
        sink.emit(event("flow_a", 1));
        sink.close("flow_a");
        assert_eq!(rx.try_recv().unwrap().step.step_number, 1);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Closed)));
        assert_eq!(sink.open_channels(), 0);
    }

    #[test]
    fn emit_without_subscribers_is_a_no_op() {
        let sink = BroadcastEventSink::default();
        sink.emit(event("flow_x", 1));
        assert_eq!(sink.open_channels(), 0);
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(BroadcastEventSink::default());
        let b = Arc::new(BroadcastEventSink::default());
        let mut rx_a = a.subscribe("f");
        let mut rx_b = b.subscribe("f");
        let sinks: Vec<Arc<dyn FlowEventSink>> = vec![a.clone(), b.clone(), Arc::new(TracingEventSink)];
        let fanout = FanoutEventSink::new(sinks);
        fanout.emit(event("f", 1));
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }
}
