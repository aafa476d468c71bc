//! Execution lifecycle observer
//!
//! An [`ExecutionObserver`] receives callbacks for node lifecycle, per-item
//! processing, retries, queue depth, drops, and circuit-breaker transitions.
//! Callbacks are synchronous and invoked on the hot path; implementations
//! should hand anything expensive off to a channel.
//!
//! Every method has a no-op default, so an observer implements only what it
//! cares about.

use crate::breaker::BreakerState;
use crate::error::PipelineError;
use crate::graph::NodeId;
use crate::strategy::QueuePolicy;
use std::time::Duration;

/// Receiver of execution lifecycle events.
pub trait ExecutionObserver: Send + Sync + 'static {
    /// A node's task started.
    fn on_node_started(&self, _node: &NodeId) {}

    /// A node's task finished (successfully or not).
    fn on_node_completed(&self, _node: &NodeId) {}

    /// Item processing began.
    fn on_item_start(&self, _node: &NodeId) {}

    /// Item processing finished successfully.
    fn on_item_end(&self, _node: &NodeId) {}

    /// Item processing failed (before any retry decision).
    fn on_item_failure(&self, _node: &NodeId, _error: &PipelineError) {}

    /// A failed item is about to be retried after `delay`.
    fn on_retry(&self, _node: &NodeId, _attempt: u32, _delay: Duration) {}

    /// A parallel strategy's internal queue depth changed.
    fn on_queue_depth(&self, _node: &NodeId, _depth: usize) {}

    /// An item was discarded by a queue overflow policy.
    fn on_item_dropped(&self, _node: &NodeId, _policy: QueuePolicy) {}

    /// A circuit breaker changed state.
    fn on_circuit_transition(&self, _node: &NodeId, _from: BreakerState, _to: BreakerState) {}
}

/// Observer that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {}
