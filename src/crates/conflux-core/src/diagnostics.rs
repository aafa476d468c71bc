//! Stable diagnostic keys published into the context item map
//!
//! The engine reports runtime metrics through
//! [`Context::item`](crate::context::Context::item) under the keys built
//! here. Key shapes are part of the public surface; tooling may rely on
//! them.

use crate::graph::NodeId;

/// Key for a node's [`ParallelMetrics`](crate::strategy::ParallelMetrics)
/// snapshot: `parallel.metrics::<node>`.
pub fn parallel_metrics(node: &NodeId) -> String {
    format!("parallel.metrics::{node}")
}

/// Key for a node's retry-event count: `retry::<node>`.
pub fn retry_events(node: &NodeId) -> String {
    format!("retry::{node}")
}

/// Key for a node's resilience failure count:
/// `diag.resilience.<node>.failures`.
pub fn resilience_failures(node: &NodeId) -> String {
    format!("diag.resilience.{node}.failures")
}

/// Key for an aggregate's late-item drop count:
/// `diag.window.<node>.late_drops`.
pub fn window_late_drops(node: &NodeId) -> String {
    format!("diag.window.{node}.late_drops")
}
