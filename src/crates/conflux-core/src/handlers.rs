//! Error pipeline: per-item handlers, pipeline handlers, dead-letter routing
//!
//! Failures climb a two-stage ladder. A failed item first reaches the node's
//! [`NodeErrorHandler`], which may discard it ([`ItemDecision::Skip`]), route
//! it to the dead-letter sink ([`ItemDecision::DeadLetter`]), or escalate
//! ([`ItemDecision::Fail`]). Escalated failures reach the
//! [`PipelineErrorHandler`], which decides the fate of the whole run:
//! fail it, drop the node and keep going, or restart the node.
//!
//! Two error classes never enter the ladder: cancellations always propagate,
//! and a circuit-breaker fail-fast cannot be recovered by `RestartNode`
//! (restarting a tripped node would spin against the open breaker).

use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::error::{BoxError, PipelineError};
use crate::graph::NodeId;

/// Tracing target for error routing.
pub(crate) const TRACING_TARGET: &str = "conflux_core::handlers";

/// Decision for a single failed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemDecision {
    /// Discard the item and continue the stream.
    Skip,
    /// Forward the item to the dead-letter sink and continue.
    DeadLetter {
        /// Why the item could not be processed.
        reason: String,
    },
    /// Escalate to the pipeline error handler.
    Fail,
}

/// Decision for a node whose failure was not recovered per item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineDecision {
    /// Abort the run; the failure surfaces to the caller.
    FailPipeline,
    /// Close the node's downstream edges and treat it as complete.
    ContinueWithoutNode,
    /// Re-enter the node's processing loop.
    RestartNode,
}

/// Per-node, per-item error handler.
#[async_trait]
pub trait NodeErrorHandler: Send + Sync + 'static {
    /// Decide what to do with one failed item.
    async fn on_item_failure(
        &self,
        node: &NodeId,
        error: &PipelineError,
        ctx: &Context,
    ) -> ItemDecision;
}

/// Pipeline-level error handler.
#[async_trait]
pub trait PipelineErrorHandler: Send + Sync + 'static {
    /// Decide what to do after a node failure escalated past item handling.
    async fn on_node_failure(
        &self,
        node: &NodeId,
        error: &PipelineError,
        ctx: &Context,
    ) -> PipelineDecision;
}

/// Node handler that skips every failed item.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkipAll;

#[async_trait]
impl NodeErrorHandler for SkipAll {
    async fn on_item_failure(
        &self,
        node: &NodeId,
        error: &PipelineError,
        _ctx: &Context,
    ) -> ItemDecision {
        tracing::debug!(target: TRACING_TARGET, node = %node, error = %error, "skipping failed item");
        ItemDecision::Skip
    }
}

/// Node handler that dead-letters every failed item with a fixed reason.
#[derive(Debug, Clone)]
pub struct DeadLetterAll {
    reason: String,
}

impl DeadLetterAll {
    /// Dead-letter with the given reason.
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl NodeErrorHandler for DeadLetterAll {
    async fn on_item_failure(
        &self,
        _node: &NodeId,
        _error: &PipelineError,
        _ctx: &Context,
    ) -> ItemDecision {
        ItemDecision::DeadLetter {
            reason: self.reason.clone(),
        }
    }
}

/// Node handler built from a closure.
pub struct NodeHandlerFn<F>(pub F);

#[async_trait]
impl<F> NodeErrorHandler for NodeHandlerFn<F>
where
    F: Fn(&NodeId, &PipelineError) -> ItemDecision + Send + Sync + 'static,
{
    async fn on_item_failure(
        &self,
        node: &NodeId,
        error: &PipelineError,
        _ctx: &Context,
    ) -> ItemDecision {
        (self.0)(node, error)
    }
}

/// Pipeline handler that always fails the run. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailFast;

#[async_trait]
impl PipelineErrorHandler for FailFast {
    async fn on_node_failure(
        &self,
        _node: &NodeId,
        _error: &PipelineError,
        _ctx: &Context,
    ) -> PipelineDecision {
        PipelineDecision::FailPipeline
    }
}

/// Pipeline handler that always restarts the failing node.
///
/// Restarts still respect the node's circuit breaker: once the breaker
/// opens, the restart fails fast and the run surfaces the breaker error.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysRestart;

#[async_trait]
impl PipelineErrorHandler for AlwaysRestart {
    async fn on_node_failure(
        &self,
        node: &NodeId,
        error: &PipelineError,
        _ctx: &Context,
    ) -> PipelineDecision {
        tracing::warn!(target: TRACING_TARGET, node = %node, error = %error, "restarting node");
        PipelineDecision::RestartNode
    }
}

/// Pipeline handler that drops the failing node and keeps the run alive.
#[derive(Debug, Default, Clone, Copy)]
pub struct DropFailingNode;

#[async_trait]
impl PipelineErrorHandler for DropFailingNode {
    async fn on_node_failure(
        &self,
        node: &NodeId,
        error: &PipelineError,
        _ctx: &Context,
    ) -> PipelineDecision {
        tracing::warn!(target: TRACING_TARGET, node = %node, error = %error, "continuing without node");
        PipelineDecision::ContinueWithoutNode
    }
}

/// An item the pipeline could not process, en route to the dead-letter sink.
pub struct DeadLetter {
    /// Node that failed to process the item.
    pub node: NodeId,
    /// Handler-supplied reason.
    pub reason: String,
    /// Debug rendering of the item.
    pub rendered: String,
    item: Box<dyn Any + Send>,
}

impl DeadLetter {
    pub(crate) fn new(
        node: NodeId,
        reason: String,
        rendered: String,
        item: Box<dyn Any + Send>,
    ) -> Self {
        Self {
            node,
            reason,
            rendered,
            item,
        }
    }

    /// Recover the typed item, if `T` matches.
    pub fn downcast<T: 'static>(self) -> Option<T> {
        self.item.downcast::<T>().ok().map(|b| *b)
    }

    /// Borrow the typed item, if `T` matches.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.item.downcast_ref::<T>()
    }
}

impl fmt::Debug for DeadLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetter")
            .field("node", &self.node)
            .field("reason", &self.reason)
            .field("rendered", &self.rendered)
            .finish()
    }
}

/// Terminal destination for items the pipeline cannot process.
#[async_trait]
pub trait DeadLetterSink: Send + Sync + 'static {
    /// Accept one dead-lettered item.
    async fn send(&self, letter: DeadLetter, ctx: &Context) -> Result<(), BoxError>;
}

/// In-memory dead-letter sink, mainly for tests and local runs.
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterSink {
    /// New, empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed snapshot of `(item, reason)` pairs matching `T`.
    pub fn typed_items<T: Clone + 'static>(&self) -> Vec<(T, String)> {
        self.letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|l| l.downcast_ref::<T>().map(|i| (i.clone(), l.reason.clone())))
            .collect()
    }

    /// Number of letters received.
    pub fn len(&self) -> usize {
        self.letters.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// True when nothing was dead-lettered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn send(&self, letter: DeadLetter, _ctx: &Context) -> Result<(), BoxError> {
        self.letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(letter);
        Ok(())
    }
}

/// Frozen error-handling configuration for a graph.
#[derive(Clone, Default)]
pub struct ErrorOptions {
    /// Pipeline-level handler; [`FailFast`] semantics when absent.
    pub pipeline_handler: Option<Arc<dyn PipelineErrorHandler>>,
    /// Default per-item handler for nodes without their own.
    pub node_handler: Option<Arc<dyn NodeErrorHandler>>,
    /// Destination for dead-lettered items.
    pub dead_letter: Option<Arc<dyn DeadLetterSink>>,
}

impl fmt::Debug for ErrorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorOptions")
            .field("pipeline_handler", &self.pipeline_handler.is_some())
            .field("node_handler", &self.node_handler.is_some())
            .field("dead_letter", &self.dead_letter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_downcast() {
        let letter = DeadLetter::new(
            NodeId::from("parse"),
            "even".into(),
            "2".into(),
            Box::new(2_i64),
        );
        assert_eq!(letter.downcast_ref::<i64>(), Some(&2));
        assert!(letter.downcast_ref::<String>().is_none());
        assert_eq!(letter.downcast::<i64>(), Some(2));
    }

    #[tokio::test]
    async fn test_memory_sink_typed_items() {
        let sink = MemoryDeadLetterSink::new();
        let ctx = Context::new();
        for n in [2_i64, 4] {
            sink.send(
                DeadLetter::new(NodeId::from("t"), "even".into(), n.to_string(), Box::new(n)),
                &ctx,
            )
            .await
            .unwrap();
        }
        assert_eq!(sink.typed_items::<i64>(), vec![(2, "even".into()), (4, "even".into())]);
        assert!(sink.typed_items::<String>().is_empty());
    }
}
