//! Execution strategies: Sequential, Parallel, Resilient
//!
//! A strategy decides how a node's item processing is driven:
//!
//! - **Sequential** processes items one at a time in stream order — the only
//!   strategy that preserves arrival order end to end.
//! - **Parallel** runs up to `max_degree` cooperative workers over an
//!   internal bounded queue with a configurable overflow policy; outputs are
//!   either reassembled by sequence number (`Preserve`) or emitted as they
//!   complete (`Unordered`).
//! - **Resilient** wraps another strategy and adds per-item retry, the
//!   circuit breaker, the per-item timeout, and the error-handler ladder.
//!
//! Workers are plain futures joined inside the node's own task, so a
//! Parallel node overlaps its awaits without assuming user nodes are
//! thread-safe beyond `Sync`.
//!
//! # Examples
//!
//! ```rust
//! use conflux_core::strategy::{ExecutionStrategy, OutputOrdering, ParallelOptions};
//!
//! let strategy = ExecutionStrategy::resilient(ExecutionStrategy::parallel(
//!     ParallelOptions::new(8).with_ordering(OutputOrdering::Unordered),
//! ));
//! assert!(strategy.is_resilient());
//! ```

use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::breaker::BreakerRegistry;
use crate::context::Context;
use crate::diagnostics;
use crate::erased::{AnyTransform, Envelope, FanError, OutputFan};
use crate::error::{PipelineError, Result};
use crate::graph::NodeId;
use crate::handlers::{DeadLetter, DeadLetterSink, ItemDecision, NodeErrorHandler};
use crate::observer::ExecutionObserver;
use crate::retry::RetryPolicy;

/// Tracing target for strategy drivers.
pub(crate) const TRACING_TARGET: &str = "conflux_core::strategy";

/// Output ordering of a parallel strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputOrdering {
    /// Reassemble outputs in input order by sequence number.
    #[default]
    Preserve,
    /// Emit outputs in completion order.
    Unordered,
}

/// Overflow policy of a parallel strategy's internal queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    /// Block the intake (and transitively the producer) until space frees.
    #[default]
    Block,
    /// Drop the oldest queued item to admit the new one.
    DropOldest,
    /// Drop the incoming item.
    DropNewest,
}

/// Configuration for the Parallel strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelOptions {
    /// Number of cooperative workers.
    pub max_degree: usize,
    /// Output ordering.
    pub ordering: OutputOrdering,
    /// Queue overflow policy.
    pub queue_policy: QueuePolicy,
    /// Internal queue capacity.
    pub queue_capacity: usize,
}

impl ParallelOptions {
    /// Options with `max_degree` workers and defaults otherwise
    /// (order-preserving, blocking queue of `2 * max_degree`).
    pub fn new(max_degree: usize) -> Self {
        let degree = max_degree.max(1);
        Self {
            max_degree: degree,
            ordering: OutputOrdering::default(),
            queue_policy: QueuePolicy::default(),
            queue_capacity: degree * 2,
        }
    }

    /// Set the output ordering.
    pub fn with_ordering(mut self, ordering: OutputOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Set the queue overflow policy.
    pub fn with_queue_policy(mut self, policy: QueuePolicy) -> Self {
        self.queue_policy = policy;
        self
    }

    /// Set the internal queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self::new(4)
    }
}

/// How a node's item processing is driven.
#[derive(Debug, Clone)]
pub enum ExecutionStrategy {
    /// One item at a time, in stream order. The default.
    Sequential,
    /// Bounded worker pool.
    Parallel(ParallelOptions),
    /// Retry, circuit breaking, and timeouts around an inner strategy.
    Resilient(Box<ExecutionStrategy>),
}

impl ExecutionStrategy {
    /// The sequential strategy.
    pub fn sequential() -> Self {
        ExecutionStrategy::Sequential
    }

    /// A parallel strategy with the given options.
    pub fn parallel(options: ParallelOptions) -> Self {
        ExecutionStrategy::Parallel(options)
    }

    /// Wrap `inner` with the resilience layer.
    pub fn resilient(inner: ExecutionStrategy) -> Self {
        ExecutionStrategy::Resilient(Box::new(inner))
    }

    /// True when the resilience layer applies at any wrapping depth.
    pub fn is_resilient(&self) -> bool {
        matches!(self, ExecutionStrategy::Resilient(_))
    }

    /// Innermost driver plus whether resilience wraps it.
    pub(crate) fn resolve(&self) -> (DriverKind, bool) {
        match self {
            ExecutionStrategy::Sequential => (DriverKind::Sequential, false),
            ExecutionStrategy::Parallel(options) => (DriverKind::Parallel(options.clone()), false),
            ExecutionStrategy::Resilient(inner) => {
                let (driver, _) = inner.resolve();
                (driver, true)
            }
        }
    }
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        ExecutionStrategy::Sequential
    }
}

/// Innermost driver shape after unwrapping `Resilient`.
#[derive(Debug, Clone)]
pub(crate) enum DriverKind {
    Sequential,
    Parallel(ParallelOptions),
}

/// Metrics snapshot a parallel driver publishes under
/// [`diagnostics::parallel_metrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParallelMetrics {
    /// Items accepted from the input edge.
    pub enqueued: u64,
    /// Items handed to workers.
    pub dequeued: u64,
    /// Items discarded by the overflow policy.
    pub dropped: u64,
}

/// Outcome of processing one item.
pub(crate) enum ProcessOutcome {
    /// Outputs ready for the fan.
    Emitted(Vec<Envelope>),
    /// Item consumed without output (skip, dead-letter, empty flat-map is
    /// *not* this — that is `Emitted(vec![])`).
    Recovered,
    /// Unrecovered failure for the node task to act on.
    Escalate(PipelineError),
}

/// How a driver loop ended.
#[derive(Debug)]
pub(crate) enum DriverExit {
    /// Input exhausted (or downstream fully closed).
    Finished,
    /// A failure escalated past item-level recovery.
    Escalated(PipelineError),
}

/// Everything needed to process one item of one node.
///
/// Shared by the sequential driver and every parallel worker. Borrows the
/// erased node so the owning task can reclaim `&mut` access for disposal
/// once the drive is over.
pub(crate) struct ItemPipeline<'a> {
    pub node: NodeId,
    pub transform: &'a dyn AnyTransform,
    pub retry: RetryPolicy,
    pub resilient: bool,
    pub breaker: Arc<BreakerRegistry>,
    pub node_handler: Option<Arc<dyn NodeErrorHandler>>,
    pub dead_letter: Option<Arc<dyn DeadLetterSink>>,
    pub observer: Option<Arc<dyn ExecutionObserver>>,
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
    pub ctx: Context,
}

impl ItemPipeline<'_> {
    /// Process one item through timeout, retry, breaker, and the item-level
    /// error handler.
    pub(crate) async fn process(&self, env: &Envelope) -> ProcessOutcome {
        if let Some(observer) = &self.observer {
            observer.on_item_start(&self.node);
        }
        let mut delays = self.retry.delays();
        let mut attempts: u32 = 0;
        let failure = loop {
            if self.resilient {
                if let Err(open) = self.breaker.admit(&self.node) {
                    // Fail-fast: breaker errors never enter the handler ladder.
                    return ProcessOutcome::Escalate(open);
                }
            }
            attempts += 1;
            match self.invoke_once(env).await {
                Ok(outputs) => {
                    if self.resilient {
                        self.breaker.record_success(&self.node);
                    }
                    if let Some(observer) = &self.observer {
                        observer.on_item_end(&self.node);
                    }
                    return ProcessOutcome::Emitted(outputs);
                }
                Err(error) if error.is_cancellation() => {
                    return ProcessOutcome::Escalate(PipelineError::Cancelled);
                }
                Err(error) => {
                    if self.resilient {
                        self.breaker.record_failure(&self.node);
                    }
                    self.count_failure();
                    if let Some(observer) = &self.observer {
                        observer.on_item_failure(&self.node, &error);
                    }
                    if self.resilient && self.retry.should_retry(attempts) {
                        let delay = delays.next_delay(attempts);
                        tracing::warn!(
                            target: TRACING_TARGET,
                            node = %self.node,
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "item failed, retrying after delay"
                        );
                        if let Some(observer) = &self.observer {
                            observer.on_retry(&self.node, attempts, delay);
                        }
                        self.count_retry();
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => {
                                return ProcessOutcome::Escalate(PipelineError::Cancelled);
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                    break error;
                }
            }
        };
        let failure = if attempts > 1 {
            PipelineError::RetryExhausted {
                node: self.node.to_string(),
                attempts,
                source: Box::new(failure),
            }
        } else {
            failure
        };
        self.decide(env, failure).await
    }

    async fn invoke_once(&self, env: &Envelope) -> Result<Vec<Envelope>> {
        let apply = self.transform.apply(env, &self.ctx);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
            result = async {
                match self.timeout {
                    Some(limit) => match tokio::time::timeout(limit, apply).await {
                        Ok(result) => result,
                        Err(_) => Err(PipelineError::Timeout {
                            node: self.node.to_string(),
                            timeout_ms: limit.as_millis() as u64,
                        }),
                    },
                    None => apply.await,
                }
            } => result,
        }
    }

    /// Run the item-level handler ladder on an unrecovered failure.
    async fn decide(&self, env: &Envelope, error: PipelineError) -> ProcessOutcome {
        let Some(handler) = &self.node_handler else {
            return ProcessOutcome::Escalate(error);
        };
        match handler.on_item_failure(&self.node, &error, &self.ctx).await {
            ItemDecision::Skip => ProcessOutcome::Recovered,
            ItemDecision::Fail => ProcessOutcome::Escalate(error),
            ItemDecision::DeadLetter { reason } => {
                self.route_dead_letter(env, reason).await;
                ProcessOutcome::Recovered
            }
        }
    }

    async fn route_dead_letter(&self, env: &Envelope, reason: String) {
        let Some(sink) = &self.dead_letter else {
            tracing::warn!(
                target: TRACING_TARGET,
                node = %self.node,
                "handler requested dead-letter but no dead-letter sink is configured; dropping item"
            );
            return;
        };
        let cloner = self.transform.in_cloner();
        let Some(clone) = env.try_clone(&cloner) else {
            tracing::warn!(
                target: TRACING_TARGET,
                node = %self.node,
                "failed to clone item for dead-letter routing; dropping item"
            );
            return;
        };
        let letter = DeadLetter::new(
            self.node.clone(),
            reason,
            (self.transform.renderer())(env),
            clone.data,
        );
        if let Err(err) = sink.send(letter, &self.ctx).await {
            tracing::warn!(
                target: TRACING_TARGET,
                node = %self.node,
                error = %err,
                "dead-letter sink rejected item"
            );
        }
    }

    fn count_failure(&self) {
        let key = diagnostics::resilience_failures(&self.node);
        self.ctx.update_item(&key, |v| {
            serde_json::Value::from(v.and_then(|v| v.as_u64()).unwrap_or(0) + 1)
        });
    }

    fn count_retry(&self) {
        let key = diagnostics::retry_events(&self.node);
        self.ctx.update_item(&key, |v| {
            serde_json::Value::from(v.and_then(|v| v.as_u64()).unwrap_or(0) + 1)
        });
    }
}

/// Sequential driver: pull, process, fan out, in order.
pub(crate) async fn drive_sequential(
    pipeline: &ItemPipeline<'_>,
    rx: &mut mpsc::Receiver<Envelope>,
    fan: &mut OutputFan,
) -> DriverExit {
    loop {
        let env = tokio::select! {
            biased;
            _ = pipeline.cancel.cancelled() => {
                return DriverExit::Escalated(PipelineError::Cancelled);
            }
            received = rx.recv() => match received {
                Some(env) => env,
                None => return DriverExit::Finished,
            },
        };
        match pipeline.process(&env).await {
            ProcessOutcome::Recovered => {}
            ProcessOutcome::Escalate(error) => return DriverExit::Escalated(error),
            ProcessOutcome::Emitted(outputs) => {
                for out in outputs {
                    match fan.send(out).await {
                        Ok(()) => {}
                        Err(FanError::Cancelled) => {
                            return DriverExit::Escalated(PipelineError::Cancelled);
                        }
                        // Every consumer is gone; nothing left to produce for.
                        Err(FanError::Closed) => return DriverExit::Finished,
                    }
                }
            }
        }
    }
}

struct EmitState<'a> {
    fan: &'a mut OutputFan,
    ordering: OutputOrdering,
    next_seq: u64,
    pending: BTreeMap<u64, Vec<Envelope>>,
    closed: bool,
}

impl EmitState<'_> {
    async fn emit(&mut self, seq: u64, outputs: Vec<Envelope>) -> Result<()> {
        match self.ordering {
            OutputOrdering::Unordered => self.send_all(outputs).await,
            OutputOrdering::Preserve => {
                self.pending.insert(seq, outputs);
                while let Some(ready) = self.pending.remove(&self.next_seq) {
                    self.next_seq += 1;
                    self.send_all(ready).await?;
                }
                Ok(())
            }
        }
    }

    async fn send_all(&mut self, outputs: Vec<Envelope>) -> Result<()> {
        for out in outputs {
            match self.fan.send(out).await {
                Ok(()) => {}
                Err(FanError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(FanError::Closed) => {
                    self.closed = true;
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

/// Parallel driver: bounded intake queue feeding cooperative workers.
///
/// Workers are futures joined inside the calling task; concurrency is
/// cooperative, so user transforms overlap on their awaits rather than on
/// threads.
pub(crate) async fn drive_parallel(
    pipeline: &ItemPipeline<'_>,
    options: &ParallelOptions,
    rx: &mut mpsc::Receiver<Envelope>,
    fan: &mut OutputFan,
) -> DriverExit {
    let (queue_tx, queue_rx) = mpsc::channel::<Envelope>(options.queue_capacity);
    let queue_rx = tokio::sync::Mutex::new(queue_rx);
    let emit = tokio::sync::Mutex::new(EmitState {
        fan,
        ordering: options.ordering,
        next_seq: 0,
        pending: BTreeMap::new(),
        closed: false,
    });
    let stop = CancellationToken::new();
    let escalation: std::sync::Mutex<Option<PipelineError>> = std::sync::Mutex::new(None);
    let enqueued = AtomicU64::new(0);
    let dequeued = AtomicU64::new(0);
    let dropped = AtomicU64::new(0);
    let seq = AtomicU64::new(0);

    let escalate = |error: PipelineError| {
        let mut slot = escalation.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(error);
        }
        stop.cancel();
    };

    let intake = async {
        'intake: loop {
            let env = tokio::select! {
                biased;
                _ = pipeline.cancel.cancelled() => {
                    escalate(PipelineError::Cancelled);
                    break;
                }
                _ = stop.cancelled() => break,
                received = rx.recv() => match received {
                    Some(env) => env,
                    None => break,
                },
            };
            enqueued.fetch_add(1, AtomicOrdering::Relaxed);
            match options.queue_policy {
                QueuePolicy::Block => {
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => break,
                        sent = queue_tx.send(env) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                QueuePolicy::DropNewest => match queue_tx.try_send(env) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        dropped.fetch_add(1, AtomicOrdering::Relaxed);
                        if let Some(observer) = &pipeline.observer {
                            observer.on_item_dropped(&pipeline.node, QueuePolicy::DropNewest);
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                },
                QueuePolicy::DropOldest => {
                    let mut pending = env;
                    loop {
                        match queue_tx.try_send(pending) {
                            Ok(()) => break,
                            Err(mpsc::error::TrySendError::Full(back)) => {
                                pending = back;
                                // Evict the head to admit the newcomer.
                                let _ = queue_rx.lock().await.try_recv();
                                dropped.fetch_add(1, AtomicOrdering::Relaxed);
                                if let Some(observer) = &pipeline.observer {
                                    observer.on_item_dropped(&pipeline.node, QueuePolicy::DropOldest);
                                }
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => break 'intake,
                        }
                    }
                }
            }
            if let Some(observer) = &pipeline.observer {
                let depth = options.queue_capacity - queue_tx.capacity();
                observer.on_queue_depth(&pipeline.node, depth);
            }
        }
        // Dropping the sender closes the queue and lets the workers finish.
        drop(queue_tx);
    };

    let workers = (0..options.max_degree).map(|_| {
        let queue_rx = &queue_rx;
        let emit = &emit;
        let stop = &stop;
        let escalate = &escalate;
        let seq = &seq;
        let dequeued = &dequeued;
        async move {
            loop {
                let (item_seq, env) = {
                    let mut rx = queue_rx.lock().await;
                    let received = tokio::select! {
                        biased;
                        _ = stop.cancelled() => return,
                        received = rx.recv() => received,
                    };
                    match received {
                        Some(env) => (seq.fetch_add(1, AtomicOrdering::Relaxed), env),
                        None => return,
                    }
                };
                dequeued.fetch_add(1, AtomicOrdering::Relaxed);
                match pipeline.process(&env).await {
                    ProcessOutcome::Recovered => {
                        // Order-preserving emission must still advance past
                        // the consumed sequence number.
                        let mut emit = emit.lock().await;
                        if let Err(error) = emit.emit(item_seq, Vec::new()).await {
                            escalate(error);
                            return;
                        }
                        if emit.closed {
                            stop.cancel();
                            return;
                        }
                    }
                    ProcessOutcome::Emitted(outputs) => {
                        let mut emit = emit.lock().await;
                        if let Err(error) = emit.emit(item_seq, outputs).await {
                            escalate(error);
                            return;
                        }
                        if emit.closed {
                            stop.cancel();
                            return;
                        }
                    }
                    ProcessOutcome::Escalate(error) => {
                        escalate(error);
                        return;
                    }
                }
            }
        }
    });

    futures::join!(intake, join_all(workers));

    let metrics = ParallelMetrics {
        enqueued: enqueued.load(AtomicOrdering::Relaxed),
        dequeued: dequeued.load(AtomicOrdering::Relaxed),
        dropped: dropped.load(AtomicOrdering::Relaxed),
    };
    if let Ok(snapshot) = serde_json::to_value(&metrics) {
        pipeline
            .ctx
            .set_item(diagnostics::parallel_metrics(&pipeline.node), snapshot);
    }

    let escalated = escalation
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    match escalated {
        Some(error) => DriverExit::Escalated(error),
        None => DriverExit::Finished,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_resolution() {
        let (driver, resilient) = ExecutionStrategy::sequential().resolve();
        assert!(matches!(driver, DriverKind::Sequential));
        assert!(!resilient);

        let strategy = ExecutionStrategy::resilient(ExecutionStrategy::parallel(
            ParallelOptions::new(3),
        ));
        let (driver, resilient) = strategy.resolve();
        assert!(matches!(driver, DriverKind::Parallel(ref o) if o.max_degree == 3));
        assert!(resilient);

        // Double wrapping stays resilient and keeps the inner driver.
        let strategy = ExecutionStrategy::resilient(strategy);
        let (driver, resilient) = strategy.resolve();
        assert!(matches!(driver, DriverKind::Parallel(_)));
        assert!(resilient);
    }

    #[test]
    fn test_parallel_options_defaults() {
        let options = ParallelOptions::default();
        assert_eq!(options.max_degree, 4);
        assert_eq!(options.queue_capacity, 8);
        assert_eq!(options.ordering, OutputOrdering::Preserve);
        assert_eq!(options.queue_policy, QueuePolicy::Block);

        // Degree is clamped to at least one worker.
        assert_eq!(ParallelOptions::new(0).max_degree, 1);
    }
}
