//! Per-node circuit breaker with a rolling failure window
//!
//! Each resilient node gets a breaker entry in a run-scoped
//! [`BreakerRegistry`]. Failures are recorded with timestamps and pruned to
//! the sampling window; when the window holds `failure_threshold` failures
//! the breaker opens and invocations fail fast with
//! [`PipelineError::CircuitBreakerOpen`] without entering the node. After
//! `open_duration` the next admission becomes a half-open probe: exactly one
//! in-flight call is allowed, success closes the breaker and clears the
//! failure buffer, failure re-opens it and restarts the timer.
//!
//! The registry is scoped to a run (never process-wide, so test runs stay
//! isolated) and garbage-collects entries untouched for longer than the
//! retention period, which bounds its footprint when node ids are transient.
//!
//! Timestamps come from `tokio::time::Instant`, so paused-clock tests drive
//! the breaker deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{PipelineError, Result};
use crate::graph::NodeId;
use crate::observer::ExecutionObserver;

/// Tracing target for breaker transitions.
pub(crate) const TRACING_TARGET: &str = "conflux_core::breaker";

/// Breaker mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls flow through; failures are counted.
    Closed,
    /// Calls fail fast without entering the node.
    Open,
    /// One probe call is allowed through.
    HalfOpen,
}

/// Circuit-breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerOptions {
    /// Failures within the sampling window that trip the breaker.
    pub failure_threshold: usize,
    /// Rolling window over which failures are counted.
    pub sampling_window: Duration,
    /// How long the breaker stays open before probing.
    pub open_duration: Duration,
    /// Idle time after which a node's breaker entry is evicted.
    pub retention: Duration,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            sampling_window: Duration::from_secs(300),
            open_duration: Duration::from_secs(60),
            retention: Duration::from_secs(900),
        }
    }
}

impl BreakerOptions {
    /// Set the trip threshold.
    pub fn with_failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the rolling sampling window.
    pub fn with_sampling_window(mut self, window: Duration) -> Self {
        self.sampling_window = window;
        self
    }

    /// Set the open duration.
    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    /// Set the registry retention period.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Outcome of a successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed; ordinary call.
    Normal,
    /// Half-open probe; the caller's result decides the next state.
    Probe,
}

#[derive(Debug)]
struct BreakerEntry {
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_inflight: bool,
    last_touched: Instant,
}

impl BreakerEntry {
    fn new(now: Instant) -> Self {
        Self {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            probe_inflight: false,
            last_touched: now,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.failures.front() {
            if now.saturating_duration_since(*front) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Run-scoped registry of per-node circuit breakers.
pub struct BreakerRegistry {
    options: BreakerOptions,
    entries: Mutex<HashMap<NodeId, BreakerEntry>>,
    last_sweep: Mutex<Instant>,
    observer: Option<Arc<dyn ExecutionObserver>>,
}

impl BreakerRegistry {
    /// Fresh registry for one run.
    pub fn new(options: BreakerOptions, observer: Option<Arc<dyn ExecutionObserver>>) -> Self {
        Self {
            options,
            entries: Mutex::new(HashMap::new()),
            last_sweep: Mutex::new(Instant::now()),
            observer,
        }
    }

    /// Current state of a node's breaker.
    pub fn state(&self, node: &NodeId) -> BreakerState {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(node)
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Ask to invoke `node`.
    ///
    /// Fails fast with [`PipelineError::CircuitBreakerOpen`] while the
    /// breaker is open or a probe is already in flight.
    pub fn admit(&self, node: &NodeId) -> Result<Admission> {
        self.maybe_sweep();
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .entry(node.clone())
            .or_insert_with(|| BreakerEntry::new(now));
        entry.last_touched = now;
        match entry.state {
            BreakerState::Closed => Ok(Admission::Normal),
            BreakerState::Open => {
                let opened = entry.opened_at.unwrap_or(now);
                if now.saturating_duration_since(opened) >= self.options.open_duration {
                    entry.state = BreakerState::HalfOpen;
                    entry.probe_inflight = true;
                    drop(entries);
                    self.notify(node, BreakerState::Open, BreakerState::HalfOpen);
                    Ok(Admission::Probe)
                } else {
                    Err(PipelineError::CircuitBreakerOpen {
                        node: node.to_string(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if entry.probe_inflight {
                    Err(PipelineError::CircuitBreakerOpen {
                        node: node.to_string(),
                    })
                } else {
                    entry.probe_inflight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    /// Record a successful invocation.
    pub fn record_success(&self, node: &NodeId) {
        let transition = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.get_mut(node) {
                Some(entry) if entry.state == BreakerState::HalfOpen => {
                    entry.state = BreakerState::Closed;
                    entry.failures.clear();
                    entry.opened_at = None;
                    entry.probe_inflight = false;
                    Some((BreakerState::HalfOpen, BreakerState::Closed))
                }
                _ => None,
            }
        };
        if let Some((from, to)) = transition {
            tracing::debug!(target: TRACING_TARGET, node = %node, "probe succeeded, breaker closed");
            self.notify(node, from, to);
        }
    }

    /// Record a failed invocation.
    pub fn record_failure(&self, node: &NodeId) {
        let now = Instant::now();
        let transition = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let entry = entries
                .entry(node.clone())
                .or_insert_with(|| BreakerEntry::new(now));
            entry.last_touched = now;
            match entry.state {
                BreakerState::HalfOpen => {
                    entry.state = BreakerState::Open;
                    entry.opened_at = Some(now);
                    entry.probe_inflight = false;
                    Some((BreakerState::HalfOpen, BreakerState::Open))
                }
                BreakerState::Closed => {
                    entry.failures.push_back(now);
                    entry.prune(now, self.options.sampling_window);
                    if entry.failures.len() >= self.options.failure_threshold {
                        entry.state = BreakerState::Open;
                        entry.opened_at = Some(now);
                        Some((BreakerState::Closed, BreakerState::Open))
                    } else {
                        None
                    }
                }
                BreakerState::Open => None,
            }
        };
        if let Some((from, to)) = transition {
            tracing::warn!(target: TRACING_TARGET, node = %node, "circuit breaker opened");
            self.notify(node, from, to);
        }
    }

    /// Drop entries idle beyond the retention period.
    pub fn sweep(&self) {
        let now = Instant::now();
        let retention = self.options.retention;
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, entry| now.saturating_duration_since(entry.last_touched) <= retention);
    }

    fn maybe_sweep(&self) {
        let now = Instant::now();
        let mut last = self.last_sweep.lock().unwrap_or_else(|e| e.into_inner());
        if now.saturating_duration_since(*last) >= self.options.retention / 2 {
            *last = now;
            drop(last);
            self.sweep();
        }
    }

    fn notify(&self, node: &NodeId, from: BreakerState, to: BreakerState) {
        if let Some(observer) = &self.observer {
            observer.on_circuit_transition(node, from, to);
        }
    }
}
