//! Retry policies: attempt limits, backoff curves, jitter
//!
//! A [`RetryPolicy`] decides how many times a failing item invocation is
//! attempted and how long to wait between attempts. Delays follow one of
//! three [`Backoff`] curves, are capped at the policy's `delay_cap`, and are
//! then perturbed by a [`Jitter`] mode so that many nodes failing at once do
//! not retry in lockstep.
//!
//! The wait itself lives in the execution strategy, where it races the run's
//! cancellation token; cancellation during a backoff delay aborts the retry
//! immediately with a cancellation error.
//!
//! # Examples
//!
//! ```rust
//! use conflux_core::retry::{Backoff, Jitter, RetryPolicy};
//! use std::time::Duration;
//!
//! // 5 attempts, exponential backoff, no randomness.
//! let policy = RetryPolicy::new(5)
//!     .with_initial_interval(Duration::from_millis(100))
//!     .with_backoff(Backoff::Exponential { factor: 2.0 })
//!     .with_jitter(Jitter::None);
//!
//! let mut delays = policy.delays();
//! assert_eq!(delays.next_delay(1), Duration::from_millis(100));
//! assert_eq!(delays.next_delay(2), Duration::from_millis(200));
//! assert_eq!(delays.next_delay(3), Duration::from_millis(400));
//! ```

use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::graph::NodeId;

/// Shape of the delay curve across attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay after every attempt.
    Fixed,
    /// Delay grows linearly with the attempt number.
    Linear,
    /// Delay multiplies by `factor` after each attempt.
    Exponential {
        /// Multiplier applied per attempt; 2.0 doubles.
        factor: f64,
    },
}

/// Random perturbation applied to a computed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// Use the computed delay as-is.
    None,
    /// Half deterministic, half uniform: `d/2 + U(0, d/2)`.
    Equal,
    /// Decorrelated jitter: `min(cap, U(base, previous * 3))`.
    Decorrelated,
}

/// Configuration for retrying failed item invocations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Base delay before the curve is applied.
    pub initial_interval: Duration,
    /// Hard ceiling on any single delay.
    pub delay_cap: Duration,
    /// Delay curve.
    pub backoff: Backoff,
    /// Perturbation mode.
    pub jitter: Jitter,
}

impl RetryPolicy {
    /// Policy with the given attempt budget and default curve
    /// (exponential ×2 from 500ms, capped at 60s, equal jitter).
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: Duration::from_millis(500),
            delay_cap: Duration::from_secs(60),
            backoff: Backoff::Exponential { factor: 2.0 },
            jitter: Jitter::Equal,
        }
    }

    /// Set the base delay.
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the delay ceiling.
    pub fn with_delay_cap(mut self, cap: Duration) -> Self {
        self.delay_cap = cap;
        self
    }

    /// Set the backoff curve.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the jitter mode.
    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// True while another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Curve value for the delay following attempt `attempt` (1-based),
    /// capped but not yet jittered.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        let base = self.initial_interval.as_secs_f64();
        let raw = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Linear => base * n as f64,
            Backoff::Exponential { factor } => base * factor.powi(n as i32 - 1),
        };
        Duration::from_secs_f64(raw.min(self.delay_cap.as_secs_f64()))
    }

    /// Start a fresh delay sequence for one item's attempt loop.
    ///
    /// Decorrelated jitter carries state between delays, so each retry loop
    /// needs its own sequence.
    pub fn delays(&self) -> DelaySequence {
        DelaySequence {
            policy: self.clone(),
            previous: None,
        }
    }
}

impl Default for RetryPolicy {
    /// A single attempt: failures surface immediately unless retries are
    /// configured explicitly.
    fn default() -> Self {
        Self::new(1)
    }
}

/// Stateful delay generator for one retry loop.
#[derive(Debug, Clone)]
pub struct DelaySequence {
    policy: RetryPolicy,
    previous: Option<Duration>,
}

impl DelaySequence {
    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn next_delay(&mut self, attempt: u32) -> Duration {
        let capped = self.policy.base_delay(attempt);
        let cap = self.policy.delay_cap;
        let base = self.policy.initial_interval;
        let delay = match self.policy.jitter {
            Jitter::None => capped,
            Jitter::Equal => {
                let half = capped / 2;
                let extra = rand::thread_rng().gen_range(0.0..=1.0);
                half + Duration::from_secs_f64(half.as_secs_f64() * extra)
            }
            Jitter::Decorrelated => {
                let low = base.as_secs_f64();
                let high = (self.previous.unwrap_or(base).as_secs_f64() * 3.0).max(low);
                let sampled = if high > low {
                    rand::thread_rng().gen_range(low..=high)
                } else {
                    low
                };
                Duration::from_secs_f64(sampled.min(cap.as_secs_f64()))
            }
        };
        self.previous = Some(delay);
        delay
    }
}

/// Per-run cache of resolved retry policies, keyed by node.
///
/// Resolution (node override, else graph default, else single attempt)
/// happens once per node instead of once per item.
#[derive(Debug, Default)]
pub(crate) struct RetryCache {
    resolved: Mutex<HashMap<NodeId, RetryPolicy>>,
}

impl RetryCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn resolve(
        &self,
        node: &NodeId,
        override_policy: Option<&RetryPolicy>,
        default_policy: Option<&RetryPolicy>,
    ) -> RetryPolicy {
        let mut resolved = self.resolved.lock().unwrap_or_else(|e| e.into_inner());
        resolved
            .entry(node.clone())
            .or_insert_with(|| {
                override_policy
                    .or(default_policy)
                    .cloned()
                    .unwrap_or_default()
            })
            .clone()
    }
}
