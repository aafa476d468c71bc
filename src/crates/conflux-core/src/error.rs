//! Error types for graph construction and pipeline execution
//!
//! All fallible operations in the crate return [`Result<T>`], an alias over
//! [`PipelineError`]. The enum mirrors the stages of a pipeline's life:
//! builder misuse and validation failures happen before a run starts,
//! node-execution, retry, circuit-breaker, timeout and cancellation errors
//! happen while the run is live, and disposal aggregates happen during
//! teardown.
//!
//! # Cancellation is special
//!
//! [`PipelineError::Cancelled`] is never swallowed by recovery paths. Error
//! handlers, retry loops and strategies all consult
//! [`PipelineError::is_cancellation`] and re-throw instead of recovering.
//! [`PipelineError::is_circuit_open`] plays the same role for breaker
//! fail-fast errors, which bypass restart handlers.
//!
//! # Examples
//!
//! ```rust
//! use conflux_core::error::PipelineError;
//!
//! let err = PipelineError::node_execution("parse", "malformed record");
//! assert!(matches!(err, PipelineError::NodeExecution { .. }));
//! assert!(!err.is_cancellation());
//! ```

use thiserror::Error;

/// Boxed error type accepted at user-node boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenient result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors produced while building, validating, or executing a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A structural rule was violated at build time.
    ///
    /// Carries the rendered validation report so callers can print every
    /// issue, not just the first one.
    #[error("graph validation failed:\n{report}")]
    Validation {
        /// Human-readable, one-issue-per-line report.
        report: String,
    },

    /// A user node raised an unrecovered error during execution.
    #[error("node '{node}' failed: {source}")]
    NodeExecution {
        /// Identifier of the failing node.
        node: String,
        /// The underlying failure.
        #[source]
        source: Box<PipelineError>,
    },

    /// A user node surfaced an application error.
    #[error("{0}")]
    Node(#[source] BoxError),

    /// All configured retry attempts were consumed.
    #[error("retry exhausted after {attempts} attempt(s) for node '{node}': {source}")]
    RetryExhausted {
        /// Node whose invocations kept failing.
        node: String,
        /// Number of attempts made, including the first.
        attempts: u32,
        /// The last failure observed.
        #[source]
        source: Box<PipelineError>,
    },

    /// An invocation was skipped because the node's circuit breaker is open.
    #[error("circuit breaker open for node '{node}'")]
    CircuitBreakerOpen {
        /// Node protected by the breaker.
        node: String,
    },

    /// The run's cancellation token fired.
    #[error("pipeline execution cancelled")]
    Cancelled,

    /// A per-item deadline was exceeded.
    #[error("item processing in node '{node}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Node whose item processing exceeded the deadline.
        node: String,
        /// The configured deadline, in milliseconds.
        timeout_ms: u64,
    },

    /// One or more registered disposables failed during teardown.
    #[error("disposal failed for {count} resource(s): {details}")]
    DisposalAggregate {
        /// How many disposals failed.
        count: usize,
        /// Semicolon-joined failure descriptions.
        details: String,
    },

    /// Builder misuse: rebuild, unknown node, consumed instance, and friends.
    #[error("builder state error: {0}")]
    BuilderState(String),

    /// An engine invariant was broken. Indicates a bug in conflux, not in
    /// user code.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Create a node-execution error wrapping an inner failure.
    pub fn node_execution(node: impl Into<String>, error: impl Into<String>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            source: Box::new(Self::Node(error.into().into())),
        }
    }

    /// Wrap an already-typed inner error with node context.
    pub fn node_failure(node: impl Into<String>, inner: PipelineError) -> Self {
        Self::NodeExecution {
            node: node.into(),
            source: Box::new(inner),
        }
    }

    /// Create a validation error from a rendered report.
    pub fn validation(report: impl Into<String>) -> Self {
        Self::Validation {
            report: report.into(),
        }
    }

    /// Create a builder-state error.
    pub fn builder(message: impl Into<String>) -> Self {
        Self::BuilderState(message.into())
    }

    /// Create an internal invariant-breach error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// True when this error (or the failure it wraps) is a cancellation.
    ///
    /// Recovery paths must re-throw cancellations instead of recovering.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::NodeExecution { source, .. } | Self::RetryExhausted { source, .. } => {
                source.is_cancellation()
            }
            _ => false,
        }
    }

    /// True when this error (or the failure it wraps) is a breaker fail-fast.
    pub fn is_circuit_open(&self) -> bool {
        match self {
            Self::CircuitBreakerOpen { .. } => true,
            Self::NodeExecution { source, .. } | Self::RetryExhausted { source, .. } => {
                source.is_circuit_open()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_execution_display() {
        let err = PipelineError::node_execution("double", "boom");
        assert_eq!(err.to_string(), "node 'double' failed: boom");
    }

    #[test]
    fn test_cancellation_detected_through_wrappers() {
        let err = PipelineError::node_failure("sink", PipelineError::Cancelled);
        assert!(err.is_cancellation());

        let err = PipelineError::RetryExhausted {
            node: "sink".into(),
            attempts: 3,
            source: Box::new(PipelineError::Cancelled),
        };
        assert!(err.is_cancellation());
    }

    #[test]
    fn test_circuit_open_detected_through_wrappers() {
        let inner = PipelineError::CircuitBreakerOpen {
            node: "flaky".into(),
        };
        let err = PipelineError::node_failure("flaky", inner);
        assert!(err.is_circuit_open());
        assert!(!err.is_cancellation());
    }

    #[test]
    fn test_plain_node_error_is_not_special() {
        let err = PipelineError::Node("ordinary failure".into());
        assert!(!err.is_cancellation());
        assert!(!err.is_circuit_open());
    }
}
