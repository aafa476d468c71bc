//! Shared per-run state: cancellation, parameters, disposal, node scope
//!
//! A [`Context`] is created by the caller, handed to
//! [`Pipeline::execute`](crate::runner::Pipeline::execute), threaded through
//! every node invocation, and disposed after the run completes. Cloning a
//! context is cheap and shares the same underlying state.
//!
//! # State maps
//!
//! The context carries three string-keyed maps: `parameters` (caller-supplied
//! run inputs), `items` (runtime scratch space, also where the engine
//! publishes diagnostic snapshots under the keys in
//! [`diagnostics`](crate::diagnostics)), and `properties` (plain string
//! metadata). Under the default sequential execution there is a single
//! writer at a time; parallel workers must go through the atomic
//! [`Context::update_item`] read-modify-write instead of a get/set pair.
//!
//! # Disposal
//!
//! Anything registered with [`Context::defer_dispose`] — node instances are
//! registered automatically by the scheduler — is disposed exactly once, in
//! reverse registration order, when [`Context::dispose`] runs. Disposal
//! failures do not stop the sweep; they are collected into a single
//! [`PipelineError::DisposalAggregate`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, PipelineError, Result};
use crate::graph::NodeId;
use crate::observer::ExecutionObserver;

/// Tracing target for context lifecycle.
pub(crate) const TRACING_TARGET: &str = "conflux_core::context";

tokio::task_local! {
    static CURRENT_NODE: NodeId;
}

/// Run a future with `node` as the current node scope.
///
/// Scopes nest: an inner scope shadows the outer one and the previous value
/// is restored when the future completes, on success and on error alike.
pub(crate) async fn with_current_node<F: std::future::Future>(node: NodeId, fut: F) -> F::Output {
    CURRENT_NODE.scope(node, fut).await
}

/// A resource released asynchronously at run teardown.
#[async_trait]
pub trait AsyncDisposable: Send + 'static {
    /// Release the resource. Called at most once.
    async fn dispose(&mut self) -> std::result::Result<(), BoxError>;
}

struct Registered {
    name: String,
    resource: Box<dyn AsyncDisposable>,
}

#[derive(Default)]
struct ContextInner {
    cancellation: CancellationToken,
    parameters: Mutex<HashMap<String, Value>>,
    items: Mutex<HashMap<String, Value>>,
    properties: Mutex<HashMap<String, String>>,
    disposables: Mutex<Vec<Registered>>,
    observer: Mutex<Option<Arc<dyn ExecutionObserver>>>,
}

/// Shared per-run execution state.
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Fresh context with its own cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context cancelled when `token` is cancelled.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                cancellation: token,
                ..Default::default()
            }),
        }
    }

    /// The run's cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    /// Cancel the run.
    pub fn cancel(&self) {
        self.inner.cancellation.cancel();
    }

    /// True once the run was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    /// Node currently executing on this task, if any.
    pub fn current_node(&self) -> Option<NodeId> {
        CURRENT_NODE.try_with(|n| n.clone()).ok()
    }

    /// Set a caller-supplied run parameter.
    pub fn set_parameter(&self, key: impl Into<String>, value: impl Into<Value>) {
        lock(&self.inner.parameters).insert(key.into(), value.into());
    }

    /// Read a run parameter.
    pub fn parameter(&self, key: &str) -> Option<Value> {
        lock(&self.inner.parameters).get(key).cloned()
    }

    /// Read and deserialize a run parameter.
    pub fn parameter_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.parameter(key)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    /// Write a runtime item.
    pub fn set_item(&self, key: impl Into<String>, value: impl Into<Value>) {
        lock(&self.inner.items).insert(key.into(), value.into());
    }

    /// Read a runtime item.
    pub fn item(&self, key: &str) -> Option<Value> {
        lock(&self.inner.items).get(key).cloned()
    }

    /// Atomically read-modify-write a runtime item.
    ///
    /// This is the interface parallel workers must use for shared counters;
    /// a separate `item` + `set_item` pair would race.
    pub fn update_item<F>(&self, key: &str, update: F)
    where
        F: FnOnce(Option<Value>) -> Value,
    {
        let mut items = lock(&self.inner.items);
        let next = update(items.get(key).cloned());
        items.insert(key.to_string(), next);
    }

    /// Write a string property.
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        lock(&self.inner.properties).insert(key.into(), value.into());
    }

    /// Read a string property.
    pub fn property(&self, key: &str) -> Option<String> {
        lock(&self.inner.properties).get(key).cloned()
    }

    /// Observer attached to the current run, if any.
    pub fn observer(&self) -> Option<Arc<dyn ExecutionObserver>> {
        lock(&self.inner.observer).clone()
    }

    pub(crate) fn attach_observer(&self, observer: Option<Arc<dyn ExecutionObserver>>) {
        *lock(&self.inner.observer) = observer;
    }

    /// Register a resource for disposal at run teardown.
    ///
    /// Registration order is preserved; disposal runs in reverse.
    pub fn defer_dispose(&self, name: impl Into<String>, resource: Box<dyn AsyncDisposable>) {
        lock(&self.inner.disposables).push(Registered {
            name: name.into(),
            resource,
        });
    }

    /// Number of resources currently awaiting disposal.
    pub fn pending_disposals(&self) -> usize {
        lock(&self.inner.disposables).len()
    }

    /// Dispose every registered resource, newest first.
    ///
    /// Idempotent: the registry is drained, so a second call is a no-op.
    /// All resources are attempted even when some fail; failures are
    /// aggregated into one error.
    pub async fn dispose(&self) -> Result<()> {
        let drained: Vec<Registered> = {
            let mut disposables = lock(&self.inner.disposables);
            disposables.drain(..).collect()
        };
        let mut failures: Vec<String> = Vec::new();
        for mut entry in drained.into_iter().rev() {
            tracing::debug!(target: TRACING_TARGET, resource = %entry.name, "disposing");
            if let Err(err) = entry.resource.dispose().await {
                tracing::error!(
                    target: TRACING_TARGET,
                    resource = %entry.name,
                    error = %err,
                    "disposal failed"
                );
                failures.push(format!("{}: {}", entry.name, err));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::DisposalAggregate {
                count: failures.len(),
                details: failures.join("; "),
            })
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .field("pending_disposals", &self.pending_disposals())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        order: Arc<Mutex<Vec<&'static str>>>,
        label: &'static str,
        fail: bool,
        disposed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AsyncDisposable for Probe {
        async fn dispose(&mut self) -> std::result::Result<(), BoxError> {
            self.order.lock().unwrap().push(self.label);
            self.disposed.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err("dispose failed".into())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_disposal_reverse_order() {
        let ctx = Context::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));
        for label in ["first", "second", "third"] {
            ctx.defer_dispose(
                label,
                Box::new(Probe {
                    order: order.clone(),
                    label,
                    fail: false,
                    disposed: count.clone(),
                }),
            );
        }
        ctx.dispose().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
        assert_eq!(count.load(Ordering::SeqCst), 3);

        // Second sweep finds an empty registry.
        ctx.dispose().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_disposal_failures_aggregate() {
        let ctx = Context::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));
        for (label, fail) in [("a", true), ("b", false), ("c", true)] {
            ctx.defer_dispose(
                label,
                Box::new(Probe {
                    order: order.clone(),
                    label,
                    fail,
                    disposed: count.clone(),
                }),
            );
        }
        let err = ctx.dispose().await.unwrap_err();
        match err {
            PipelineError::DisposalAggregate { count: failed, .. } => assert_eq!(failed, 2),
            other => panic!("unexpected error: {other}"),
        }
        // Every resource was still attempted.
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_current_node_scoping() {
        let ctx = Context::new();
        assert_eq!(ctx.current_node(), None);
        let inner = ctx.clone();
        with_current_node(NodeId::from("outer"), async move {
            assert_eq!(inner.current_node(), Some(NodeId::from("outer")));
            let nested = inner.clone();
            with_current_node(NodeId::from("inner"), async move {
                assert_eq!(nested.current_node(), Some(NodeId::from("inner")));
            })
            .await;
            assert_eq!(inner.current_node(), Some(NodeId::from("outer")));
        })
        .await;
        assert_eq!(ctx.current_node(), None);
    }

    #[test]
    fn test_update_item_read_modify_write() {
        let ctx = Context::new();
        ctx.update_item("counter", |v| {
            Value::from(v.and_then(|v| v.as_i64()).unwrap_or(0) + 1)
        });
        ctx.update_item("counter", |v| {
            Value::from(v.and_then(|v| v.as_i64()).unwrap_or(0) + 1)
        });
        assert_eq!(ctx.item("counter"), Some(Value::from(2)));
    }
}
