//! Immutable graph model: node definitions, edges, and the frozen graph
//!
//! A [`Graph`] is the output of
//! [`PipelineBuilder::build`](crate::builder::PipelineBuilder::build): an
//! immutable snapshot of node definitions and edges, an id index, the erased
//! node providers (factories or preconfigured instances), and the frozen
//! configuration blocks for error handling, lineage, and execution. The
//! scheduler never mutates a graph; one graph can back many runs as long as
//! every node was registered with a factory.
//!
//! Node identity is a [`NodeId`]: a slug derived from the display name,
//! unique within the graph. Edge endpoints carry an [`InputPort`] so a join's
//! two inputs stay distinct even when their item types coincide.

use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::erased::NodeCell;
use crate::error::{PipelineError, Result};
use crate::handlers::{ErrorOptions, NodeErrorHandler};
use crate::lineage::LineageOptions;
use crate::node::{Cardinality, NodeKind};
use crate::observer::ExecutionObserver;
use crate::retry::RetryPolicy;
use crate::breaker::BreakerOptions;
use crate::strategy::ExecutionStrategy;
use crate::window::WindowAssigner;

/// Tracing target for graph assembly.
pub(crate) const TRACING_TARGET: &str = "conflux_core::graph";

/// Unique node identifier within a graph.
///
/// Generated from the node's display name by
/// [`NodeId::slug`]: lowercased, non-alphanumerics collapsed to `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap an already-sluggified identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive an identifier from a display name.
    pub fn slug(name: &str) -> Self {
        let mut out = String::with_capacity(name.len());
        let mut last_sep = true;
        for ch in name.chars() {
            if ch.is_ascii_alphanumeric() {
                out.push(ch.to_ascii_lowercase());
                last_sep = false;
            } else if !last_sep {
                out.push('_');
                last_sep = true;
            }
        }
        while out.ends_with('_') {
            out.pop();
        }
        if out.is_empty() {
            out.push_str("node");
        }
        Self(out)
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Runtime witness of an edge's item type.
///
/// Compile-time edge checks live in the typed handles; the token is what the
/// validator uses for dynamically connected edges and defense in depth.
/// Assignability in Rust terms is exact type equality.
#[derive(Debug, Clone, Copy)]
pub struct TypeToken {
    id: TypeId,
    name: &'static str,
}

impl TypeToken {
    /// Token for a concrete item type.
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Human-readable type name (diagnostics only; not stable).
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeToken {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeToken {}

/// Which of a join's two inputs an edge feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinSide {
    /// The first input.
    Left,
    /// The second input.
    Right,
}

impl JoinSide {
    pub(crate) fn index(self) -> usize {
        match self {
            JoinSide::Left => 0,
            JoinSide::Right => 1,
        }
    }
}

/// Target input port of an edge.
///
/// Every node kind except `Join` has a single primary input; joins address
/// their inputs explicitly, which is also how two inputs of the same item
/// type stay unambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InputPort {
    /// The node's only input.
    Primary,
    /// One of a join's two inputs.
    Join(JoinSide),
}

impl InputPort {
    pub(crate) fn index(self) -> usize {
        match self {
            InputPort::Primary => 0,
            InputPort::Join(side) => side.index(),
        }
    }
}

/// How a node merges multiple incoming edges into one input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergeStrategy {
    /// Strictly alternate across incoming edges, skipping closed ones.
    /// The default for every node kind.
    #[default]
    RoundRobin,
    /// Take from whichever edge has an item ready; interleave is arbitrary.
    FirstReady,
}

/// A typed directed connection between two nodes.
#[derive(Debug, Clone)]
pub struct Edge {
    /// Producing node.
    pub source: NodeId,
    /// Consuming node.
    pub target: NodeId,
    /// Which input of the target this edge feeds.
    pub port: InputPort,
    /// Channel capacity override for this edge.
    pub capacity: Option<usize>,
}

/// Immutable description of a single node.
///
/// Which fields are populated depends on [`NodeDefinition::kind`]: a source
/// has no input tokens, a sink no output token, a join exactly two input
/// tokens. The builder enforces those combinations at registration.
#[derive(Clone)]
pub struct NodeDefinition {
    /// Unique identifier.
    pub id: NodeId,
    /// Display name as supplied by the user.
    pub name: String,
    /// Capability kind.
    pub kind: NodeKind,
    /// Input item types, one per port.
    pub input_tokens: Vec<TypeToken>,
    /// Output item type, absent for sinks.
    pub output_token: Option<TypeToken>,
    /// Declared lineage cardinality.
    pub cardinality: Cardinality,
    /// Execution strategy driving this node's item processing.
    pub strategy: ExecutionStrategy,
    /// Per-node retry override; falls back to the graph default.
    pub retry: Option<RetryPolicy>,
    /// Per-node error handler; falls back to the graph default.
    pub error_handler: Option<Arc<dyn NodeErrorHandler>>,
    /// Fan-in merge strategy.
    pub merge: MergeStrategy,
    /// Per-item processing deadline.
    pub item_timeout: Option<Duration>,
    /// Window assigner, present on aggregates.
    pub window: Option<WindowAssigner>,
    /// Whether an aggregate declares an event-time extractor.
    pub event_time: bool,
}

impl fmt::Debug for NodeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDefinition")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("cardinality", &self.cardinality)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

/// How the scheduler obtains a node instance at run time.
pub(crate) enum NodeProvider {
    /// Construct a fresh instance per run.
    Factory(Arc<dyn Fn() -> NodeCell + Send + Sync>),
    /// Adopt the instance registered in the builder; consumed by the first
    /// run.
    Preconfigured(Mutex<Option<NodeCell>>),
}

/// Execution-wide options frozen into the graph.
#[derive(Clone)]
pub struct ExecutionOptions {
    /// Default bounded-channel capacity per edge.
    pub channel_capacity: usize,
    /// Graph-wide default retry policy for resilient nodes.
    pub default_retry: Option<RetryPolicy>,
    /// Circuit-breaker configuration for resilient nodes.
    pub breaker: BreakerOptions,
    /// Lifecycle observer notified of execution events.
    pub observer: Option<Arc<dyn ExecutionObserver>>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 16,
            default_retry: None,
            breaker: BreakerOptions::default(),
            observer: None,
        }
    }
}

impl fmt::Debug for ExecutionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionOptions")
            .field("channel_capacity", &self.channel_capacity)
            .field("default_retry", &self.default_retry)
            .field("breaker", &self.breaker)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// An immutable, validated, executable dataflow graph.
pub struct Graph {
    pub(crate) nodes: Vec<NodeDefinition>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) index: HashMap<NodeId, usize>,
    pub(crate) providers: HashMap<NodeId, NodeProvider>,
    pub(crate) errors: ErrorOptions,
    pub(crate) lineage: LineageOptions,
    pub(crate) execution: ExecutionOptions,
}

impl Graph {
    /// Node definitions in insertion order.
    pub fn nodes(&self) -> &[NodeDefinition] {
        &self.nodes
    }

    /// Edges in insertion order.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Look up a node definition by id.
    pub fn node(&self, id: &NodeId) -> Option<&NodeDefinition> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Frozen lineage options.
    pub fn lineage_options(&self) -> &LineageOptions {
        &self.lineage
    }

    /// Frozen execution options.
    pub fn execution_options(&self) -> &ExecutionOptions {
        &self.execution
    }

    /// Frozen error-handling options.
    pub fn error_options(&self) -> &ErrorOptions {
        &self.errors
    }

    /// Edges leaving `id`.
    pub fn outgoing<'a>(&'a self, id: &'a NodeId) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| &e.source == id)
    }

    /// Edges entering `id`.
    pub fn incoming<'a>(&'a self, id: &'a NodeId) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| &e.target == id)
    }

    /// Nodes in a topological order (sources first).
    ///
    /// Returns an error if the graph contains a cycle; built graphs never do.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        topological_order(
            self.nodes.iter().map(|n| n.id.clone()),
            self.edges.iter().map(|e| (e.source.clone(), e.target.clone())),
        )
        .ok_or_else(|| PipelineError::internal("cycle in a built graph"))
    }

    /// Take the provider-made instance for `id`.
    pub(crate) fn make_instance(&self, id: &NodeId) -> Result<NodeCell> {
        let provider = self
            .providers
            .get(id)
            .ok_or_else(|| PipelineError::internal(format!("no provider for node '{id}'")))?;
        match provider {
            NodeProvider::Factory(f) => Ok(f()),
            NodeProvider::Preconfigured(slot) => {
                let taken = slot
                    .lock()
                    .map_err(|_| PipelineError::internal("poisoned provider slot"))?
                    .take();
                taken.ok_or_else(|| {
                    PipelineError::builder(format!(
                        "preconfigured instance for node '{id}' was already consumed by a \
                         previous run; register the node with a factory to execute repeatedly"
                    ))
                })
            }
        }
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.len())
            .finish_non_exhaustive()
    }
}

/// Kahn's algorithm over arbitrary node/edge lists.
///
/// Returns `None` when the edges contain a directed cycle.
pub(crate) fn topological_order(
    nodes: impl Iterator<Item = NodeId>,
    edges: impl Iterator<Item = (NodeId, NodeId)>,
) -> Option<Vec<NodeId>> {
    let nodes: Vec<NodeId> = nodes.collect();
    let mut in_degree: HashMap<&NodeId, usize> = nodes.iter().map(|n| (n, 0)).collect();
    let edges: Vec<(NodeId, NodeId)> = edges.collect();
    let mut adjacency: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
    for (source, target) in &edges {
        adjacency.entry(source).or_default().push(target);
        if let Some(d) = in_degree.get_mut(target) {
            *d += 1;
        }
    }

    let mut ready: Vec<&NodeId> = nodes.iter().filter(|n| in_degree[n] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(node) = ready.pop() {
        order.push(node.clone());
        if let Some(next) = adjacency.get(node) {
            for target in next {
                if let Some(d) = in_degree.get_mut(*target) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(*target);
                    }
                }
            }
        }
    }

    (order.len() == nodes.len()).then_some(order)
}

/// True when `to` is reachable from `from` following edge direction.
///
/// Used by `can_connect` to refuse an edge that would close a cycle, without
/// mutating the staged graph.
pub(crate) fn is_reachable<'a>(
    edges: impl Iterator<Item = (&'a NodeId, &'a NodeId)> + Clone,
    from: &NodeId,
    to: &NodeId,
) -> bool {
    let mut stack = vec![from];
    let mut seen = std::collections::HashSet::new();
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        for (source, target) in edges.clone() {
            if source == node {
                stack.push(target);
            }
        }
    }
    false
}
