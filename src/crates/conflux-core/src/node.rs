//! Node capability contracts: Source, Transform, Sink, Join, Aggregate
//!
//! A pipeline node implements exactly one of the capability traits in this
//! module. The traits replace the attribute/reflection metadata of classic
//! dataflow hosts with explicit methods: a node's declared cardinality comes
//! from [`Transform::metadata`], a join's key selectors are plain trait
//! methods, and an aggregate carries its own [`WindowAssigner`].
//!
//! # Item requirements
//!
//! Items flowing along edges must be `Send + Clone + Debug + 'static`.
//! `Clone` is what lets the runtime tee an output across fan-out edges and
//! keep a copy of a failed item for dead-letter routing; `Debug` is what
//! renders dead-letter reports and lineage payloads.
//!
//! # Mutability model
//!
//! Sources, sinks, joins and aggregates are driven by a single task and take
//! `&mut self`. Transforms take `&self` because a Parallel execution strategy
//! may invoke the same instance from several cooperative workers at once;
//! stateful transforms use interior mutability (`AtomicU64`, `Mutex`) for
//! anything they share across items.
//!
//! # Disposal
//!
//! Every trait has an async `dispose` hook with a no-op default. The runtime
//! guarantees each instantiated node is disposed exactly once, in reverse
//! creation order, on every exit path of a run, including cancellation and
//! failure.
//!
//! # Examples
//!
//! ```rust,ignore
//! use conflux_core::node::{Source, SourceOutput, Transform, Sink};
//! use conflux_core::context::Context;
//! use conflux_core::error::BoxError;
//! use async_trait::async_trait;
//!
//! struct Numbers(Vec<i64>);
//!
//! #[async_trait]
//! impl Source for Numbers {
//!     type Out = i64;
//!     async fn run(
//!         &mut self,
//!         out: &mut SourceOutput<i64>,
//!         _ctx: &Context,
//!     ) -> Result<(), BoxError> {
//!         for n in self.0.drain(..) {
//!             out.emit(n).await?;
//!         }
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::hash::Hash;

use crate::context::Context;
use crate::error::BoxError;
use crate::lineage::LineagePacket;
use crate::erased::SourceOutput;
use crate::window::{WindowAssigner, WindowBounds};

/// The closed set of node kinds a graph can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Emits items; in-degree 0.
    Source,
    /// Maps one input item to zero or more output items.
    Transform,
    /// Consumes items; out-degree 0.
    Sink,
    /// Merges two keyed input streams.
    Join,
    /// Groups items by key within time windows.
    Aggregate,
}

impl NodeKind {
    /// Short lowercase label used in visualizations and logs.
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Source => "source",
            NodeKind::Transform => "transform",
            NodeKind::Sink => "sink",
            NodeKind::Join => "join",
            NodeKind::Aggregate => "aggregate",
        }
    }
}

/// Declared relationship between a transform's inputs and outputs.
///
/// Cardinality drives lineage mapping: it decides whether an output inherits
/// its parent's lineage id, forks it, or mints a fresh one over a set of
/// contributors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cardinality {
    /// Exactly one output per input; outputs inherit the parent lineage id.
    OneToOne,
    /// Zero or more outputs per input (flat-map); children inherit the
    /// parent lineage id with a forking hop.
    OneToMany,
    /// One output summarizing many inputs; a fresh lineage id is minted over
    /// the union of contributors.
    ManyToOne,
}

/// Static metadata a node declares about itself.
///
/// This is the explicit replacement for attribute-driven reflection: the
/// builder reads it once at registration and freezes it into the
/// [`NodeDefinition`](crate::graph::NodeDefinition).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeMetadata {
    /// Declared input/output cardinality.
    pub cardinality: Cardinality,
    /// When true, the runtime calls [`Transform::map_lineage`] instead of the
    /// built-in per-cardinality rewrap.
    pub custom_lineage: bool,
}

impl NodeMetadata {
    /// One output per input (the default for transforms).
    pub fn one_to_one() -> Self {
        Self {
            cardinality: Cardinality::OneToOne,
            custom_lineage: false,
        }
    }

    /// Zero or more outputs per input.
    pub fn one_to_many() -> Self {
        Self {
            cardinality: Cardinality::OneToMany,
            custom_lineage: false,
        }
    }

    /// Aggregating transform.
    pub fn many_to_one() -> Self {
        Self {
            cardinality: Cardinality::ManyToOne,
            custom_lineage: false,
        }
    }

    /// Route lineage through the node's own mapper.
    pub fn with_custom_lineage(mut self) -> Self {
        self.custom_lineage = true;
        self
    }
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self::one_to_one()
    }
}

/// A node that produces a lazy, backpressured stream of items.
///
/// `run` pushes items through the provided [`SourceOutput`]; each `emit`
/// suspends while downstream channels are full, which is how a slow sink
/// throttles a fast source. `emit` fails once the run is cancelled, so a
/// well-behaved source simply propagates the error with `?`.
#[async_trait]
pub trait Source: Send + 'static {
    /// Item type this source emits.
    type Out: Send + Clone + Debug + 'static;

    /// Produce items until exhausted, cancelled, or failed.
    async fn run(
        &mut self,
        out: &mut SourceOutput<Self::Out>,
        ctx: &Context,
    ) -> Result<(), BoxError>;

    /// Release resources held by this source.
    async fn dispose(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// A node that maps one input item to zero or more output items.
#[async_trait]
pub trait Transform: Send + Sync + 'static {
    /// Item type this transform consumes.
    type In: Send + Clone + Debug + 'static;
    /// Item type this transform produces.
    type Out: Send + Clone + Debug + 'static;

    /// Declared metadata; read once at registration.
    fn metadata() -> NodeMetadata
    where
        Self: Sized,
    {
        NodeMetadata::one_to_one()
    }

    /// Process a single item.
    ///
    /// A [`Cardinality::OneToOne`] transform must return exactly one item;
    /// the other cardinalities may return any number, including zero.
    async fn apply(&self, item: Self::In, ctx: &Context) -> Result<Vec<Self::Out>, BoxError>;

    /// Custom lineage mapper, consulted only when
    /// [`NodeMetadata::custom_lineage`] is set.
    ///
    /// Receives the contributing parent packets and the produced output item;
    /// returning `None` falls back to the per-cardinality rewrap.
    fn map_lineage(
        &self,
        _parents: &[LineagePacket],
        _output: &Self::Out,
        _output_index: usize,
    ) -> Option<LineagePacket> {
        None
    }

    /// Release resources held by this transform.
    async fn dispose(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// A node that consumes a stream of items to completion.
#[async_trait]
pub trait Sink: Send + 'static {
    /// Item type this sink consumes.
    type In: Send + Clone + Debug + 'static;

    /// Consume a single item.
    async fn write(&mut self, item: Self::In, ctx: &Context) -> Result<(), BoxError>;

    /// Called once after the input stream ends, before disposal.
    async fn flush(&mut self, _ctx: &Context) -> Result<(), BoxError> {
        Ok(())
    }

    /// Release resources held by this sink.
    async fn dispose(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// A node that merges two keyed input streams.
///
/// Pairing is FIFO per key and per input: the first unmatched left item with
/// key `k` pairs with the first right item with key `k`. Items left unpaired
/// when both inputs close are discarded.
#[async_trait]
pub trait Join: Send + 'static {
    /// Item type of the first (left) input.
    type Left: Send + Clone + Debug + 'static;
    /// Item type of the second (right) input.
    type Right: Send + Clone + Debug + 'static;
    /// Key both sides are matched on.
    type Key: Eq + Hash + Send + 'static;
    /// Item type produced for each matched pair.
    type Out: Send + Clone + Debug + 'static;

    /// Extract the pairing key from a left item.
    fn left_key(&self, item: &Self::Left) -> Self::Key;

    /// Extract the pairing key from a right item.
    fn right_key(&self, item: &Self::Right) -> Self::Key;

    /// Merge one matched pair into an output item.
    async fn merge(
        &mut self,
        left: Self::Left,
        right: Self::Right,
        ctx: &Context,
    ) -> Result<Self::Out, BoxError>;

    /// Release resources held by this join.
    async fn dispose(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// A node that groups items by key within time windows and folds each group
/// into a result.
///
/// The assigner decides which windows an item lands in; the watermark —
/// the maximum timestamp observed so far — decides when a window closes.
/// When [`Aggregate::timestamp`] returns `None` the item is stamped with its
/// arrival time, which makes window membership dependent on scheduling order;
/// supply an extractor whenever the data carries event time.
#[async_trait]
pub trait Aggregate: Send + 'static {
    /// Item type this aggregate consumes.
    type In: Send + Clone + Debug + 'static;
    /// Grouping key.
    type Key: Eq + Hash + Clone + Send + 'static;
    /// Accumulator folded over a window's items.
    type Acc: Send + 'static;
    /// Item type emitted per closed `(key, window)`.
    type Out: Send + Clone + Debug + 'static;

    /// Window assignment policy for this node.
    fn assigner() -> WindowAssigner
    where
        Self: Sized;

    /// Declare that [`Aggregate::timestamp`] extracts event time.
    ///
    /// Purely declarative; the validator uses it to flag sliding windows
    /// that would otherwise run on arrival time.
    fn uses_event_time() -> bool
    where
        Self: Sized,
    {
        false
    }

    /// Extract the grouping key from an item.
    fn key(&self, item: &Self::In) -> Self::Key;

    /// Extract event time from an item; `None` means arrival time.
    fn timestamp(&self, _item: &Self::In) -> Option<DateTime<Utc>> {
        None
    }

    /// Fresh accumulator for a newly opened `(key, window)`.
    fn init(&self) -> Self::Acc;

    /// Fold one item into the accumulator.
    fn fold(&self, acc: Self::Acc, item: &Self::In) -> Self::Acc;

    /// Produce the emission for a closed `(key, window)`.
    fn finish(&mut self, key: Self::Key, window: WindowBounds, acc: Self::Acc) -> Self::Out;

    /// Release resources held by this aggregate.
    async fn dispose(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}
