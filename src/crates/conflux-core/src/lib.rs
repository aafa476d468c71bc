//! # conflux-core
//!
//! Core engine for streaming dataflow pipelines: declare a typed directed
//! acyclic graph of sources, transforms, joins, aggregates, and sinks, then
//! execute it end to end with cooperative concurrency, backpressure,
//! retries, circuit breaking, per-item lineage, and windowed aggregation.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐    build()    ┌────────────┐   execute()   ┌────────────────┐
//! │ PipelineBuilder│ ────────────> │   Graph    │ ────────────> │   Scheduler    │
//! │  nodes, edges, │   validate    │ (immutable)│               │ tasks+channels │
//! │  policies      │               └────────────┘               └───────┬────────┘
//! └────────────────┘                                                    │
//!                        ┌───────────────────────────────────────────────┤
//!                        ▼                     ▼                         ▼
//!                 ┌────────────┐      ┌───────────────┐         ┌──────────────┐
//!                 │ Strategies │      │  Resilience   │         │   Lineage    │
//!                 │ seq / par  │      │ retry+breaker │         │  envelopes   │
//!                 └────────────┘      └───────────────┘         └──────────────┘
//! ```
//!
//! - **Graph construction** ([`builder`], [`graph`], [`handle`],
//!   [`validation`]): phantom-typed handles make `connect` a compile-time
//!   type check; the validator enforces the structural rules (no cycles,
//!   matched edge types, source/sink degrees, unique names).
//! - **Runtime** ([`scheduler`], [`strategy`], [`context`]): one cooperative
//!   task per node over bounded `mpsc` channels. Sinks pull, so a slow sink
//!   throttles the whole chain. Cancellation is honored at every channel
//!   operation, retry delay, and user await point.
//! - **Resilience** ([`retry`], [`breaker`], [`handlers`]): per-item retry
//!   with pluggable backoff and jitter, a per-node circuit breaker with
//!   half-open probing, and a two-stage error-handler ladder ending in
//!   skip, dead-letter, restart, or pipeline failure.
//! - **Lineage & windows** ([`lineage`], [`window`]): per-item provenance
//!   packets threaded through every hop, and tumbling/sliding event-time
//!   windows closed by a monotonic watermark.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use conflux_core::{Context, Pipeline, PipelineBuilder, PipelineDefinition, Result};
//!
//! struct Doubles;
//!
//! impl PipelineDefinition for Doubles {
//!     fn define(&self, builder: &mut PipelineBuilder, _ctx: &Context) -> Result<()> {
//!         let numbers = builder.add_source("numbers", Range::new(1..=100))?;
//!         let doubled = builder.add_transform("double", Doubler)?;
//!         let out = builder.add_sink("collect", Collector::shared())?;
//!         builder.connect(&numbers, &doubled)?;
//!         builder.connect(&doubled, &out)?;
//!         Ok(())
//!     }
//! }
//!
//! # async fn demo() -> Result<()> {
//! let ctx = Context::new();
//! Pipeline::create(&Doubles, &ctx)?.execute(&ctx).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Ordering and delivery guarantees
//!
//! Within one edge, items arrive in the order the producer emitted them; an
//! unordered Parallel strategy is the only thing that reorders. Under
//! fan-in only the per-edge order is preserved — the global interleave is
//! deliberately unspecified. Delivery is at-most-once per run; there is no
//! durable state and no cross-process replay.

pub mod breaker;
pub mod builder;
pub mod context;
pub mod diagnostics;
mod erased;
pub mod error;
pub mod graph;
pub mod handle;
pub mod handlers;
pub mod lineage;
pub mod node;
pub mod observer;
pub mod retry;
mod scheduler;
pub mod strategy;
pub mod validation;
pub mod visualization;
pub mod window;
pub mod runner;

// Re-export the main types at the crate root.
pub use breaker::{BreakerOptions, BreakerState};
pub use builder::{DuplicateNamePolicy, PipelineBuilder};
pub use context::{AsyncDisposable, Context};
pub use erased::{EmitError, SourceOutput};
pub use error::{BoxError, PipelineError, Result};
pub use graph::{Edge, Graph, InputPort, JoinSide, MergeStrategy, NodeDefinition, NodeId, TypeToken};
pub use handle::{
    AggregateHandle, Inlet, JoinHandle, JoinInput, NodeRef, Outlet, SinkHandle, SourceHandle,
    TransformHandle,
};
pub use handlers::{
    AlwaysRestart, DeadLetter, DeadLetterAll, DeadLetterSink, DropFailingNode, FailFast,
    ItemDecision, MemoryDeadLetterSink, NodeErrorHandler, NodeHandlerFn, PipelineDecision,
    PipelineErrorHandler, SkipAll,
};
pub use lineage::{
    Hop, LineageOptions, LineagePacket, LineageRecord, LineageSink, MemoryLineageSink,
};
pub use node::{Aggregate, Cardinality, Join, NodeKind, NodeMetadata, Sink, Source, Transform};
pub use observer::{ExecutionObserver, NoopObserver};
pub use retry::{Backoff, Jitter, RetryPolicy};
pub use runner::{run, Pipeline, PipelineDefinition};
pub use strategy::{
    ExecutionStrategy, OutputOrdering, ParallelMetrics, ParallelOptions, QueuePolicy,
};
pub use validation::{
    IssueCategory, Severity, ValidationIssue, ValidationMode, ValidationReport,
};
pub use visualization::{visualize, VisualizationFormat, VisualizationOptions};
pub use window::{WindowAssigner, WindowBounds};
