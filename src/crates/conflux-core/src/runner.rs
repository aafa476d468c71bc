//! Pipeline facade: definitions, creation, and end-to-end runs
//!
//! A [`PipelineDefinition`] is the single entry point a user implements: it
//! receives a fresh [`PipelineBuilder`] and the run [`Context`] and declares
//! the graph. [`Pipeline::create`] builds (validating per the builder's
//! mode); [`Pipeline::execute`] drives the graph to completion. The
//! [`run`] shortcut does both for `Default`-constructible definitions.
//!
//! Whatever happens during a run — success, node failure, cancellation —
//! the runner disposes the context's registered resources before returning.
//!
//! # Examples
//!
//! ```rust,ignore
//! struct WordCount;
//!
//! impl PipelineDefinition for WordCount {
//!     fn define(&self, builder: &mut PipelineBuilder, _ctx: &Context) -> Result<()> {
//!         let lines = builder.add_source("lines", FileLines::open("input.txt"))?;
//!         let words = builder.add_transform("split", SplitWords)?;
//!         let counts = builder.add_sink("counts", CountSink::new())?;
//!         builder.connect(&lines, &words)?;
//!         builder.connect(&words, &counts)?;
//!         Ok(())
//!     }
//! }
//!
//! let ctx = Context::new();
//! let pipeline = Pipeline::create(&WordCount, &ctx)?;
//! pipeline.execute(&ctx).await?;
//! ```

use std::sync::Arc;

use crate::builder::PipelineBuilder;
use crate::context::Context;
use crate::error::Result;
use crate::graph::Graph;
use crate::scheduler;

/// Tracing target for the runner facade.
pub(crate) const TRACING_TARGET: &str = "conflux_core::runner";

/// A user-declared pipeline.
pub trait PipelineDefinition: Send + Sync {
    /// Populate the builder with this pipeline's nodes, edges, and policies.
    fn define(&self, builder: &mut PipelineBuilder, ctx: &Context) -> Result<()>;
}

/// A built, executable pipeline.
#[derive(Clone)]
pub struct Pipeline {
    graph: Arc<Graph>,
}

impl Pipeline {
    /// Build a pipeline from a definition.
    pub fn create<D: PipelineDefinition>(definition: &D, ctx: &Context) -> Result<Self> {
        let mut builder = PipelineBuilder::new();
        definition.define(&mut builder, ctx)?;
        let graph = builder.build()?;
        Ok(Self {
            graph: Arc::new(graph),
        })
    }

    /// Wrap an already-built graph.
    pub fn from_graph(graph: Graph) -> Self {
        Self {
            graph: Arc::new(graph),
        }
    }

    /// The underlying immutable graph.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Drive the pipeline to completion.
    ///
    /// Resolves when every sink has finished; fails with the first
    /// unrecovered error. The context's disposal registry is drained before
    /// returning, on every path.
    pub async fn execute(&self, ctx: &Context) -> Result<()> {
        let run = scheduler::execute(self.graph.clone(), ctx).await;
        let disposal = ctx.dispose().await;
        match (run, disposal) {
            (Err(error), Err(disposal_error)) => {
                tracing::error!(
                    target: TRACING_TARGET,
                    error = %disposal_error,
                    "disposal also failed during failed run teardown"
                );
                Err(error)
            }
            (Err(error), Ok(())) => Err(error),
            (Ok(()), Err(disposal_error)) => Err(disposal_error),
            (Ok(()), Ok(())) => Ok(()),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("nodes", &self.graph.nodes().len())
            .field("edges", &self.graph.edges().len())
            .finish()
    }
}

/// Build and execute `D` in one call.
pub async fn run<D: PipelineDefinition + Default>(ctx: &Context) -> Result<()> {
    let definition = D::default();
    let pipeline = Pipeline::create(&definition, ctx)?;
    pipeline.execute(ctx).await
}
