//! Mutable pipeline builder
//!
//! A [`PipelineBuilder`] is the staging area a
//! [`PipelineDefinition`](crate::runner::PipelineDefinition) populates:
//! nodes go in through the typed `add_*` methods (which hand back phantom-
//! typed handles), edges through [`PipelineBuilder::connect`], and policies
//! through the `set_*` (per node) and `with_*` (graph-wide) methods.
//! [`PipelineBuilder::build`] freezes everything into an immutable
//! [`Graph`]; a second build attempt fails with a builder-state error.
//!
//! Each `add_*` method comes in three flavors, which is also how the graph
//! decides whether it can be executed more than once:
//!
//! - `add_source(name, instance)` — register a preconfigured instance,
//!   adopted by the first run and gone afterwards.
//! - `add_source_with(name, factory)` — register a factory; every run
//!   constructs a fresh instance.
//! - `add_source_default::<S>(name)` — factory shorthand for
//!   `S: Default`.
//!
//! # Examples
//!
//! ```rust,ignore
//! let mut builder = PipelineBuilder::new();
//! let numbers = builder.add_source("numbers", NumberSource::upto(100))?;
//! let doubled = builder.add_transform("double", Doubler)?;
//! let sink = builder.add_sink("collect", VecSink::new())?;
//! builder.connect(&numbers, &doubled)?;
//! builder.connect(&doubled, &sink)?;
//! let graph = builder.build()?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::breaker::BreakerOptions;
use crate::erased::NodeCell;
use crate::error::{PipelineError, Result};
use crate::graph::{
    is_reachable, Edge, ExecutionOptions, Graph, InputPort, MergeStrategy, NodeDefinition, NodeId,
    NodeProvider, TypeToken,
};
use crate::handle::{
    AggregateHandle, Inlet, JoinHandle, NodeRef, Outlet, SinkHandle, SourceHandle, TransformHandle,
};
use crate::handlers::{DeadLetterSink, NodeErrorHandler, PipelineErrorHandler};
use crate::lineage::LineageOptions;
use crate::node::{Aggregate, Cardinality, Join, NodeKind, Sink, Source, Transform};
use crate::observer::ExecutionObserver;
use crate::retry::RetryPolicy;
use crate::strategy::ExecutionStrategy;
use crate::validation::{validate, CustomRule, ValidationMode, ValidationReport};
use crate::window::WindowAssigner;

/// What to do when two nodes are registered under the same display name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicateNamePolicy {
    /// Fail the `add_*` call immediately. The default.
    #[default]
    Reject,
    /// Accept the node (its id is uniquified) and let validation flag the
    /// duplicate display name.
    Defer,
}

/// Mutable staging area that produces an immutable [`Graph`].
pub struct PipelineBuilder {
    nodes: Vec<NodeDefinition>,
    edges: Vec<Edge>,
    index: HashMap<NodeId, usize>,
    providers: HashMap<NodeId, NodeProvider>,
    errors: crate::handlers::ErrorOptions,
    lineage: LineageOptions,
    execution: ExecutionOptions,
    validation: ValidationMode,
    custom_rules: Vec<CustomRule>,
    extended_rules: bool,
    allow_standalone_sources: bool,
    duplicate_names: DuplicateNamePolicy,
    built: bool,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    /// Fresh, empty builder with default options.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            index: HashMap::new(),
            providers: HashMap::new(),
            errors: Default::default(),
            lineage: LineageOptions::default(),
            execution: ExecutionOptions::default(),
            validation: ValidationMode::default(),
            custom_rules: Vec::new(),
            extended_rules: false,
            allow_standalone_sources: false,
            duplicate_names: DuplicateNamePolicy::default(),
            built: false,
        }
    }

    // ---- node registration -------------------------------------------------

    /// Register a preconfigured source instance.
    pub fn add_source<S: Source>(&mut self, name: &str, source: S) -> Result<SourceHandle<S::Out>> {
        let id = self.register(
            name,
            NodeKind::Source,
            Vec::new(),
            Some(TypeToken::of::<S::Out>()),
            Cardinality::OneToOne,
            None,
            false,
            |_| NodeProvider::Preconfigured(Mutex::new(Some(NodeCell::source(source)))),
        )?;
        Ok(SourceHandle::new(id))
    }

    /// Register a source constructed per run by `factory`.
    pub fn add_source_with<S, F>(&mut self, name: &str, factory: F) -> Result<SourceHandle<S::Out>>
    where
        S: Source,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let id = self.register(
            name,
            NodeKind::Source,
            Vec::new(),
            Some(TypeToken::of::<S::Out>()),
            Cardinality::OneToOne,
            None,
            false,
            |_| NodeProvider::Factory(Arc::new(move || NodeCell::source(factory()))),
        )?;
        Ok(SourceHandle::new(id))
    }

    /// Register a `Default`-constructed source.
    pub fn add_source_default<S: Source + Default>(
        &mut self,
        name: &str,
    ) -> Result<SourceHandle<S::Out>> {
        self.add_source_with(name, S::default)
    }

    /// Register a preconfigured transform instance.
    pub fn add_transform<T: Transform>(
        &mut self,
        name: &str,
        transform: T,
    ) -> Result<TransformHandle<T::In, T::Out>> {
        let id = self.register(
            name,
            NodeKind::Transform,
            vec![TypeToken::of::<T::In>()],
            Some(TypeToken::of::<T::Out>()),
            T::metadata().cardinality,
            None,
            false,
            |id| {
                NodeProvider::Preconfigured(Mutex::new(Some(NodeCell::transform(
                    id.clone(),
                    transform,
                ))))
            },
        )?;
        Ok(TransformHandle::new(id))
    }

    /// Register a transform constructed per run by `factory`.
    pub fn add_transform_with<T, F>(
        &mut self,
        name: &str,
        factory: F,
    ) -> Result<TransformHandle<T::In, T::Out>>
    where
        T: Transform,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let id = self.register(
            name,
            NodeKind::Transform,
            vec![TypeToken::of::<T::In>()],
            Some(TypeToken::of::<T::Out>()),
            T::metadata().cardinality,
            None,
            false,
            |id| {
                let id = id.clone();
                NodeProvider::Factory(Arc::new(move || {
                    NodeCell::transform(id.clone(), factory())
                }))
            },
        )?;
        Ok(TransformHandle::new(id))
    }

    /// Register a `Default`-constructed transform.
    pub fn add_transform_default<T: Transform + Default>(
        &mut self,
        name: &str,
    ) -> Result<TransformHandle<T::In, T::Out>> {
        self.add_transform_with(name, T::default)
    }

    /// Register a preconfigured sink instance.
    pub fn add_sink<S: Sink>(&mut self, name: &str, sink: S) -> Result<SinkHandle<S::In>> {
        let id = self.register(
            name,
            NodeKind::Sink,
            vec![TypeToken::of::<S::In>()],
            None,
            Cardinality::OneToOne,
            None,
            false,
            |id| NodeProvider::Preconfigured(Mutex::new(Some(NodeCell::sink(id.clone(), sink)))),
        )?;
        Ok(SinkHandle::new(id))
    }

    /// Register a sink constructed per run by `factory`.
    pub fn add_sink_with<S, F>(&mut self, name: &str, factory: F) -> Result<SinkHandle<S::In>>
    where
        S: Sink,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let id = self.register(
            name,
            NodeKind::Sink,
            vec![TypeToken::of::<S::In>()],
            None,
            Cardinality::OneToOne,
            None,
            false,
            |id| {
                let id = id.clone();
                NodeProvider::Factory(Arc::new(move || NodeCell::sink(id.clone(), factory())))
            },
        )?;
        Ok(SinkHandle::new(id))
    }

    /// Register a `Default`-constructed sink.
    pub fn add_sink_default<S: Sink + Default>(&mut self, name: &str) -> Result<SinkHandle<S::In>> {
        self.add_sink_with(name, S::default)
    }

    /// Register a preconfigured join instance.
    pub fn add_join<J: Join>(
        &mut self,
        name: &str,
        join: J,
    ) -> Result<JoinHandle<J::Left, J::Right, J::Out>> {
        let id = self.register(
            name,
            NodeKind::Join,
            vec![TypeToken::of::<J::Left>(), TypeToken::of::<J::Right>()],
            Some(TypeToken::of::<J::Out>()),
            Cardinality::ManyToOne,
            None,
            false,
            |id| NodeProvider::Preconfigured(Mutex::new(Some(NodeCell::join(id.clone(), join)))),
        )?;
        Ok(JoinHandle::new(id))
    }

    /// Register a join constructed per run by `factory`.
    pub fn add_join_with<J, F>(
        &mut self,
        name: &str,
        factory: F,
    ) -> Result<JoinHandle<J::Left, J::Right, J::Out>>
    where
        J: Join,
        F: Fn() -> J + Send + Sync + 'static,
    {
        let id = self.register(
            name,
            NodeKind::Join,
            vec![TypeToken::of::<J::Left>(), TypeToken::of::<J::Right>()],
            Some(TypeToken::of::<J::Out>()),
            Cardinality::ManyToOne,
            None,
            false,
            |id| {
                let id = id.clone();
                NodeProvider::Factory(Arc::new(move || NodeCell::join(id.clone(), factory())))
            },
        )?;
        Ok(JoinHandle::new(id))
    }

    /// Register a preconfigured aggregate instance.
    pub fn add_aggregate<A: Aggregate>(
        &mut self,
        name: &str,
        aggregate: A,
    ) -> Result<AggregateHandle<A::In, A::Out>> {
        let id = self.register(
            name,
            NodeKind::Aggregate,
            vec![TypeToken::of::<A::In>()],
            Some(TypeToken::of::<A::Out>()),
            Cardinality::ManyToOne,
            Some(A::assigner()),
            A::uses_event_time(),
            |id| {
                NodeProvider::Preconfigured(Mutex::new(Some(NodeCell::aggregate(
                    id.clone(),
                    aggregate,
                ))))
            },
        )?;
        Ok(AggregateHandle::new(id))
    }

    /// Register an aggregate constructed per run by `factory`.
    pub fn add_aggregate_with<A, F>(
        &mut self,
        name: &str,
        factory: F,
    ) -> Result<AggregateHandle<A::In, A::Out>>
    where
        A: Aggregate,
        F: Fn() -> A + Send + Sync + 'static,
    {
        let id = self.register(
            name,
            NodeKind::Aggregate,
            vec![TypeToken::of::<A::In>()],
            Some(TypeToken::of::<A::Out>()),
            Cardinality::ManyToOne,
            Some(A::assigner()),
            A::uses_event_time(),
            |id| {
                let id = id.clone();
                NodeProvider::Factory(Arc::new(move || {
                    NodeCell::aggregate(id.clone(), factory())
                }))
            },
        )?;
        Ok(AggregateHandle::new(id))
    }

    // ---- edges -------------------------------------------------------------

    /// Connect a type-matched outlet to an inlet.
    ///
    /// Statically rejected when the item types disagree; dynamically rejected
    /// when an endpoint is unknown, the edge is a self-loop, or it would
    /// close a cycle.
    pub fn connect<T, O, I>(&mut self, from: &O, to: &I) -> Result<()>
    where
        O: Outlet<T>,
        I: Inlet<T>,
    {
        self.connect_ports(from.node_id().clone(), to.node_id().clone(), to.port(), None)
    }

    /// [`connect`](Self::connect) with a per-edge channel capacity.
    pub fn connect_with_capacity<T, O, I>(&mut self, from: &O, to: &I, capacity: usize) -> Result<()>
    where
        O: Outlet<T>,
        I: Inlet<T>,
    {
        self.connect_ports(
            from.node_id().clone(),
            to.node_id().clone(),
            to.port(),
            Some(capacity.max(1)),
        )
    }

    /// True when `connect` would accept this pair right now.
    pub fn can_connect<T, O, I>(&self, from: &O, to: &I) -> bool
    where
        O: Outlet<T>,
        I: Inlet<T>,
    {
        self.can_connect_ids(from.node_id(), to.node_id())
    }

    /// Connect two nodes by id without compile-time type witnesses.
    ///
    /// The edge's item types are still checked — by the validator at build
    /// time instead of the compiler.
    pub fn connect_dynamic(&mut self, from: &NodeId, to: &NodeId, port: InputPort) -> Result<()> {
        self.connect_ports(from.clone(), to.clone(), port, None)
    }

    fn can_connect_ids(&self, source: &NodeId, target: &NodeId) -> bool {
        self.index.contains_key(source)
            && self.index.contains_key(target)
            && source != target
            && !is_reachable(
                self.edges.iter().map(|e| (&e.source, &e.target)),
                target,
                source,
            )
    }

    fn connect_ports(
        &mut self,
        source: NodeId,
        target: NodeId,
        port: InputPort,
        capacity: Option<usize>,
    ) -> Result<()> {
        self.ensure_mutable()?;
        if !self.index.contains_key(&source) {
            return Err(PipelineError::builder(format!("unknown node '{source}'")));
        }
        if !self.index.contains_key(&target) {
            return Err(PipelineError::builder(format!("unknown node '{target}'")));
        }
        if source == target {
            return Err(PipelineError::builder(format!(
                "cannot connect node '{source}' to itself"
            )));
        }
        // DFS from the target looking for the source; finding it means the
        // new edge would close a cycle.
        if is_reachable(
            self.edges.iter().map(|e| (&e.source, &e.target)),
            &target,
            &source,
        ) {
            return Err(PipelineError::builder(format!(
                "connecting '{source}' to '{target}' would create a cycle"
            )));
        }
        self.edges.push(Edge {
            source,
            target,
            port,
            capacity,
        });
        Ok(())
    }

    // ---- per-node policies -------------------------------------------------

    /// Set a node's execution strategy.
    pub fn set_strategy(
        &mut self,
        node: &impl NodeRef,
        strategy: ExecutionStrategy,
    ) -> Result<&mut Self> {
        self.with_def(node, |def| def.strategy = strategy)
    }

    /// Set a node's retry override.
    pub fn set_retry(&mut self, node: &impl NodeRef, policy: RetryPolicy) -> Result<&mut Self> {
        self.with_def(node, |def| def.retry = Some(policy))
    }

    /// Set a node's per-item error handler.
    pub fn set_error_handler(
        &mut self,
        node: &impl NodeRef,
        handler: impl NodeErrorHandler,
    ) -> Result<&mut Self> {
        self.with_def(node, |def| def.error_handler = Some(Arc::new(handler)))
    }

    /// Set a node's per-item processing deadline.
    pub fn set_item_timeout(&mut self, node: &impl NodeRef, timeout: Duration) -> Result<&mut Self> {
        self.with_def(node, |def| def.item_timeout = Some(timeout))
    }

    /// Set how a node merges multiple incoming edges.
    pub fn set_merge_strategy(
        &mut self,
        node: &impl NodeRef,
        merge: MergeStrategy,
    ) -> Result<&mut Self> {
        self.with_def(node, |def| def.merge = merge)
    }

    fn with_def(
        &mut self,
        node: &impl NodeRef,
        update: impl FnOnce(&mut NodeDefinition),
    ) -> Result<&mut Self> {
        self.ensure_mutable()?;
        let id = node.node_id();
        let index = *self
            .index
            .get(id)
            .ok_or_else(|| PipelineError::builder(format!("unknown node '{id}'")))?;
        update(&mut self.nodes[index]);
        Ok(self)
    }

    // ---- graph-wide policies -----------------------------------------------

    /// Default retry policy for resilient nodes without an override.
    pub fn with_default_retry(&mut self, policy: RetryPolicy) -> &mut Self {
        self.execution.default_retry = Some(policy);
        self
    }

    /// Circuit-breaker configuration for resilient nodes.
    pub fn with_breaker(&mut self, options: BreakerOptions) -> &mut Self {
        self.execution.breaker = options;
        self
    }

    /// Default bounded-channel capacity per edge.
    pub fn with_channel_capacity(&mut self, capacity: usize) -> &mut Self {
        self.execution.channel_capacity = capacity.max(1);
        self
    }

    /// Observer notified of execution lifecycle events.
    pub fn with_observer(&mut self, observer: impl ExecutionObserver) -> &mut Self {
        self.execution.observer = Some(Arc::new(observer));
        self
    }

    /// Pipeline-level error handler.
    pub fn with_pipeline_error_handler(&mut self, handler: impl PipelineErrorHandler) -> &mut Self {
        self.errors.pipeline_handler = Some(Arc::new(handler));
        self
    }

    /// Default per-item error handler for nodes without their own.
    pub fn with_default_node_error_handler(&mut self, handler: impl NodeErrorHandler) -> &mut Self {
        self.errors.node_handler = Some(Arc::new(handler));
        self
    }

    /// Destination for dead-lettered items.
    pub fn with_dead_letter_sink(&mut self, sink: Arc<dyn DeadLetterSink>) -> &mut Self {
        self.errors.dead_letter = Some(sink);
        self
    }

    /// Lineage tracking configuration.
    pub fn with_lineage(&mut self, options: LineageOptions) -> &mut Self {
        self.lineage = options;
        self
    }

    /// Validation mode applied at build time.
    pub fn with_validation_mode(&mut self, mode: ValidationMode) -> &mut Self {
        self.validation = mode;
        self
    }

    /// Register a custom validation rule.
    pub fn with_custom_rule(
        &mut self,
        rule: impl Fn(&Graph) -> Vec<crate::validation::ValidationIssue> + Send + Sync + 'static,
    ) -> &mut Self {
        self.custom_rules.push(Arc::new(rule));
        self
    }

    /// Enable the extended (opt-in) validation rules.
    pub fn with_extended_rules(&mut self) -> &mut Self {
        self.extended_rules = true;
        self
    }

    /// Permit sources with no outgoing edges.
    pub fn allow_standalone_sources(&mut self) -> &mut Self {
        self.allow_standalone_sources = true;
        self
    }

    /// Policy for duplicate display names.
    pub fn with_duplicate_name_policy(&mut self, policy: DuplicateNamePolicy) -> &mut Self {
        self.duplicate_names = policy;
        self
    }

    // ---- building ----------------------------------------------------------

    /// Freeze the staged nodes and edges into an immutable [`Graph`].
    ///
    /// Runs validation according to the configured [`ValidationMode`]; in
    /// `Error` mode any error-severity finding fails the build. A builder
    /// builds once: the second call fails with a builder-state error.
    pub fn build(&mut self) -> Result<Graph> {
        self.ensure_mutable()?;
        self.built = true;
        let graph = self.assemble();
        match self.validation {
            ValidationMode::Off => Ok(graph),
            ValidationMode::Warn => {
                let report = validate(
                    &graph,
                    self.extended_rules,
                    self.allow_standalone_sources,
                    &self.custom_rules,
                );
                report.emit_warnings();
                Ok(graph)
            }
            ValidationMode::Error => {
                let report = validate(
                    &graph,
                    self.extended_rules,
                    self.allow_standalone_sources,
                    &self.custom_rules,
                );
                if report.is_valid() {
                    Ok(graph)
                } else {
                    Err(PipelineError::validation(report.render()))
                }
            }
        }
    }

    /// Build without failing: returns the graph (when valid) and the full
    /// validation report.
    pub fn try_build(&mut self) -> (Option<Graph>, ValidationReport) {
        if self.ensure_mutable().is_err() {
            return (None, ValidationReport::default());
        }
        self.built = true;
        let graph = self.assemble();
        let report = validate(
            &graph,
            self.extended_rules,
            self.allow_standalone_sources,
            &self.custom_rules,
        );
        if report.is_valid() {
            (Some(graph), report)
        } else {
            (None, report)
        }
    }

    fn assemble(&mut self) -> Graph {
        let nodes = std::mem::take(&mut self.nodes);
        let edges = std::mem::take(&mut self.edges);
        let providers = std::mem::take(&mut self.providers);
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, def)| (def.id.clone(), i))
            .collect();
        Graph {
            nodes,
            edges,
            index,
            providers,
            errors: self.errors.clone(),
            lineage: self.lineage.clone(),
            execution: self.execution.clone(),
        }
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.built {
            Err(PipelineError::builder(
                "pipeline builder was already built; create a new builder",
            ))
        } else {
            Ok(())
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn register(
        &mut self,
        name: &str,
        kind: NodeKind,
        input_tokens: Vec<TypeToken>,
        output_token: Option<TypeToken>,
        cardinality: Cardinality,
        window: Option<WindowAssigner>,
        event_time: bool,
        provider: impl FnOnce(&NodeId) -> NodeProvider,
    ) -> Result<NodeId> {
        self.ensure_mutable()?;
        if self.duplicate_names == DuplicateNamePolicy::Reject
            && self.nodes.iter().any(|def| def.name == name)
        {
            return Err(PipelineError::builder(format!(
                "a node named '{name}' is already registered"
            )));
        }
        let id = self.unique_id(name);
        tracing::debug!(
            target: crate::graph::TRACING_TARGET,
            node = %id,
            kind = kind.label(),
            "registering node"
        );
        self.index.insert(id.clone(), self.nodes.len());
        self.nodes.push(NodeDefinition {
            id: id.clone(),
            name: name.to_string(),
            kind,
            input_tokens,
            output_token,
            cardinality,
            strategy: ExecutionStrategy::default(),
            retry: None,
            error_handler: None,
            merge: MergeStrategy::default(),
            item_timeout: None,
            window,
            event_time,
        });
        let provider = provider(&id);
        self.providers.insert(id.clone(), provider);
        Ok(id)
    }

    fn unique_id(&self, name: &str) -> NodeId {
        let base = NodeId::slug(name);
        if !self.index.contains_key(&base) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = NodeId::new(format!("{base}_{n}"));
            if !self.index.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}
