//! Runtime scheduler: instantiation, wiring, launch, completion, teardown
//!
//! The scheduler turns an immutable [`Graph`] into a running pipeline:
//!
//! 1. **Instantiate** every node in topological order — adopting
//!    preconfigured instances, constructing the rest from their factories.
//! 2. **Wire** one bounded `mpsc` channel per edge. Fan-out becomes a
//!    broadcasting tee inside the producer's
//!    [`OutputFan`](crate::erased::OutputFan); fan-in becomes a merge task
//!    in front of the consumer (round-robin by default).
//! 3. **Launch** one cooperative task per node. Sinks pull, pulls propagate
//!    up the graph through the bounded channels, and that is the whole
//!    backpressure story: a slow sink slows its producers.
//! 4. **Complete**: end-of-stream travels by sender drop; the run resolves
//!    when every task has finished. Failures consult the error-handler
//!    ladder, cancel the surviving tasks through a run-scoped child token,
//!    and surface as [`PipelineError::NodeExecution`].
//! 5. **Dispose** every instantiated node exactly once, in reverse creation
//!    order, whatever the exit path was.
//!
//! Within one edge, items arrive in emission order; an unordered Parallel
//! strategy is the only thing that reorders. Across edges the interleave is
//! unspecified.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::breaker::BreakerRegistry;
use crate::context::{with_current_node, Context};
use crate::diagnostics;
use crate::erased::{
    AnySink, AnyTransform, ClonerFn, EmitError, EmitterCore, Envelope, FanError, NodeCell,
    OutputFan, RenderFn, SourceLineage,
};
use crate::error::{PipelineError, Result};
use crate::graph::{Graph, MergeStrategy, NodeId};
use crate::handlers::{PipelineDecision, PipelineErrorHandler};
use crate::lineage::{LineageRecord, LineageSink};
use crate::node::NodeKind;
use crate::observer::ExecutionObserver;
use crate::retry::{RetryCache, RetryPolicy};
use crate::strategy::{
    drive_parallel, drive_sequential, DriverExit, DriverKind, ItemPipeline,
};

/// Tracing target for the scheduler.
pub(crate) const TRACING_TARGET: &str = "conflux_core::scheduler";

/// Fate of a node after its failure climbed to the pipeline handler.
enum NodeFate {
    Fail(PipelineError),
    Continue,
    Restart,
}

async fn decide_node_failure(
    node: &NodeId,
    error: PipelineError,
    handler: Option<&Arc<dyn PipelineErrorHandler>>,
    ctx: &Context,
) -> NodeFate {
    if error.is_cancellation() {
        return NodeFate::Fail(PipelineError::Cancelled);
    }
    if error.is_circuit_open() {
        // Restarting a tripped node would spin against the open breaker.
        return NodeFate::Fail(PipelineError::node_failure(node.as_str(), error));
    }
    let decision = match handler {
        Some(handler) => handler.on_node_failure(node, &error, ctx).await,
        None => PipelineDecision::FailPipeline,
    };
    match decision {
        PipelineDecision::FailPipeline => {
            NodeFate::Fail(PipelineError::node_failure(node.as_str(), error))
        }
        PipelineDecision::ContinueWithoutNode => {
            tracing::warn!(
                target: TRACING_TARGET,
                node = %node,
                "continuing pipeline without failed node"
            );
            NodeFate::Continue
        }
        PipelineDecision::RestartNode => NodeFate::Restart,
    }
}

/// Send every output; `Ok(false)` means all consumers are gone.
async fn fan_out(fan: &mut OutputFan, outputs: Vec<Envelope>) -> Result<bool> {
    for out in outputs {
        match fan.send(out).await {
            Ok(()) => {}
            Err(FanError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(FanError::Closed) => return Ok(false),
        }
    }
    Ok(true)
}

fn closed_receiver() -> mpsc::Receiver<Envelope> {
    let (tx, rx) = mpsc::channel(1);
    drop(tx);
    rx
}

fn spawn_merge(
    receivers: Vec<mpsc::Receiver<Envelope>>,
    strategy: MergeStrategy,
    capacity: usize,
    cancel: CancellationToken,
    infra: &mut Vec<JoinHandle<()>>,
) -> mpsc::Receiver<Envelope> {
    let (tx, rx) = mpsc::channel(capacity);
    let handle = tokio::spawn(async move {
        match strategy {
            MergeStrategy::RoundRobin => {
                let mut receivers = receivers;
                let mut idx = 0usize;
                while !receivers.is_empty() {
                    idx %= receivers.len();
                    let received = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        received = receivers[idx].recv() => received,
                    };
                    match received {
                        Some(env) => {
                            if tx.send(env).await.is_err() {
                                break;
                            }
                            idx += 1;
                        }
                        None => {
                            receivers.remove(idx);
                        }
                    }
                }
            }
            MergeStrategy::FirstReady => {
                let mut merged = futures::stream::select_all(
                    receivers.into_iter().map(ReceiverStream::new),
                );
                loop {
                    let received = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        received = merged.next() => received,
                    };
                    match received {
                        Some(env) => {
                            if tx.send(env).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });
    infra.push(handle);
    rx
}

/// Per-node launch bundle assembled before spawning.
struct Launch {
    id: NodeId,
    cell: NodeCell,
    senders: Vec<mpsc::Sender<Envelope>>,
    inputs: Vec<mpsc::Receiver<Envelope>>,
    driver: DriverKind,
    resilient: bool,
    retry: RetryPolicy,
    node_handler: Option<Arc<dyn crate::handlers::NodeErrorHandler>>,
    timeout: Option<std::time::Duration>,
}

/// Shared run-wide services cloned into every node task.
#[derive(Clone)]
struct RunShared {
    ctx: Context,
    cancel: CancellationToken,
    observer: Option<Arc<dyn ExecutionObserver>>,
    breaker: Arc<BreakerRegistry>,
    pipeline_handler: Option<Arc<dyn PipelineErrorHandler>>,
    dead_letter: Option<Arc<dyn crate::handlers::DeadLetterSink>>,
    lineage_sink: Option<Arc<dyn LineageSink>>,
    lineage_enabled: bool,
    sample_every: u64,
    redact: bool,
}

impl RunShared {
    fn node_started(&self, node: &NodeId) {
        tracing::debug!(target: TRACING_TARGET, node = %node, "node task started");
        if let Some(observer) = &self.observer {
            observer.on_node_started(node);
        }
    }

    fn node_completed(&self, node: &NodeId) {
        tracing::debug!(target: TRACING_TARGET, node = %node, "node task completed");
        if let Some(observer) = &self.observer {
            observer.on_node_completed(node);
        }
    }
}

/// Execute a built graph against a context.
///
/// Resolves once every sink has finished; fails with the first unrecovered
/// error. Node instances are disposed before this returns, success or not.
pub(crate) async fn execute(graph: Arc<Graph>, ctx: &Context) -> Result<()> {
    let order = graph.topological_order()?;
    tracing::info!(
        target: TRACING_TARGET,
        nodes = graph.nodes().len(),
        edges = graph.edges().len(),
        "starting pipeline run"
    );

    let shared = RunShared {
        ctx: ctx.clone(),
        cancel: ctx.token().child_token(),
        observer: graph.execution_options().observer.clone(),
        breaker: Arc::new(BreakerRegistry::new(
            graph.execution_options().breaker.clone(),
            graph.execution_options().observer.clone(),
        )),
        pipeline_handler: graph.error_options().pipeline_handler.clone(),
        dead_letter: graph.error_options().dead_letter.clone(),
        lineage_sink: graph.lineage_options().sink.clone(),
        lineage_enabled: graph.lineage_options().enabled,
        sample_every: graph.lineage_options().sample_every,
        redact: graph.lineage_options().redact_data,
    };
    ctx.attach_observer(shared.observer.clone());
    let retry_cache = RetryCache::new();

    // Wiring: one bounded channel per edge.
    let mut outboxes: HashMap<NodeId, Vec<mpsc::Sender<Envelope>>> = HashMap::new();
    let mut inboxes: HashMap<(NodeId, usize), Vec<mpsc::Receiver<Envelope>>> = HashMap::new();
    for edge in graph.edges() {
        let capacity = edge
            .capacity
            .unwrap_or(graph.execution_options().channel_capacity)
            .max(1);
        let (tx, rx) = mpsc::channel(capacity);
        outboxes.entry(edge.source.clone()).or_default().push(tx);
        inboxes
            .entry((edge.target.clone(), edge.port.index()))
            .or_default()
            .push(rx);
    }

    // Fan-in merge tasks.
    let mut infra: Vec<JoinHandle<()>> = Vec::new();
    let mut inputs: HashMap<(NodeId, usize), mpsc::Receiver<Envelope>> = HashMap::new();
    for ((node, port), mut receivers) in inboxes {
        let receiver = if receivers.len() == 1 {
            receivers.remove(0)
        } else {
            let merge = graph
                .node(&node)
                .map(|def| def.merge)
                .unwrap_or_default();
            spawn_merge(
                receivers,
                merge,
                graph.execution_options().channel_capacity,
                shared.cancel.clone(),
                &mut infra,
            )
        };
        inputs.insert((node, port), receiver);
    }

    // Instantiate everything before launching anything, so a failed factory
    // leaves no half-running graph behind.
    let mut launches: Vec<Launch> = Vec::with_capacity(order.len());
    for id in &order {
        let def = graph
            .node(id)
            .ok_or_else(|| PipelineError::internal(format!("unknown node '{id}' in order")))?;
        let cell = match graph.make_instance(id) {
            Ok(cell) => cell,
            Err(err) => {
                for launch in launches.iter_mut().rev() {
                    if let Err(dispose_err) = launch.cell.dispose().await {
                        tracing::error!(
                            target: TRACING_TARGET,
                            node = %launch.id,
                            error = %dispose_err,
                            "disposal failed after instantiation error"
                        );
                    }
                }
                return Err(err);
            }
        };
        if cell.kind() != def.kind {
            return Err(PipelineError::internal(format!(
                "node '{id}' registered as {:?} but instantiated as {:?}",
                def.kind,
                cell.kind()
            )));
        }
        let input_ports = match def.kind {
            NodeKind::Source => 0,
            NodeKind::Join => 2,
            _ => 1,
        };
        let node_inputs = (0..input_ports)
            .map(|port| {
                inputs
                    .remove(&(id.clone(), port))
                    .unwrap_or_else(closed_receiver)
            })
            .collect();
        let (driver, resilient) = def.strategy.resolve();
        launches.push(Launch {
            id: id.clone(),
            cell,
            senders: outboxes.remove(id).unwrap_or_default(),
            inputs: node_inputs,
            driver,
            resilient,
            retry: retry_cache.resolve(
                id,
                def.retry.as_ref(),
                graph.execution_options().default_retry.as_ref(),
            ),
            node_handler: def
                .error_handler
                .clone()
                .or_else(|| graph.error_options().node_handler.clone()),
            timeout: def.item_timeout,
        });
    }
    drop(inputs);
    drop(outboxes);

    // Launch.
    let mut tasks: JoinSet<(NodeId, Option<NodeCell>, Result<()>)> = JoinSet::new();
    for launch in launches {
        let shared = shared.clone();
        let id = launch.id.clone();
        tasks.spawn(with_current_node(id, run_node(launch, shared)));
    }

    // Completion: collect instances and the primary failure.
    let mut cells: HashMap<NodeId, NodeCell> = HashMap::new();
    let mut primary: Option<PipelineError> = None;
    let mut cancelled = false;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((id, cell, result)) => {
                if let Some(cell) = cell {
                    cells.insert(id.clone(), cell);
                }
                match result {
                    Ok(()) => {}
                    Err(PipelineError::Cancelled) => {
                        cancelled = true;
                        shared.cancel.cancel();
                    }
                    Err(error) => {
                        tracing::error!(
                            target: TRACING_TARGET,
                            node = %id,
                            error = %error,
                            "node failed; cancelling run"
                        );
                        if primary.is_none() {
                            primary = Some(error);
                        }
                        shared.cancel.cancel();
                    }
                }
            }
            Err(join_error) => {
                if primary.is_none() {
                    primary = Some(PipelineError::internal(format!(
                        "node task aborted: {join_error}"
                    )));
                }
                shared.cancel.cancel();
            }
        }
    }
    for handle in infra {
        let _ = handle.await;
    }

    // Teardown: reverse creation order, every instance exactly once.
    let mut disposal_failures: Vec<String> = Vec::new();
    for id in order.iter().rev() {
        if let Some(mut cell) = cells.remove(id) {
            if let Err(err) = cell.dispose().await {
                tracing::error!(
                    target: TRACING_TARGET,
                    node = %id,
                    error = %err,
                    "node disposal failed"
                );
                disposal_failures.push(format!("{id}: {err}"));
            }
        }
    }

    let disposal_error = (!disposal_failures.is_empty()).then(|| {
        PipelineError::DisposalAggregate {
            count: disposal_failures.len(),
            details: disposal_failures.join("; "),
        }
    });

    match (primary, cancelled) {
        (Some(error), _) => Err(error),
        (None, true) => Err(PipelineError::Cancelled),
        (None, false) => match disposal_error {
            Some(error) => Err(error),
            None => {
                tracing::info!(target: TRACING_TARGET, "pipeline run completed");
                Ok(())
            }
        },
    }
}

async fn run_node(launch: Launch, shared: RunShared) -> (NodeId, Option<NodeCell>, Result<()>) {
    shared.node_started(&launch.id);
    let id = launch.id.clone();
    let (cell, result) = match launch.cell {
        NodeCell::Source(source) => run_source(&id, source, launch.senders, &shared).await,
        NodeCell::Transform(transform) => {
            run_transform(
                &id,
                transform,
                launch.senders,
                launch.inputs,
                launch.driver,
                launch.resilient,
                launch.retry,
                launch.node_handler,
                launch.timeout,
                &shared,
            )
            .await
        }
        NodeCell::Sink(sink) => {
            run_sink(
                &id,
                sink,
                launch.inputs,
                launch.resilient,
                launch.retry,
                launch.node_handler,
                launch.timeout,
                &shared,
            )
            .await
        }
        NodeCell::Join(join) => run_join(&id, join, launch.senders, launch.inputs, &shared).await,
        NodeCell::Aggregate(aggregate) => {
            run_aggregate(&id, aggregate, launch.senders, launch.inputs, &shared).await
        }
    };
    shared.node_completed(&id);
    (id, cell, result)
}

async fn run_source(
    id: &NodeId,
    mut source: Box<dyn crate::erased::AnySource>,
    senders: Vec<mpsc::Sender<Envelope>>,
    shared: &RunShared,
) -> (Option<NodeCell>, Result<()>) {
    let fan = OutputFan::new(senders, source.out_cloner(), shared.cancel.clone());
    let mut core = EmitterCore {
        fan,
        lineage: shared
            .lineage_enabled
            .then(|| SourceLineage::new(id.clone(), shared.sample_every)),
    };
    let result = loop {
        let (returned, run_result) = source.run(core, &shared.ctx).await;
        core = returned;
        match run_result {
            Ok(()) => break Ok(()),
            Err(err) => {
                if let Some(emit) = err.downcast_ref::<EmitError>() {
                    if emit.is_cancelled() {
                        break Err(PipelineError::Cancelled);
                    }
                    tracing::debug!(
                        target: TRACING_TARGET,
                        node = %id,
                        "downstream closed; source stopping"
                    );
                    break Ok(());
                }
                if shared.cancel.is_cancelled() {
                    break Err(PipelineError::Cancelled);
                }
                let error = PipelineError::Node(err);
                match decide_node_failure(id, error, shared.pipeline_handler.as_ref(), &shared.ctx)
                    .await
                {
                    NodeFate::Fail(error) => break Err(error),
                    NodeFate::Continue => break Ok(()),
                    NodeFate::Restart => {
                        tracing::debug!(target: TRACING_TARGET, node = %id, "restarting source");
                        continue;
                    }
                }
            }
        }
    };
    drop(core);
    (Some(NodeCell::Source(source)), result)
}

#[allow(clippy::too_many_arguments)]
async fn run_transform(
    id: &NodeId,
    transform: Box<dyn AnyTransform>,
    senders: Vec<mpsc::Sender<Envelope>>,
    mut inputs: Vec<mpsc::Receiver<Envelope>>,
    driver: DriverKind,
    resilient: bool,
    retry: RetryPolicy,
    node_handler: Option<Arc<dyn crate::handlers::NodeErrorHandler>>,
    timeout: Option<std::time::Duration>,
    shared: &RunShared,
) -> (Option<NodeCell>, Result<()>) {
    let mut rx = inputs.pop().unwrap_or_else(closed_receiver);
    let mut fan = OutputFan::new(senders, transform.out_cloner(), shared.cancel.clone());
    let result = {
        let pipeline = ItemPipeline {
            node: id.clone(),
            transform: &*transform,
            retry,
            resilient,
            breaker: shared.breaker.clone(),
            node_handler,
            dead_letter: shared.dead_letter.clone(),
            observer: shared.observer.clone(),
            timeout,
            cancel: shared.cancel.clone(),
            ctx: shared.ctx.clone(),
        };
        loop {
            let exit = match &driver {
                DriverKind::Sequential => drive_sequential(&pipeline, &mut rx, &mut fan).await,
                DriverKind::Parallel(options) => {
                    drive_parallel(&pipeline, options, &mut rx, &mut fan).await
                }
            };
            match exit {
                DriverExit::Finished => break Ok(()),
                DriverExit::Escalated(error) => {
                    match decide_node_failure(
                        id,
                        error,
                        shared.pipeline_handler.as_ref(),
                        &shared.ctx,
                    )
                    .await
                    {
                        NodeFate::Fail(error) => break Err(error),
                        NodeFate::Continue => break Ok(()),
                        NodeFate::Restart => {
                            tracing::debug!(
                                target: TRACING_TARGET,
                                node = %id,
                                "restarting transform"
                            );
                            continue;
                        }
                    }
                }
            }
        }
    };
    drop(fan);
    drop(rx);
    (Some(NodeCell::Transform(transform)), result)
}

/// Adapts a sink to the transform-shaped item pipeline so sinks share the
/// retry, breaker, timeout, and dead-letter machinery.
struct SinkShim {
    node: NodeId,
    sink: tokio::sync::Mutex<Box<dyn AnySink>>,
    in_cloner: ClonerFn,
    render: RenderFn,
    lineage_sink: Option<Arc<dyn LineageSink>>,
    redact: bool,
}

impl SinkShim {
    fn new(
        node: NodeId,
        sink: Box<dyn AnySink>,
        lineage_sink: Option<Arc<dyn LineageSink>>,
        redact: bool,
    ) -> Self {
        let in_cloner = sink.in_cloner();
        let render = sink.renderer();
        Self {
            node,
            sink: tokio::sync::Mutex::new(sink),
            in_cloner,
            render,
            lineage_sink,
            redact,
        }
    }

    fn into_sink(self) -> Box<dyn AnySink> {
        self.sink.into_inner()
    }
}

#[async_trait::async_trait]
impl AnyTransform for SinkShim {
    async fn apply(&self, env: &Envelope, ctx: &Context) -> Result<Vec<Envelope>> {
        let mut sink = self.sink.lock().await;
        if let (Some(packet), Some(recorder)) = (&env.lineage, &self.lineage_sink) {
            if packet.collect {
                let mut traversal_path = packet.traversal_path.clone();
                traversal_path.push(self.node.clone());
                let record = LineageRecord {
                    lineage_id: packet.lineage_id,
                    traversal_path,
                    hops: packet.hops.to_vec(),
                    payload: (!self.redact).then(|| (self.render)(env)),
                };
                if let Err(err) = recorder.record(record, ctx).await {
                    tracing::warn!(
                        target: TRACING_TARGET,
                        node = %self.node,
                        error = %err,
                        "lineage sink rejected record"
                    );
                }
            }
        }
        sink.write(env, ctx).await?;
        Ok(Vec::new())
    }

    fn out_cloner(&self) -> ClonerFn {
        Arc::new(|_| None)
    }

    fn in_cloner(&self) -> ClonerFn {
        self.in_cloner.clone()
    }

    fn renderer(&self) -> RenderFn {
        self.render.clone()
    }

    async fn dispose(&mut self) -> std::result::Result<(), crate::error::BoxError> {
        // The shim never owns disposal; the recovered sink is disposed by
        // the scheduler's teardown pass.
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_sink(
    id: &NodeId,
    sink: Box<dyn AnySink>,
    mut inputs: Vec<mpsc::Receiver<Envelope>>,
    resilient: bool,
    retry: RetryPolicy,
    node_handler: Option<Arc<dyn crate::handlers::NodeErrorHandler>>,
    timeout: Option<std::time::Duration>,
    shared: &RunShared,
) -> (Option<NodeCell>, Result<()>) {
    let mut rx = inputs.pop().unwrap_or_else(closed_receiver);
    let shim = SinkShim::new(
        id.clone(),
        sink,
        shared.lineage_sink.clone(),
        shared.redact,
    );
    let mut fan = OutputFan::new(Vec::new(), Arc::new(|_| None), shared.cancel.clone());
    let result = {
        let pipeline = ItemPipeline {
            node: id.clone(),
            transform: &shim,
            retry,
            resilient,
            breaker: shared.breaker.clone(),
            node_handler,
            dead_letter: shared.dead_letter.clone(),
            observer: shared.observer.clone(),
            timeout,
            cancel: shared.cancel.clone(),
            ctx: shared.ctx.clone(),
        };
        loop {
            match drive_sequential(&pipeline, &mut rx, &mut fan).await {
                DriverExit::Finished => break Ok(()),
                DriverExit::Escalated(error) => {
                    match decide_node_failure(
                        id,
                        error,
                        shared.pipeline_handler.as_ref(),
                        &shared.ctx,
                    )
                    .await
                    {
                        NodeFate::Fail(error) => break Err(error),
                        NodeFate::Continue => break Ok(()),
                        NodeFate::Restart => continue,
                    }
                }
            }
        }
    };
    let mut sink = shim.into_sink();
    let result = match result {
        Ok(()) => sink
            .flush(&shared.ctx)
            .await
            .map_err(|err| PipelineError::node_failure(id.as_str(), err)),
        Err(error) => Err(error),
    };
    (Some(NodeCell::Sink(sink)), result)
}

async fn run_join(
    id: &NodeId,
    mut join: Box<dyn crate::erased::AnyJoin>,
    senders: Vec<mpsc::Sender<Envelope>>,
    mut inputs: Vec<mpsc::Receiver<Envelope>>,
    shared: &RunShared,
) -> (Option<NodeCell>, Result<()>) {
    use crate::graph::JoinSide;

    let mut rx_right = inputs.pop().unwrap_or_else(closed_receiver);
    let mut rx_left = inputs.pop().unwrap_or_else(closed_receiver);
    let mut fan = OutputFan::new(senders, join.out_cloner(), shared.cancel.clone());
    let mut left_open = true;
    let mut right_open = true;

    enum Feed {
        Item(JoinSide, Envelope),
        Closed(JoinSide),
        Cancelled,
    }

    let result = 'run: loop {
        if !left_open && !right_open {
            break Ok(());
        }
        let feed = tokio::select! {
            _ = shared.cancel.cancelled() => Feed::Cancelled,
            received = rx_left.recv(), if left_open => match received {
                Some(env) => Feed::Item(JoinSide::Left, env),
                None => Feed::Closed(JoinSide::Left),
            },
            received = rx_right.recv(), if right_open => match received {
                Some(env) => Feed::Item(JoinSide::Right, env),
                None => Feed::Closed(JoinSide::Right),
            },
        };
        let (side, env) = match feed {
            Feed::Cancelled => break Err(PipelineError::Cancelled),
            Feed::Closed(JoinSide::Left) => {
                left_open = false;
                continue;
            }
            Feed::Closed(JoinSide::Right) => {
                right_open = false;
                continue;
            }
            Feed::Item(side, env) => (side, env),
        };
        match join.offer(side, &env, &shared.ctx).await {
            Ok(outputs) => match fan_out(&mut fan, outputs).await {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(error) => break Err(error),
            },
            Err(error) if error.is_cancellation() => break Err(PipelineError::Cancelled),
            Err(error) => {
                match decide_node_failure(id, error, shared.pipeline_handler.as_ref(), &shared.ctx)
                    .await
                {
                    NodeFate::Fail(error) => break 'run Err(error),
                    NodeFate::Continue => break 'run Ok(()),
                    NodeFate::Restart => continue,
                }
            }
        }
    };
    if join.unpaired() > 0 {
        tracing::debug!(
            target: TRACING_TARGET,
            node = %id,
            unpaired = join.unpaired(),
            "discarding unpaired join items at end of stream"
        );
    }
    drop(fan);
    (Some(NodeCell::Join(join)), result)
}

async fn run_aggregate(
    id: &NodeId,
    mut aggregate: Box<dyn crate::erased::AnyAggregate>,
    senders: Vec<mpsc::Sender<Envelope>>,
    mut inputs: Vec<mpsc::Receiver<Envelope>>,
    shared: &RunShared,
) -> (Option<NodeCell>, Result<()>) {
    let mut rx = inputs.pop().unwrap_or_else(closed_receiver);
    let mut fan = OutputFan::new(senders, aggregate.out_cloner(), shared.cancel.clone());
    let result = loop {
        let received = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break Err(PipelineError::Cancelled),
            received = rx.recv() => received,
        };
        let Some(env) = received else {
            // End of input: close every remaining window.
            match aggregate.drain(&shared.ctx).await {
                Ok(outputs) => match fan_out(&mut fan, outputs).await {
                    Ok(_) => break Ok(()),
                    Err(error) => break Err(error),
                },
                Err(error) => {
                    break Err(PipelineError::node_failure(id.as_str(), error));
                }
            }
        };
        match aggregate.offer(&env, &shared.ctx).await {
            Ok(outputs) => match fan_out(&mut fan, outputs).await {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(error) => break Err(error),
            },
            Err(error) if error.is_cancellation() => break Err(PipelineError::Cancelled),
            Err(error) => {
                match decide_node_failure(id, error, shared.pipeline_handler.as_ref(), &shared.ctx)
                    .await
                {
                    NodeFate::Fail(error) => break Err(error),
                    NodeFate::Continue => break Ok(()),
                    NodeFate::Restart => continue,
                }
            }
        }
    };
    let late = aggregate.late_drops();
    if late > 0 {
        tracing::warn!(
            target: TRACING_TARGET,
            node = %id,
            dropped = late,
            "aggregate dropped late items"
        );
    }
    shared
        .ctx
        .set_item(diagnostics::window_late_drops(id), late);
    drop(fan);
    (Some(NodeCell::Aggregate(aggregate)), result)
}
