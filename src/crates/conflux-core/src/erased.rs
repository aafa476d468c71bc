//! Type-erased node adapters used by the runtime
//!
//! The builder's typed API ends here: each registered node is wrapped in an
//! adapter that erases its item types behind `Box<dyn Any + Send>` so the
//! scheduler can wire heterogeneous nodes over uniform channels. The adapter
//! is where downcasting, lineage rewrap, join pairing, and window folding
//! happen — with the concrete types still in scope, so cloning and `Debug`
//! rendering for dead-letter routing need no reflection.
//!
//! Every channel message is an [`Envelope`]: the erased item plus an optional
//! lineage packet. When lineage is disabled the option stays `None` and the
//! envelope costs nothing beyond the box.

use async_trait::async_trait;
use chrono::Utc;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::{BoxError, PipelineError, Result};
use crate::graph::{JoinSide, NodeId};
use crate::lineage::LineagePacket;
use crate::node::{
    Aggregate, Cardinality, Join, NodeKind, NodeMetadata, Sink, Source, Transform,
};
use crate::window::WindowStore;

/// Erased item flowing along a channel.
pub(crate) type AnyItem = Box<dyn Any + Send>;

/// Typed clone function for an erased item.
pub(crate) type ClonerFn = Arc<dyn Fn(&AnyItem) -> Option<AnyItem> + Send + Sync>;

/// One message on an edge channel.
pub(crate) struct Envelope {
    pub data: AnyItem,
    pub lineage: Option<LineagePacket>,
}

impl Envelope {
    pub(crate) fn new(data: AnyItem, lineage: Option<LineagePacket>) -> Self {
        Self { data, lineage }
    }

    pub(crate) fn try_clone(&self, cloner: &ClonerFn) -> Option<Envelope> {
        cloner(&self.data).map(|data| Envelope {
            data,
            lineage: self.lineage.clone(),
        })
    }
}

pub(crate) fn cloner_of<T: Clone + Send + 'static>() -> ClonerFn {
    Arc::new(|item: &AnyItem| {
        item.downcast_ref::<T>()
            .map(|typed| Box::new(typed.clone()) as AnyItem)
    })
}

/// Typed `Debug` rendering for an erased item.
pub(crate) type RenderFn = Arc<dyn Fn(&Envelope) -> String + Send + Sync>;

pub(crate) fn renderer_of<T: fmt::Debug + 'static>() -> RenderFn {
    Arc::new(|env: &Envelope| {
        env.data
            .downcast_ref::<T>()
            .map(|typed| format!("{typed:?}"))
            .unwrap_or_else(|| "<foreign item>".to_string())
    })
}

fn downcast_ref<'a, T: 'static>(env: &'a Envelope, node: &NodeId) -> Result<&'a T> {
    env.data.downcast_ref::<T>().ok_or_else(|| {
        PipelineError::internal(format!(
            "item arriving at node '{node}' is not a {}",
            std::any::type_name::<T>()
        ))
    })
}

/// Why a fan-out send did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FanError {
    /// The run's token fired mid-send.
    Cancelled,
    /// Every downstream consumer is gone.
    Closed,
}

/// Broadcasting tee over a node's outgoing edges.
///
/// One consumer receives the original envelope; every other consumer
/// receives a typed clone. Sends block while a downstream channel is full,
/// which is the backpressure path. A consumer that went away is dropped from
/// the fan; the fan only fails once no consumers remain.
pub(crate) struct OutputFan {
    senders: Vec<mpsc::Sender<Envelope>>,
    cloner: ClonerFn,
    cancel: CancellationToken,
}

impl OutputFan {
    pub(crate) fn new(
        senders: Vec<mpsc::Sender<Envelope>>,
        cloner: ClonerFn,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            senders,
            cloner,
            cancel,
        }
    }

    pub(crate) async fn send(&mut self, env: Envelope) -> std::result::Result<(), FanError> {
        if self.senders.is_empty() {
            return Err(FanError::Closed);
        }
        // Clones for every consumer past the first.
        let mut payloads = Vec::with_capacity(self.senders.len());
        for _ in 1..self.senders.len() {
            match env.try_clone(&self.cloner) {
                Some(clone) => payloads.push(clone),
                None => return Err(FanError::Closed),
            }
        }
        payloads.push(env);

        let mut gone: Vec<usize> = Vec::new();
        for (idx, (sender, payload)) in self.senders.iter().zip(payloads).enumerate() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(FanError::Cancelled),
                sent = sender.send(payload) => {
                    if sent.is_err() {
                        gone.push(idx);
                    }
                }
            }
        }
        for idx in gone.into_iter().rev() {
            self.senders.remove(idx);
        }
        if self.senders.is_empty() {
            Err(FanError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Error returned by [`SourceOutput::emit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitError {
    cancelled: bool,
}

impl EmitError {
    /// True when the run was cancelled (as opposed to downstream closing).
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cancelled {
            f.write_str("emit aborted: run cancelled")
        } else {
            f.write_str("emit aborted: downstream closed")
        }
    }
}

impl std::error::Error for EmitError {}

/// Lineage minting state for one source.
pub(crate) struct SourceLineage {
    node: NodeId,
    sample_every: u64,
    counter: AtomicU64,
}

impl SourceLineage {
    pub(crate) fn new(node: NodeId, sample_every: u64) -> Self {
        Self {
            node,
            sample_every: sample_every.max(1),
            counter: AtomicU64::new(0),
        }
    }

    fn next(&self) -> LineagePacket {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        LineagePacket::at_source(&self.node, n % self.sample_every == 0)
    }
}

/// Erased emitter handed to a source adapter.
pub(crate) struct EmitterCore {
    pub(crate) fan: OutputFan,
    pub(crate) lineage: Option<SourceLineage>,
}

impl EmitterCore {
    async fn emit_erased(&mut self, data: AnyItem) -> std::result::Result<(), EmitError> {
        let lineage = self.lineage.as_ref().map(|l| l.next());
        self.fan
            .send(Envelope::new(data, lineage))
            .await
            .map_err(|e| EmitError {
                cancelled: matches!(e, FanError::Cancelled),
            })
    }
}

/// Typed emitter a [`Source`](crate::node::Source) pushes items into.
///
/// Each `emit` suspends while downstream buffers are full; this is how
/// backpressure reaches the source. Emitting fails once the run is cancelled
/// or every downstream consumer is gone, and sources are expected to
/// propagate that error with `?`.
pub struct SourceOutput<T> {
    core: EmitterCore,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T: Send + 'static> SourceOutput<T> {
    pub(crate) fn new(core: EmitterCore) -> Self {
        Self {
            core,
            _marker: std::marker::PhantomData,
        }
    }

    /// Push one item downstream, waiting for buffer space.
    pub async fn emit(&mut self, item: T) -> std::result::Result<(), EmitError> {
        self.core.emit_erased(Box::new(item)).await
    }

    pub(crate) fn into_core(self) -> EmitterCore {
        self.core
    }
}

/// Erased source driven by the scheduler.
///
/// `run` hands the emitter core back so the task can restart the source
/// without rebuilding the fan.
#[async_trait]
pub(crate) trait AnySource: Send {
    async fn run(
        &mut self,
        core: EmitterCore,
        ctx: &Context,
    ) -> (EmitterCore, std::result::Result<(), BoxError>);
    fn out_cloner(&self) -> ClonerFn;
    async fn dispose(&mut self) -> std::result::Result<(), BoxError>;
}

struct SourceAdapter<S: Source> {
    inner: S,
}

#[async_trait]
impl<S: Source> AnySource for SourceAdapter<S> {
    async fn run(
        &mut self,
        core: EmitterCore,
        ctx: &Context,
    ) -> (EmitterCore, std::result::Result<(), BoxError>) {
        let mut out = SourceOutput::new(core);
        let result = self.inner.run(&mut out, ctx).await;
        (out.into_core(), result)
    }

    fn out_cloner(&self) -> ClonerFn {
        cloner_of::<S::Out>()
    }

    async fn dispose(&mut self) -> std::result::Result<(), BoxError> {
        self.inner.dispose().await
    }
}

/// Erased transform; `apply` is `&self` so parallel workers can share it.
#[async_trait]
pub(crate) trait AnyTransform: Send + Sync {
    async fn apply(&self, env: &Envelope, ctx: &Context) -> Result<Vec<Envelope>>;
    fn out_cloner(&self) -> ClonerFn;
    fn in_cloner(&self) -> ClonerFn;
    fn renderer(&self) -> RenderFn;
    async fn dispose(&mut self) -> std::result::Result<(), BoxError>;
}

struct TransformAdapter<T: Transform> {
    inner: T,
    node: NodeId,
    meta: NodeMetadata,
}

impl<T: Transform> TransformAdapter<T> {
    fn rewrap(&self, parent: Option<&LineagePacket>, outputs: Vec<T::Out>) -> Result<Vec<Envelope>> {
        let Some(parent) = parent else {
            return Ok(outputs
                .into_iter()
                .map(|o| Envelope::new(Box::new(o), None))
                .collect());
        };
        if self.meta.cardinality == Cardinality::OneToOne && outputs.len() != 1 {
            return Err(PipelineError::Node(
                format!(
                    "transform '{}' declares one-to-one cardinality but returned {} items",
                    self.node,
                    outputs.len()
                )
                .into(),
            ));
        }
        let parents = std::slice::from_ref(parent);
        let envelopes = outputs
            .into_iter()
            .enumerate()
            .map(|(idx, out)| {
                let packet = if self.meta.custom_lineage {
                    self.inner.map_lineage(parents, &out, idx)
                } else {
                    None
                };
                let packet = packet.unwrap_or_else(|| match self.meta.cardinality {
                    Cardinality::OneToOne => parent.one_to_one(&self.node),
                    Cardinality::OneToMany => parent.one_to_many(&self.node),
                    Cardinality::ManyToOne => {
                        LineagePacket::many_to_one(parents, &self.node)
                    }
                });
                Envelope::new(Box::new(out), Some(packet))
            })
            .collect();
        Ok(envelopes)
    }
}

#[async_trait]
impl<T: Transform> AnyTransform for TransformAdapter<T> {
    async fn apply(&self, env: &Envelope, ctx: &Context) -> Result<Vec<Envelope>> {
        let item = downcast_ref::<T::In>(env, &self.node)?.clone();
        let outputs = self
            .inner
            .apply(item, ctx)
            .await
            .map_err(PipelineError::Node)?;
        self.rewrap(env.lineage.as_ref(), outputs)
    }

    fn out_cloner(&self) -> ClonerFn {
        cloner_of::<T::Out>()
    }

    fn in_cloner(&self) -> ClonerFn {
        cloner_of::<T::In>()
    }

    fn renderer(&self) -> RenderFn {
        renderer_of::<T::In>()
    }

    async fn dispose(&mut self) -> std::result::Result<(), BoxError> {
        self.inner.dispose().await
    }
}

/// Erased sink.
#[async_trait]
pub(crate) trait AnySink: Send {
    async fn write(&mut self, env: &Envelope, ctx: &Context) -> Result<()>;
    async fn flush(&mut self, ctx: &Context) -> Result<()>;
    fn in_cloner(&self) -> ClonerFn;
    fn renderer(&self) -> RenderFn;
    async fn dispose(&mut self) -> std::result::Result<(), BoxError>;
}

struct SinkAdapter<S: Sink> {
    inner: S,
    node: NodeId,
}

#[async_trait]
impl<S: Sink> AnySink for SinkAdapter<S> {
    async fn write(&mut self, env: &Envelope, ctx: &Context) -> Result<()> {
        let item = downcast_ref::<S::In>(env, &self.node)?.clone();
        self.inner.write(item, ctx).await.map_err(PipelineError::Node)
    }

    async fn flush(&mut self, ctx: &Context) -> Result<()> {
        self.inner.flush(ctx).await.map_err(PipelineError::Node)
    }

    fn in_cloner(&self) -> ClonerFn {
        cloner_of::<S::In>()
    }

    fn renderer(&self) -> RenderFn {
        renderer_of::<S::In>()
    }

    async fn dispose(&mut self) -> std::result::Result<(), BoxError> {
        self.inner.dispose().await
    }
}

/// Erased join with internal FIFO pairing buffers.
#[async_trait]
pub(crate) trait AnyJoin: Send {
    async fn offer(&mut self, side: JoinSide, env: &Envelope, ctx: &Context)
        -> Result<Vec<Envelope>>;
    fn out_cloner(&self) -> ClonerFn;
    /// Unpaired items remaining when both inputs closed.
    fn unpaired(&self) -> usize;
    async fn dispose(&mut self) -> std::result::Result<(), BoxError>;
}

struct PairBuffer<L, R> {
    left: VecDeque<(L, Option<LineagePacket>)>,
    right: VecDeque<(R, Option<LineagePacket>)>,
}

impl<L, R> Default for PairBuffer<L, R> {
    fn default() -> Self {
        Self {
            left: VecDeque::new(),
            right: VecDeque::new(),
        }
    }
}

struct JoinAdapter<J: Join> {
    inner: J,
    node: NodeId,
    buffers: HashMap<J::Key, PairBuffer<J::Left, J::Right>>,
}

impl<J: Join> JoinAdapter<J> {
    fn merged_lineage(
        &self,
        left: &Option<LineagePacket>,
        right: &Option<LineagePacket>,
    ) -> Option<LineagePacket> {
        match (left, right) {
            (None, None) => None,
            (l, r) => {
                let parents: Vec<LineagePacket> =
                    l.iter().chain(r.iter()).cloned().collect();
                Some(LineagePacket::many_to_one(&parents, &self.node))
            }
        }
    }
}

#[async_trait]
impl<J: Join> AnyJoin for JoinAdapter<J> {
    async fn offer(
        &mut self,
        side: JoinSide,
        env: &Envelope,
        ctx: &Context,
    ) -> Result<Vec<Envelope>> {
        let matched = match side {
            JoinSide::Left => {
                let item = downcast_ref::<J::Left>(env, &self.node)?.clone();
                let key = self.inner.left_key(&item);
                let buffer = self.buffers.entry(key).or_default();
                match buffer.right.pop_front() {
                    Some((right, right_lineage)) => {
                        Some((item, env.lineage.clone(), right, right_lineage))
                    }
                    None => {
                        buffer.left.push_back((item, env.lineage.clone()));
                        None
                    }
                }
            }
            JoinSide::Right => {
                let item = downcast_ref::<J::Right>(env, &self.node)?.clone();
                let key = self.inner.right_key(&item);
                let buffer = self.buffers.entry(key).or_default();
                match buffer.left.pop_front() {
                    Some((left, left_lineage)) => {
                        Some((left, left_lineage, item, env.lineage.clone()))
                    }
                    None => {
                        buffer.right.push_back((item, env.lineage.clone()));
                        None
                    }
                }
            }
        };

        let Some((left, left_lineage, right, right_lineage)) = matched else {
            return Ok(Vec::new());
        };
        let lineage = self.merged_lineage(&left_lineage, &right_lineage);
        let out = self
            .inner
            .merge(left, right, ctx)
            .await
            .map_err(PipelineError::Node)?;
        Ok(vec![Envelope::new(Box::new(out), lineage)])
    }

    fn out_cloner(&self) -> ClonerFn {
        cloner_of::<J::Out>()
    }

    fn unpaired(&self) -> usize {
        self.buffers
            .values()
            .map(|b| b.left.len() + b.right.len())
            .sum()
    }

    async fn dispose(&mut self) -> std::result::Result<(), BoxError> {
        self.inner.dispose().await
    }
}

/// Erased aggregate with internal window state.
#[async_trait]
pub(crate) trait AnyAggregate: Send {
    async fn offer(&mut self, env: &Envelope, ctx: &Context) -> Result<Vec<Envelope>>;
    /// Close all remaining windows at end of input.
    async fn drain(&mut self, ctx: &Context) -> Result<Vec<Envelope>>;
    /// Items dropped for arriving behind the watermark.
    fn late_drops(&self) -> u64;
    fn out_cloner(&self) -> ClonerFn;
    async fn dispose(&mut self) -> std::result::Result<(), BoxError>;
}

struct AggregateAdapter<A: Aggregate> {
    inner: A,
    node: NodeId,
    store: WindowStore<A::Key, A::Acc>,
}

impl<A: Aggregate> AggregateAdapter<A> {
    fn emit_closed(
        &mut self,
        closed: Vec<crate::window::ClosedWindow<A::Key, A::Acc>>,
    ) -> Vec<Envelope> {
        closed
            .into_iter()
            .map(|window| {
                let lineage = (!window.contributors.is_empty())
                    .then(|| LineagePacket::many_to_one(&window.contributors, &self.node));
                let out = self.inner.finish(window.key, window.bounds, window.acc);
                Envelope::new(Box::new(out), lineage)
            })
            .collect()
    }
}

#[async_trait]
impl<A: Aggregate> AnyAggregate for AggregateAdapter<A> {
    async fn offer(&mut self, env: &Envelope, _ctx: &Context) -> Result<Vec<Envelope>> {
        let item = downcast_ref::<A::In>(env, &self.node)?.clone();
        let timestamp = self.inner.timestamp(&item).unwrap_or_else(Utc::now);
        let key = self.inner.key(&item);
        let Some(windows) = self.store.admit(&key, timestamp) else {
            tracing::trace!(
                target: crate::window::TRACING_TARGET,
                node = %self.node,
                %timestamp,
                "dropping late item"
            );
            return Ok(Vec::new());
        };
        let inner = &self.inner;
        for bounds in windows {
            self.store
                .fold_into(key.clone(), bounds, env.lineage.as_ref(), |acc| {
                    inner.fold(acc.unwrap_or_else(|| inner.init()), &item)
                });
        }
        let closed = self.store.close_ripe();
        Ok(self.emit_closed(closed))
    }

    async fn drain(&mut self, _ctx: &Context) -> Result<Vec<Envelope>> {
        let closed = self.store.drain_all();
        Ok(self.emit_closed(closed))
    }

    fn late_drops(&self) -> u64 {
        self.store.late_drops()
    }

    fn out_cloner(&self) -> ClonerFn {
        cloner_of::<A::Out>()
    }

    async fn dispose(&mut self) -> std::result::Result<(), BoxError> {
        self.inner.dispose().await
    }
}

/// A node instance with its types erased, ready for the scheduler.
pub(crate) enum NodeCell {
    Source(Box<dyn AnySource>),
    Transform(Box<dyn AnyTransform>),
    Sink(Box<dyn AnySink>),
    Join(Box<dyn AnyJoin>),
    Aggregate(Box<dyn AnyAggregate>),
}

impl NodeCell {
    pub(crate) fn source<S: Source>(source: S) -> Self {
        NodeCell::Source(Box::new(SourceAdapter { inner: source }))
    }

    pub(crate) fn transform<T: Transform>(node: NodeId, transform: T) -> Self {
        let meta = T::metadata();
        NodeCell::Transform(Box::new(TransformAdapter {
            inner: transform,
            node,
            meta,
        }))
    }

    pub(crate) fn sink<S: Sink>(node: NodeId, sink: S) -> Self {
        NodeCell::Sink(Box::new(SinkAdapter { inner: sink, node }))
    }

    pub(crate) fn join<J: Join>(node: NodeId, join: J) -> Self {
        NodeCell::Join(Box::new(JoinAdapter {
            inner: join,
            node,
            buffers: HashMap::new(),
        }))
    }

    pub(crate) fn aggregate<A: Aggregate>(node: NodeId, aggregate: A) -> Self {
        let store = WindowStore::new(A::assigner());
        NodeCell::Aggregate(Box::new(AggregateAdapter {
            inner: aggregate,
            node,
            store,
        }))
    }

    pub(crate) fn kind(&self) -> NodeKind {
        match self {
            NodeCell::Source(_) => NodeKind::Source,
            NodeCell::Transform(_) => NodeKind::Transform,
            NodeCell::Sink(_) => NodeKind::Sink,
            NodeCell::Join(_) => NodeKind::Join,
            NodeCell::Aggregate(_) => NodeKind::Aggregate,
        }
    }

    pub(crate) async fn dispose(&mut self) -> std::result::Result<(), BoxError> {
        match self {
            NodeCell::Source(n) => n.dispose().await,
            NodeCell::Transform(n) => n.dispose().await,
            NodeCell::Sink(n) => n.dispose().await,
            NodeCell::Join(n) => n.dispose().await,
            NodeCell::Aggregate(n) => n.dispose().await,
        }
    }
}
