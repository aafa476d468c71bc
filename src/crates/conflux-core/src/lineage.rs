//! Per-item lineage: packets, hops, records, and the lineage sink
//!
//! When lineage is enabled, every item flowing along an edge carries a
//! [`LineagePacket`]: a lineage id minted at the source, the ordered path of
//! nodes the item (or its ancestors) traversed, and one [`Hop`] per
//! transform. How a packet propagates through a node depends on the node's
//! declared [`Cardinality`](crate::node::Cardinality):
//!
//! - `OneToOne` — the output inherits the parent's lineage id.
//! - `OneToMany` — every child inherits the parent's lineage id; the hop
//!   marks the fork.
//! - `ManyToOne` — a fresh id is minted; the hop records the union of
//!   contributing parent ids.
//!
//! Packet allocation sits on the hot path, so hop lists are inline
//! small-vectors and payloads are only rendered for packets whose `collect`
//! flag survived sampling.
//!
//! At a sink, each collected packet becomes a [`LineageRecord`] appended with
//! the sink's own id and handed to the configured [`LineageSink`] before the
//! bare item reaches user code.

use async_trait::async_trait;
use serde::Serialize;
use smallvec::SmallVec;
use std::sync::Mutex;
use uuid::Uuid;

use crate::context::Context;
use crate::error::BoxError;
use crate::graph::NodeId;
use crate::node::Cardinality;

/// One node traversal in an item's ancestry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hop {
    /// Node the hop passed through.
    pub node: NodeId,
    /// Lineage ids of the parent packets that contributed.
    pub input_ids: SmallVec<[Uuid; 4]>,
    /// Cardinality the hop was recorded under.
    pub cardinality: Cardinality,
}

/// Provenance metadata carried alongside an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineagePacket {
    /// Identity of this item's lineage line.
    pub lineage_id: Uuid,
    /// Ordered ids of every node traversed.
    pub traversal_path: Vec<NodeId>,
    /// One entry per transforming hop.
    pub hops: SmallVec<[Hop; 4]>,
    /// Whether this packet survived sampling and should be recorded.
    pub collect: bool,
}

impl LineagePacket {
    /// Mint a packet at a source.
    pub fn at_source(source: &NodeId, collect: bool) -> Self {
        Self {
            lineage_id: Uuid::new_v4(),
            traversal_path: vec![source.clone()],
            hops: SmallVec::new(),
            collect,
        }
    }

    /// Propagate through a 1:1 transform: same lineage id, one more hop.
    pub fn one_to_one(&self, node: &NodeId) -> Self {
        self.inherit(node, Cardinality::OneToOne)
    }

    /// Propagate to one child of a flat-map output.
    pub fn one_to_many(&self, node: &NodeId) -> Self {
        self.inherit(node, Cardinality::OneToMany)
    }

    fn inherit(&self, node: &NodeId, cardinality: Cardinality) -> Self {
        let mut traversal_path = self.traversal_path.clone();
        traversal_path.push(node.clone());
        let mut hops = self.hops.clone();
        hops.push(Hop {
            node: node.clone(),
            input_ids: SmallVec::from_slice(&[self.lineage_id]),
            cardinality,
        });
        Self {
            lineage_id: self.lineage_id,
            traversal_path,
            hops,
            collect: self.collect,
        }
    }

    /// Merge many contributors into one output packet with a fresh id.
    ///
    /// The traversal path continues from the first contributor; the full
    /// ancestry stays available through the recorded hop's `input_ids`.
    pub fn many_to_one(parents: &[LineagePacket], node: &NodeId) -> Self {
        let mut input_ids: SmallVec<[Uuid; 4]> = SmallVec::new();
        for parent in parents {
            if !input_ids.contains(&parent.lineage_id) {
                input_ids.push(parent.lineage_id);
            }
        }
        let mut traversal_path = parents
            .first()
            .map(|p| p.traversal_path.clone())
            .unwrap_or_default();
        traversal_path.push(node.clone());
        let mut hops = parents
            .first()
            .map(|p| p.hops.clone())
            .unwrap_or_default();
        hops.push(Hop {
            node: node.clone(),
            input_ids,
            cardinality: Cardinality::ManyToOne,
        });
        Self {
            lineage_id: Uuid::new_v4(),
            traversal_path,
            hops,
            collect: parents.iter().any(|p| p.collect),
        }
    }
}

/// Frozen lineage configuration for a graph.
#[derive(Clone)]
pub struct LineageOptions {
    /// Master switch; when false no packets are allocated.
    pub enabled: bool,
    /// Record every n-th packet per source (1 records everything).
    pub sample_every: u64,
    /// When true, payloads are never rendered into records.
    pub redact_data: bool,
    /// Destination for lineage records observed at sinks.
    pub sink: Option<std::sync::Arc<dyn LineageSink>>,
}

impl Default for LineageOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_every: 1,
            redact_data: false,
            sink: None,
        }
    }
}

impl std::fmt::Debug for LineageOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineageOptions")
            .field("enabled", &self.enabled)
            .field("sample_every", &self.sample_every)
            .field("redact_data", &self.redact_data)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

/// Finished provenance for one item observed at a sink.
#[derive(Debug, Clone, Serialize)]
pub struct LineageRecord {
    /// Lineage id at the sink.
    pub lineage_id: Uuid,
    /// Full path, ending with the sink's id.
    pub traversal_path: Vec<NodeId>,
    /// Hops accumulated along the path.
    pub hops: Vec<Hop>,
    /// Debug rendering of the payload, unless redacted.
    pub payload: Option<String>,
}

/// Destination for lineage records.
#[async_trait]
pub trait LineageSink: Send + Sync + 'static {
    /// Persist one record.
    async fn record(&self, record: LineageRecord, ctx: &Context) -> Result<(), BoxError>;
}

/// In-memory lineage sink, mainly for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryLineageSink {
    records: Mutex<Vec<LineageRecord>>,
}

impl MemoryLineageSink {
    /// New, empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn records(&self) -> Vec<LineageRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl LineageSink for MemoryLineageSink {
    async fn record(&self, record: LineageRecord, _ctx: &Context) -> Result<(), BoxError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    #[test]
    fn test_source_packet() {
        let packet = LineagePacket::at_source(&id("numbers"), true);
        assert_eq!(packet.traversal_path, vec![id("numbers")]);
        assert!(packet.hops.is_empty());
        assert!(packet.collect);
    }

    #[test]
    fn test_one_to_one_inherits_id() {
        let parent = LineagePacket::at_source(&id("numbers"), true);
        let child = parent.one_to_one(&id("double"));
        assert_eq!(child.lineage_id, parent.lineage_id);
        assert_eq!(child.traversal_path, vec![id("numbers"), id("double")]);
        assert_eq!(child.hops.len(), 1);
        assert_eq!(child.hops[0].cardinality, Cardinality::OneToOne);
        assert_eq!(child.hops[0].input_ids.as_slice(), &[parent.lineage_id]);
    }

    #[test]
    fn test_many_to_one_mints_fresh_id() {
        let a = LineagePacket::at_source(&id("left"), false);
        let b = LineagePacket::at_source(&id("right"), true);
        let merged = LineagePacket::many_to_one(&[a.clone(), b.clone()], &id("join"));
        assert_ne!(merged.lineage_id, a.lineage_id);
        assert_ne!(merged.lineage_id, b.lineage_id);
        let hop = merged.hops.last().unwrap();
        assert!(hop.input_ids.contains(&a.lineage_id));
        assert!(hop.input_ids.contains(&b.lineage_id));
        // Any collected contributor keeps the merged packet collected.
        assert!(merged.collect);
    }

    #[test]
    fn test_many_to_one_dedupes_contributors() {
        let a = LineagePacket::at_source(&id("src"), true);
        let merged = LineagePacket::many_to_one(&[a.clone(), a.clone()], &id("agg"));
        assert_eq!(merged.hops.last().unwrap().input_ids.len(), 1);
    }
}
