//! Graph store layered on the KV substrate.
//!
//! Reads go through [`GraphView`], a snapshot-consistent decoder over the
//! key schema in [`crate::storage::keys`]. Mutations go through
//! [`Workspace`]: a copy-on-write fork of the live map that stages atomic
//! batches together with everything a commit must carry; WAL payloads,
//! full-text deltas, embedding enqueues, dictionary count deltas and the
//! constraint sentinels the transaction claimed. The engine merges a
//! workspace into the live store under its write gate.

mod edge_ops;
mod node_ops;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{NornicError, Result};
use crate::model::{Edge, EdgeId, Node, NodeId};
use crate::search::fulltext::FtDelta;
use crate::storage::keys;
use crate::storage::kv::{apply_to_map, KvSnapshot, WriteBatch};
use crate::wal::WalOp;

pub use node_ops::{NodeDelta, NodeSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    Both,
}

/// Per-workspace mutation counters, surfaced as statement stats on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStats {
    pub nodes_created: u64,
    pub nodes_deleted: u64,
    pub relationships_created: u64,
    pub relationships_deleted: u64,
    pub properties_set: u64,
    pub labels_added: u64,
    pub constraints_added: u64,
}

impl WriteStats {
    pub fn contains_updates(&self) -> bool {
        *self != WriteStats::default()
    }

    /// Difference `self - earlier`, for per-statement reporting.
    pub fn since(&self, earlier: &WriteStats) -> WriteStats {
        WriteStats {
            nodes_created: self.nodes_created - earlier.nodes_created,
            nodes_deleted: self.nodes_deleted - earlier.nodes_deleted,
            relationships_created: self.relationships_created - earlier.relationships_created,
            relationships_deleted: self.relationships_deleted - earlier.relationships_deleted,
            properties_set: self.properties_set - earlier.properties_set,
            labels_added: self.labels_added - earlier.labels_added,
            constraints_added: self.constraints_added - earlier.constraints_added,
        }
    }
}

pub(crate) fn decode_node(bytes: &[u8]) -> Result<Node> {
    serde_json::from_slice(bytes)
        .map_err(|e| NornicError::Corruption(format!("node record: {e}")))
}

pub(crate) fn decode_edge(bytes: &[u8]) -> Result<Edge> {
    serde_json::from_slice(bytes)
        .map_err(|e| NornicError::Corruption(format!("edge record: {e}")))
}

pub(crate) fn encode_record<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(record).map_err(|e| NornicError::Serialization(e.to_string()))
}

/// Snapshot-consistent read operations.
#[derive(Clone)]
pub struct GraphView {
    snap: KvSnapshot,
}

impl GraphView {
    pub fn new(snap: KvSnapshot) -> Self {
        Self { snap }
    }

    pub fn kv(&self) -> &KvSnapshot {
        &self.snap
    }

    pub fn try_get_node(&self, id: &str) -> Result<Option<Node>> {
        match self.snap.get(&keys::node_key(id)) {
            Some(bytes) => Ok(Some(decode_node(bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_node(&self, id: &str) -> Result<Node> {
        self.try_get_node(id)?
            .ok_or_else(|| NornicError::not_found("node", id))
    }

    pub fn try_get_edge(&self, id: &str) -> Result<Option<Edge>> {
        match self.snap.get(&keys::edge_key(id)) {
            Some(bytes) => Ok(Some(decode_edge(bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_edge(&self, id: &str) -> Result<Edge> {
        self.try_get_edge(id)?
            .ok_or_else(|| NornicError::not_found("relationship", id))
    }

    pub fn node_ids_by_label(&self, label: &str) -> Vec<NodeId> {
        let prefix = keys::label_scan_prefix(&label.to_lowercase());
        let mut ids = Vec::new();
        self.snap.scan_while(&prefix, |k, _| {
            if let Some(id) = keys::last_segment(k) {
                ids.push(id.to_string());
            }
            true
        });
        ids
    }

    pub fn nodes_by_label(&self, label: &str, limit: usize) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        for id in self.node_ids_by_label(label) {
            if nodes.len() >= limit {
                break;
            }
            if let Some(node) = self.try_get_node(&id)? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    /// Node ids whose `property` equals the given canonical value form.
    pub fn node_ids_by_property(&self, label: &str, prop: &str, value_key: &str) -> Vec<NodeId> {
        let prefix = keys::prop_scan_prefix(&label.to_lowercase(), prop, value_key);
        let mut ids = Vec::new();
        self.snap.scan_while(&prefix, |k, _| {
            if let Some(id) = keys::last_segment(k) {
                ids.push(id.to_string());
            }
            true
        });
        ids
    }

    pub fn incident_edge_ids(&self, id: &str) -> Vec<EdgeId> {
        let mut ids = Vec::new();
        for prefix in [keys::adj_out_prefix(id), keys::adj_in_prefix(id)] {
            self.snap.scan_while(&prefix, |k, _| {
                if let Some(eid) = keys::last_segment(k) {
                    ids.push(eid.to_string());
                }
                true
            });
        }
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn neighbors(
        &self,
        id: &str,
        edge_type: Option<&str>,
        direction: Direction,
    ) -> Result<Vec<(Edge, Node)>> {
        let mut out = Vec::new();
        let mut visit = |prefix: Vec<u8>, prefix_tag: &str| -> Result<()> {
            let mut eids = Vec::new();
            self.snap.scan_while(&prefix, |k, _| {
                if let Some(parts) = keys::split_adjacency(k, prefix_tag.len()) {
                    eids.push(parts.3);
                }
                true
            });
            for eid in eids {
                if let Some(edge) = self.try_get_edge(&eid)? {
                    let far = if edge.start == id { &edge.end } else { &edge.start };
                    if let Some(node) = self.try_get_node(far)? {
                        out.push((edge, node));
                    }
                }
            }
            Ok(())
        };
        let wants_out = matches!(direction, Direction::Out | Direction::Both);
        let wants_in = matches!(direction, Direction::In | Direction::Both);
        if wants_out {
            let prefix = match edge_type {
                Some(t) => keys::adj_out_typed_prefix(id, t),
                None => keys::adj_out_prefix(id),
            };
            visit(prefix, keys::ADJ_OUT_PREFIX)?;
        }
        if wants_in {
            let prefix = match edge_type {
                Some(t) => keys::adj_in_typed_prefix(id, t),
                None => keys::adj_in_prefix(id),
            };
            visit(prefix, keys::ADJ_IN_PREFIX)?;
        }
        Ok(out)
    }

    pub fn edges_between(&self, a: &str, b: &str, edge_type: Option<&str>) -> Result<Vec<Edge>> {
        let prefix = match edge_type {
            Some(t) => keys::adj_out_typed_prefix(a, t),
            None => keys::adj_out_prefix(a),
        };
        let mut eids = Vec::new();
        self.snap.scan_while(&prefix, |k, _| {
            if let Some((_, _, far, eid)) = keys::split_adjacency(k, keys::ADJ_OUT_PREFIX.len()) {
                if far == b {
                    eids.push(eid);
                }
            }
            true
        });
        let mut edges = Vec::with_capacity(eids.len());
        for eid in eids {
            if let Some(edge) = self.try_get_edge(&eid)? {
                edges.push(edge);
            }
        }
        Ok(edges)
    }

    /// Cursor page over every node. The cursor is the last returned id.
    pub fn all_nodes(&self, after: Option<&str>, limit: usize) -> Result<(Vec<Node>, Option<String>)> {
        let after_key = after.map(keys::node_key);
        let rows = self
            .snap
            .scan_after(keys::NODE_PREFIX.as_bytes(), after_key.as_deref(), limit);
        let mut nodes = Vec::with_capacity(rows.len());
        for (_, bytes) in &rows {
            nodes.push(decode_node(bytes)?);
        }
        let cursor = if rows.len() == limit {
            nodes.last().map(|n| n.id.clone())
        } else {
            None
        };
        Ok((nodes, cursor))
    }

    pub fn all_edges(&self, after: Option<&str>, limit: usize) -> Result<(Vec<Edge>, Option<String>)> {
        let after_key = after.map(keys::edge_key);
        let rows = self
            .snap
            .scan_after(keys::EDGE_PREFIX.as_bytes(), after_key.as_deref(), limit);
        let mut edges = Vec::with_capacity(rows.len());
        for (_, bytes) in &rows {
            edges.push(decode_edge(bytes)?);
        }
        let cursor = if rows.len() == limit {
            edges.last().map(|e| e.id.clone())
        } else {
            None
        };
        Ok((edges, cursor))
    }

    pub fn count_nodes(&self) -> usize {
        let mut n = 0usize;
        self.snap.scan_while(keys::NODE_PREFIX.as_bytes(), |_, _| {
            n += 1;
            true
        });
        n
    }

    pub fn count_edges(&self) -> usize {
        let mut n = 0usize;
        self.snap.scan_while(keys::EDGE_PREFIX.as_bytes(), |_, _| {
            n += 1;
            true
        });
        n
    }
}

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// Saved position inside a workspace, for statement-level rollback.
pub struct WsMark {
    map: Arc<Map>,
    batches: usize,
    wal_ops: usize,
    fulltext: usize,
    embed_ids: usize,
    label_deltas: usize,
    rel_deltas: usize,
    added_sentinels: usize,
    stats: WriteStats,
}

/// A forked, mutable image of the store plus everything a commit carries.
pub struct Workspace {
    base: Arc<Map>,
    base_generation: u64,
    map: Arc<Map>,
    pub batches: Vec<WriteBatch>,
    pub wal_ops: Vec<WalOp>,
    pub fulltext: Vec<FtDelta>,
    pub embed_ids: Vec<NodeId>,
    pub label_deltas: Vec<(String, i64)>,
    pub rel_deltas: Vec<(String, i64)>,
    /// Sentinel keys this workspace newly occupied; re-validated at commit.
    pub added_sentinels: Vec<Vec<u8>>,
    pub stats: WriteStats,
}

impl Workspace {
    pub fn new(snap: KvSnapshot, generation: u64) -> Self {
        let base = snap.arc();
        Self {
            map: Arc::clone(&base),
            base,
            base_generation: generation,
            batches: Vec::new(),
            wal_ops: Vec::new(),
            fulltext: Vec::new(),
            embed_ids: Vec::new(),
            label_deltas: Vec::new(),
            rel_deltas: Vec::new(),
            added_sentinels: Vec::new(),
            stats: WriteStats::default(),
        }
    }

    pub fn base_generation(&self) -> u64 {
        self.base_generation
    }

    pub fn base_contains(&self, key: &[u8]) -> bool {
        self.base.contains_key(key)
    }

    pub fn image(&self) -> Arc<Map> {
        Arc::clone(&self.map)
    }

    pub fn has_writes(&self) -> bool {
        !self.batches.is_empty()
    }

    /// Snapshot-style read view over the working image.
    pub fn view(&self) -> GraphView {
        GraphView::new(KvSnapshot::new(Arc::clone(&self.map)))
    }

    pub(crate) fn get_raw(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.map.get(key)
    }

    pub(crate) fn apply_batch(&mut self, batch: WriteBatch) {
        {
            let map = Arc::make_mut(&mut self.map);
            apply_to_map(map, &batch);
        }
        self.batches.push(batch);
    }

    pub fn mark(&self) -> WsMark {
        WsMark {
            map: Arc::clone(&self.map),
            batches: self.batches.len(),
            wal_ops: self.wal_ops.len(),
            fulltext: self.fulltext.len(),
            embed_ids: self.embed_ids.len(),
            label_deltas: self.label_deltas.len(),
            rel_deltas: self.rel_deltas.len(),
            added_sentinels: self.added_sentinels.len(),
            stats: self.stats,
        }
    }

    /// Rolls the workspace back to a mark, discarding the statement's
    /// partial writes.
    pub fn revert(&mut self, mark: WsMark) {
        self.map = mark.map;
        self.batches.truncate(mark.batches);
        self.wal_ops.truncate(mark.wal_ops);
        self.fulltext.truncate(mark.fulltext);
        self.embed_ids.truncate(mark.embed_ids);
        self.label_deltas.truncate(mark.label_deltas);
        self.rel_deltas.truncate(mark.rel_deltas);
        self.added_sentinels.truncate(mark.added_sentinels);
        self.stats = mark.stats;
    }
}
