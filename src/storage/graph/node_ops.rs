//! Node mutations. Every operation validates against the workspace's
//! working image, then stages one atomic batch: record, label-membership
//! tags, property-index entries and constraint sentinels move together.

use tracing::warn;
use uuid::Uuid;

use crate::error::{NornicError, Result};
use crate::model::{now_millis, Embedding, Node, Properties};
use crate::schema::{self, FulltextConfig, SchemaCatalog};
use crate::search::fulltext::{extract_text, FtDelta};
use crate::storage::keys;
use crate::storage::kv::WriteBatch;
use crate::wal::WalOp;

use super::Workspace;

/// Inputs for a node creation.
#[derive(Debug, Clone, Default)]
pub struct NodeSpec {
    /// Caller-supplied stable id; a fresh UUID when absent.
    pub id: Option<String>,
    pub labels: Vec<String>,
    pub properties: Properties,
}

/// Inputs for a node update. A `Null` in `set_props` removes the property.
#[derive(Debug, Clone, Default)]
pub struct NodeDelta {
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
    pub set_props: Properties,
}

impl Workspace {
    pub fn create_node(
        &mut self,
        catalog: &SchemaCatalog,
        ft: &FulltextConfig,
        spec: NodeSpec,
        ordinal: u64,
    ) -> Result<Node> {
        let mut labels = Vec::new();
        for label in &spec.labels {
            let canonical = catalog.canonical_label(label)?;
            if !labels.contains(&canonical) {
                labels.push(canonical);
            }
        }
        let id = match spec.id {
            Some(id) => {
                if self.get_raw(&keys::node_key(&id)).is_some() {
                    return Err(NornicError::InvalidRequest(format!(
                        "node {id} already exists"
                    )));
                }
                id
            }
            None => Uuid::new_v4().to_string(),
        };
        let node = Node {
            id,
            ordinal,
            labels,
            properties: spec.properties,
            created_at: now_millis(),
            embedding: None,
        };

        let constraints = catalog.constraints();
        let sentinels = schema::node_sentinels(&constraints, &node)?;
        let change = schema::diff_sentinels(
            &[],
            &sentinels,
            &node.id,
            ("UNIQUE", &node.labels.join(":")),
            |key| self.get_raw(key).map(|v| String::from_utf8_lossy(v).into_owned()),
        )?;

        let mut batch = WriteBatch::new();
        batch.put(keys::node_key(&node.id), super::encode_record(&node)?);
        add_node_index_entries(&mut batch, &node);
        for (key, owner) in &change.add {
            self.added_sentinels.push(key.clone());
            batch.put(key.clone(), owner.clone().into_bytes());
        }

        self.stats.nodes_created += 1;
        self.stats.labels_added += node.labels.len() as u64;
        self.stats.properties_set += node
            .properties
            .values()
            .filter(|v| !v.is_null())
            .count() as u64;
        for label in &node.labels {
            self.label_deltas.push((label.clone(), 1));
        }
        if ft.covers_label(&lc(&node.labels)) {
            if let Some(text) = extract_text(&node.properties, &ft.properties) {
                self.fulltext.push(FtDelta {
                    id: node.id.clone(),
                    old_text: None,
                    new_text: Some(text),
                });
                self.embed_ids.push(node.id.clone());
            }
        }
        self.wal_ops.push(WalOp::CreateNode(node.clone()));
        self.apply_batch(batch);
        Ok(node)
    }

    pub fn update_node(
        &mut self,
        catalog: &SchemaCatalog,
        ft: &FulltextConfig,
        id: &str,
        delta: NodeDelta,
    ) -> Result<Node> {
        let old = self.view().get_node(id)?;

        let mut labels = old.labels.clone();
        for label in &delta.remove_labels {
            let lc = label.to_lowercase();
            labels.retain(|l| l.to_lowercase() != lc);
        }
        let mut labels_added = 0u64;
        for label in &delta.add_labels {
            let canonical = catalog.canonical_label(label)?;
            if !labels.contains(&canonical) {
                labels.push(canonical);
                labels_added += 1;
            }
        }
        let mut properties = old.properties.clone();
        let mut properties_set = 0u64;
        for (key, value) in &delta.set_props {
            properties_set += 1;
            if value.is_null() {
                properties.remove(key);
            } else {
                properties.insert(key.clone(), value.clone());
            }
        }

        let old_text = node_text(&old, ft);
        let mut new = Node {
            labels,
            properties,
            ..old.clone()
        };
        let new_text = node_text(&new, ft);
        let text_changed = old_text != new_text;
        if text_changed {
            // Stale vector; the queue will regenerate it.
            new.embedding = None;
        }

        let constraints = catalog.constraints();
        let old_sentinels = schema::node_sentinels_lenient(&constraints, &old);
        let new_sentinels = schema::node_sentinels(&constraints, &new)?;
        let change = schema::diff_sentinels(
            &old_sentinels,
            &new_sentinels,
            &new.id,
            ("UNIQUE", &new.labels.join(":")),
            |key| self.get_raw(key).map(|v| String::from_utf8_lossy(v).into_owned()),
        )?;

        let mut batch = WriteBatch::new();
        remove_node_index_entries(&mut batch, &old);
        batch.put(keys::node_key(&new.id), super::encode_record(&new)?);
        add_node_index_entries(&mut batch, &new);
        for key in change.remove {
            batch.delete(key);
        }
        for (key, owner) in &change.add {
            self.added_sentinels.push(key.clone());
            batch.put(key.clone(), owner.clone().into_bytes());
        }

        self.stats.properties_set += properties_set;
        self.stats.labels_added += labels_added;
        for label in &new.labels {
            if !old.labels.contains(label) {
                self.label_deltas.push((label.clone(), 1));
            }
        }
        for label in &old.labels {
            if !new.labels.contains(label) {
                self.label_deltas.push((label.clone(), -1));
            }
        }
        if text_changed {
            self.fulltext.push(FtDelta {
                id: new.id.clone(),
                old_text,
                new_text: new_text.clone(),
            });
            if new_text.is_some() {
                self.embed_ids.push(new.id.clone());
            }
        }
        self.wal_ops.push(WalOp::UpdateNode(new.clone()));
        self.apply_batch(batch);
        Ok(new)
    }

    /// Writes an embedding (or clears it) without touching anything else.
    /// Constraint state cannot change here; the caller is responsible for
    /// journaling the write-back (the worker batches them into one
    /// `bulk-nodes` entry).
    pub fn set_node_embedding(&mut self, id: &str, embedding: Option<Embedding>) -> Result<Node> {
        let old = self.view().get_node(id)?;
        let new = Node {
            embedding,
            ..old
        };
        let mut batch = WriteBatch::new();
        batch.put(keys::node_key(&new.id), super::encode_record(&new)?);
        self.apply_batch(batch);
        Ok(new)
    }

    /// Deletes a node. With `detach`, incident edges go first in the same
    /// batch; without it, any incident edge refuses the delete.
    pub fn delete_node(
        &mut self,
        catalog: &SchemaCatalog,
        ft: &FulltextConfig,
        id: &str,
        detach: bool,
    ) -> Result<usize> {
        let view = self.view();
        let node = view.get_node(id)?;
        let incident = view.incident_edge_ids(id);
        if !incident.is_empty() && !detach {
            return Err(NornicError::constraint(
                "NODE DELETE",
                &node.labels.join(":"),
                &[],
                Some(id.to_string()),
                format!(
                    "cannot delete node {id}: {} incident relationship(s); use DETACH DELETE",
                    incident.len()
                ),
            ));
        }

        let constraints = catalog.constraints();
        let mut batch = WriteBatch::new();
        let mut edges_removed = 0usize;
        for eid in &incident {
            if let Some(edge) = view.try_get_edge(eid)? {
                super::edge_ops::remove_edge_entries(&mut batch, &edge, &constraints);
                self.rel_deltas.push((edge.edge_type.clone(), -1));
                self.wal_ops.push(WalOp::DeleteEdge {
                    id: edge.id.clone(),
                });
                edges_removed += 1;
            }
        }
        remove_node_index_entries(&mut batch, &node);
        for (cname, key_bytes) in schema::node_sentinels_lenient(&constraints, &node) {
            batch.delete(keys::sentinel_key(&cname, &key_bytes));
        }
        batch.delete(keys::node_key(id));

        self.stats.nodes_deleted += 1;
        self.stats.relationships_deleted += edges_removed as u64;
        for label in &node.labels {
            self.label_deltas.push((label.clone(), -1));
        }
        if let Some(old_text) = node_text(&node, ft) {
            self.fulltext.push(FtDelta {
                id: node.id.clone(),
                old_text: Some(old_text),
                new_text: None,
            });
        }
        self.wal_ops.push(WalOp::DeleteNode {
            id: id.to_string(),
            detach,
        });
        self.apply_batch(batch);
        Ok(edges_removed)
    }

    /// Trusted upsert used by snapshot load and WAL replay: no constraint
    /// validation, duplicate-tolerant, index entries rebuilt from the
    /// record.
    pub fn upsert_node_raw(&mut self, catalog: &SchemaCatalog, node: Node) -> Result<()> {
        let constraints = catalog.constraints();
        let mut batch = WriteBatch::new();
        if let Some(bytes) = self.get_raw(&keys::node_key(&node.id)) {
            let old = super::decode_node(bytes)?;
            remove_node_index_entries(&mut batch, &old);
            for (cname, key_bytes) in schema::node_sentinels_lenient(&constraints, &old) {
                batch.delete(keys::sentinel_key(&cname, &key_bytes));
            }
        }
        batch.put(keys::node_key(&node.id), super::encode_record(&node)?);
        add_node_index_entries(&mut batch, &node);
        for (cname, key_bytes) in schema::node_sentinels_lenient(&constraints, &node) {
            batch.put(
                keys::sentinel_key(&cname, &key_bytes),
                node.id.clone().into_bytes(),
            );
        }
        self.apply_batch(batch);
        Ok(())
    }

    /// Trusted delete used by WAL replay; absence is tolerated.
    pub fn remove_node_raw(&mut self, catalog: &SchemaCatalog, id: &str, detach: bool) {
        match self.delete_node(catalog, &FulltextConfig::default(), id, detach) {
            Ok(_) => {}
            Err(NornicError::NotFound { .. }) => {
                warn!(node = id, "replayed delete of absent node");
            }
            Err(err) => {
                warn!(node = id, %err, "replayed node delete failed");
            }
        }
    }
}

fn lc(labels: &[String]) -> Vec<String> {
    labels.iter().map(|l| l.to_lowercase()).collect()
}

pub(super) fn node_text(node: &Node, ft: &FulltextConfig) -> Option<String> {
    if !ft.covers_label(&lc(&node.labels)) {
        return None;
    }
    extract_text(&node.properties, &ft.properties)
}

pub(super) fn add_node_index_entries(batch: &mut WriteBatch, node: &Node) {
    for label in &node.labels {
        let label_lc = label.to_lowercase();
        batch.put(keys::label_key(&label_lc, &node.id), vec![1]);
        for (prop, value) in &node.properties {
            if let Some(value_key) = value.index_key() {
                batch.put(keys::prop_key(&label_lc, prop, &value_key, &node.id), vec![1]);
            }
        }
    }
}

pub(super) fn remove_node_index_entries(batch: &mut WriteBatch, node: &Node) {
    for label in &node.labels {
        let label_lc = label.to_lowercase();
        batch.delete(keys::label_key(&label_lc, &node.id));
        for (prop, value) in &node.properties {
            if let Some(value_key) = value.index_key() {
                batch.delete(keys::prop_key(&label_lc, prop, &value_key, &node.id));
            }
        }
    }
}
