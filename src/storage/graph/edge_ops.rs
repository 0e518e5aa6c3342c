//! Edge mutations. Endpoints must resolve in the working image; each edge is
//! stored once with a forward and a reverse adjacency key.

use tracing::warn;
use uuid::Uuid;

use crate::error::{NornicError, Result};
use crate::model::{now_millis, Edge, Properties};
use crate::schema::{self, Constraint, SchemaCatalog};
use crate::storage::keys;
use crate::storage::kv::WriteBatch;
use crate::wal::WalOp;

use super::Workspace;

impl Workspace {
    pub fn create_edge(
        &mut self,
        catalog: &SchemaCatalog,
        start: &str,
        end: &str,
        edge_type: &str,
        properties: Properties,
        ordinal: u64,
    ) -> Result<Edge> {
        let view = self.view();
        if view.try_get_node(start)?.is_none() {
            return Err(NornicError::not_found("node", start));
        }
        if view.try_get_node(end)?.is_none() {
            return Err(NornicError::not_found("node", end));
        }
        let edge_type = catalog.canonical_rel_type(edge_type)?;
        let edge = Edge {
            id: Uuid::new_v4().to_string(),
            ordinal,
            start: start.to_string(),
            end: end.to_string(),
            edge_type,
            properties,
            created_at: now_millis(),
        };

        let constraints = catalog.constraints();
        let sentinels = schema::edge_sentinels(&constraints, &edge)?;
        let change = schema::diff_sentinels(
            &[],
            &sentinels,
            &edge.id,
            ("RELATIONSHIP UNIQUE", &edge.edge_type),
            |key| self.get_raw(key).map(|v| String::from_utf8_lossy(v).into_owned()),
        )?;

        let mut batch = WriteBatch::new();
        batch.put(keys::edge_key(&edge.id), super::encode_record(&edge)?);
        add_edge_entries(&mut batch, &edge);
        for (key, owner) in &change.add {
            self.added_sentinels.push(key.clone());
            batch.put(key.clone(), owner.clone().into_bytes());
        }

        self.stats.relationships_created += 1;
        self.stats.properties_set += edge
            .properties
            .values()
            .filter(|v| !v.is_null())
            .count() as u64;
        self.rel_deltas.push((edge.edge_type.clone(), 1));
        self.wal_ops.push(WalOp::CreateEdge(edge.clone()));
        self.apply_batch(batch);
        Ok(edge)
    }

    pub fn update_edge(
        &mut self,
        catalog: &SchemaCatalog,
        id: &str,
        set_props: Properties,
    ) -> Result<Edge> {
        let old = self.view().get_edge(id)?;
        let mut properties = old.properties.clone();
        let mut properties_set = 0u64;
        for (key, value) in &set_props {
            properties_set += 1;
            if value.is_null() {
                properties.remove(key);
            } else {
                properties.insert(key.clone(), value.clone());
            }
        }
        let new = Edge {
            properties,
            ..old.clone()
        };

        let constraints = catalog.constraints();
        let old_sentinels = schema::edge_sentinels_lenient(&constraints, &old);
        let new_sentinels = schema::edge_sentinels(&constraints, &new)?;
        let change = schema::diff_sentinels(
            &old_sentinels,
            &new_sentinels,
            &new.id,
            ("RELATIONSHIP UNIQUE", &new.edge_type),
            |key| self.get_raw(key).map(|v| String::from_utf8_lossy(v).into_owned()),
        )?;

        let mut batch = WriteBatch::new();
        batch.put(keys::edge_key(&new.id), super::encode_record(&new)?);
        for key in change.remove {
            batch.delete(key);
        }
        for (key, owner) in &change.add {
            self.added_sentinels.push(key.clone());
            batch.put(key.clone(), owner.clone().into_bytes());
        }

        self.stats.properties_set += properties_set;
        self.wal_ops.push(WalOp::UpdateEdge(new.clone()));
        self.apply_batch(batch);
        Ok(new)
    }

    pub fn delete_edge(&mut self, catalog: &SchemaCatalog, id: &str) -> Result<()> {
        let edge = self.view().get_edge(id)?;
        let constraints = catalog.constraints();
        let mut batch = WriteBatch::new();
        remove_edge_entries(&mut batch, &edge, &constraints);

        self.stats.relationships_deleted += 1;
        self.rel_deltas.push((edge.edge_type.clone(), -1));
        self.wal_ops.push(WalOp::DeleteEdge { id: id.to_string() });
        self.apply_batch(batch);
        Ok(())
    }

    /// Trusted upsert used by snapshot load and WAL replay.
    pub fn upsert_edge_raw(&mut self, catalog: &SchemaCatalog, edge: Edge) -> Result<()> {
        let constraints = catalog.constraints();
        let mut batch = WriteBatch::new();
        if let Some(bytes) = self.get_raw(&keys::edge_key(&edge.id)) {
            let old = super::decode_edge(bytes)?;
            remove_edge_entries(&mut batch, &old, &constraints);
        }
        batch.put(keys::edge_key(&edge.id), super::encode_record(&edge)?);
        add_edge_entries(&mut batch, &edge);
        for (cname, key_bytes) in schema::edge_sentinels_lenient(&constraints, &edge) {
            batch.put(
                keys::sentinel_key(&cname, &key_bytes),
                edge.id.clone().into_bytes(),
            );
        }
        self.apply_batch(batch);
        Ok(())
    }

    /// Trusted delete used by WAL replay; absence is tolerated.
    pub fn remove_edge_raw(&mut self, catalog: &SchemaCatalog, id: &str) {
        match self.delete_edge(catalog, id) {
            Ok(()) => {}
            Err(NornicError::NotFound { .. }) => {
                warn!(edge = id, "replayed delete of absent relationship");
            }
            Err(err) => {
                warn!(edge = id, %err, "replayed relationship delete failed");
            }
        }
    }
}

pub(super) fn add_edge_entries(batch: &mut WriteBatch, edge: &Edge) {
    batch.put(
        keys::adj_out_key(&edge.start, &edge.edge_type, &edge.end, &edge.id),
        vec![1],
    );
    batch.put(
        keys::adj_in_key(&edge.end, &edge.edge_type, &edge.start, &edge.id),
        vec![1],
    );
}

pub(super) fn remove_edge_entries(batch: &mut WriteBatch, edge: &Edge, constraints: &[Constraint]) {
    batch.delete(keys::edge_key(&edge.id));
    batch.delete(keys::adj_out_key(
        &edge.start,
        &edge.edge_type,
        &edge.end,
        &edge.id,
    ));
    batch.delete(keys::adj_in_key(
        &edge.end,
        &edge.edge_type,
        &edge.start,
        &edge.id,
    ));
    for (cname, key_bytes) in schema::edge_sentinels_lenient(constraints, edge) {
        batch.delete(keys::sentinel_key(&cname, &key_bytes));
    }
}
