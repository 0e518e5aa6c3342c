//! The engine: one struct owning the KV substrate, graph store, schema
//! catalog, WAL, search indexes and the embedding pipeline. Everything else
//! holds an `Arc<Engine>`.
//!
//! Commits funnel through [`Engine::commit_workspace`] under the write gate:
//! one mutating merge at a time, readers unaffected. A workspace whose base
//! image is still live installs its forked image wholesale; a workspace that
//! raced another commit re-validates the constraint sentinels it claimed and
//! re-applies its batches onto the moved base (last write wins at the key
//! level).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::audit;
use crate::config::{Config, EmbeddingProvider};
use crate::cypher::ast::{ConstraintDef, ConstraintFlavor, Statement};
use crate::cypher::executor::{execute_query, ExecContext, ExecOutcome, OrdinalAllocator};
use crate::cypher::{self, ProcedureRegistry, StatementKind};
use crate::embed::{
    health_probe, CachedEmbedder, EmbedError, EmbedQueue, EmbedStats, Embedder, LocalEmbedder,
    RemoteEmbedder, RemoteFlavor,
};
use crate::error::{NornicError, Result};
use crate::model::{Embedding, Node, PropertyValue};
use crate::schema::{
    self, Constraint, ConstraintKind, DictEntry, FulltextConfig, SchemaCatalog, VectorIndexDef,
};
use crate::search::fulltext::extract_text;
use crate::search::hybrid::{self, SearchHit};
use crate::search::vector;
use crate::search::FulltextIndex;
use crate::storage::graph::{GraphView, Workspace, WriteStats};
use crate::storage::keys;
use crate::storage::kv::{MemKv, WriteBatch};
use crate::wal::snapshot::{load_snapshot, write_snapshot, EngineSnapshot};
use crate::wal::{Wal, WalOp, SNAPSHOT_FILE};

const EMBED_BATCH: usize = 32;
const SEARCH_POOL_FACTOR: usize = 4;

/// Result of one executed statement.
pub struct StatementResult {
    pub outcome: ExecOutcome,
    pub stats: WriteStats,
    pub kind: StatementKind,
}

pub struct CheckpointInfo {
    pub base_seq: u64,
    pub nodes: usize,
    pub edges: usize,
}

pub struct Engine {
    kv: MemKv,
    catalog: SchemaCatalog,
    wal: Option<Wal>,
    fulltext: FulltextIndex,
    fulltext_cfg: FulltextConfig,
    procedures: ProcedureRegistry,
    embedder: RwLock<Option<Arc<CachedEmbedder>>>,
    pub embed_queue: EmbedQueue,
    next_ordinal: AtomicU64,
    last_committed_seq: AtomicU64,
    write_gate: Mutex<()>,
    snapshot_path: std::path::PathBuf,
}

fn op_max_ordinal(op: &WalOp) -> u64 {
    match op {
        WalOp::CreateNode(n) | WalOp::UpdateNode(n) => n.ordinal,
        WalOp::CreateEdge(e) | WalOp::UpdateEdge(e) => e.ordinal,
        WalOp::BulkNodes(nodes) => nodes.iter().map(|n| n.ordinal).max().unwrap_or(0),
        WalOp::BulkEdges(edges) => edges.iter().map(|e| e.ordinal).max().unwrap_or(0),
        WalOp::DeleteNode { .. } | WalOp::DeleteEdge { .. } | WalOp::Checkpoint { .. } => 0,
    }
}

impl OrdinalAllocator for Engine {
    fn next_ordinal(&self) -> u64 {
        self.next_ordinal.fetch_add(1, Ordering::SeqCst)
    }
}

impl Engine {
    /// Opens the engine from a data directory, recovering state from the
    /// snapshot and WAL (or from the KV image when the WAL is disabled).
    pub fn open(config: &Config) -> Result<Engine> {
        std::fs::create_dir_all(config.graph_dir())?;
        let kv_path = config.graph_dir().join("store.kv");
        let snapshot_path = config.wal_dir().join(SNAPSHOT_FILE);
        let catalog = SchemaCatalog::new(config.fulltext.clone());

        let mut snapshot_next_ordinal = 1u64;
        let (kv, wal, base_seq) = if config.wal.enabled {
            let kv = MemKv::empty_at(&kv_path);
            let snapshot = load_snapshot(&snapshot_path)?.unwrap_or_else(EngineSnapshot::empty);
            let base_seq = snapshot.base_seq;
            snapshot_next_ordinal = snapshot.next_ordinal;
            catalog.load(snapshot.schema.clone());
            let mut ws = Workspace::new(kv.snapshot(), kv.generation());
            for node in snapshot.nodes {
                ws.upsert_node_raw(&catalog, node)?;
            }
            for edge in snapshot.edges {
                ws.upsert_edge_raw(&catalog, edge)?;
            }
            let batches = ws.batches.len() as u64;
            kv.install(ws.image(), batches);

            let wal = Wal::open(&config.wal_dir(), config.wal.sync)?;
            let entries = Wal::read_all(&config.wal_dir())?;
            let mut replayed = 0usize;
            for (seq, op) in entries {
                if seq <= base_seq || op.is_checkpoint() {
                    continue;
                }
                // Journaled ordinals cover entities later deleted, so the
                // counter never hands an ordinal out twice.
                snapshot_next_ordinal = snapshot_next_ordinal.max(op_max_ordinal(&op) + 1);
                let mut ws = Workspace::new(kv.snapshot(), kv.generation());
                Self::replay_op(&mut ws, &catalog, op)?;
                let batches = ws.batches.len() as u64;
                kv.install(ws.image(), batches);
                replayed += 1;
            }
            if replayed > 0 {
                info!(replayed, base_seq, "replayed write-ahead log");
            }
            (kv, Some(wal), base_seq)
        } else {
            let kv = MemKv::open(Some(&kv_path))?;
            if let Some(bytes) = kv.snapshot().get(keys::META_SCHEMA.as_bytes()) {
                let schema = serde_json::from_slice(bytes)
                    .map_err(|e| NornicError::Corruption(format!("schema meta: {e}")))?;
                catalog.load(schema);
            }
            (kv, None, 0)
        };

        let engine = Engine {
            kv,
            catalog,
            wal,
            fulltext: FulltextIndex::new(),
            fulltext_cfg: config.fulltext.clone(),
            procedures: ProcedureRegistry::builtin(),
            embedder: RwLock::new(None),
            embed_queue: EmbedQueue::new(false),
            next_ordinal: AtomicU64::new(1),
            last_committed_seq: AtomicU64::new(base_seq),
            write_gate: Mutex::new(()),
            snapshot_path,
        };
        engine.rebuild_derived_state()?;
        engine
            .next_ordinal
            .fetch_max(snapshot_next_ordinal, Ordering::SeqCst);
        if let Some(wal) = &engine.wal {
            engine
                .last_committed_seq
                .store(wal.last_seq(), Ordering::SeqCst);
        }

        // Default vector index over anything embedded, queryable by name.
        if engine.catalog.vector_index("embeddings").is_none() {
            engine.catalog.define_vector_index(VectorIndexDef {
                name: "embeddings".into(),
                label: String::new(),
                dimension: config.embedding.dimension,
            });
        }
        Ok(engine)
    }

    /// Builds the embedding stack per configuration, runs the health probe
    /// and publishes (or demotes) the pipeline.
    pub async fn init_embeddings(&self, config: &Config) {
        let timeout = std::time::Duration::from_secs(config.embedding.timeout_secs);
        let base: Arc<dyn Embedder> = match config.embedding.provider {
            EmbeddingProvider::Local => {
                Arc::new(LocalEmbedder::new(config.embedding.dimension))
            }
            EmbeddingProvider::RemoteOpenAi => {
                match RemoteEmbedder::new(
                    RemoteFlavor::OpenAi,
                    &config.embedding.url,
                    &config.embedding.model,
                    config.embedding.dimension,
                    timeout,
                ) {
                    Ok(embedder) => Arc::new(embedder),
                    Err(err) => {
                        error!(%err, "failed to build remote embedder; embeddings disabled");
                        return;
                    }
                }
            }
            EmbeddingProvider::RemoteOllama => {
                match RemoteEmbedder::new(
                    RemoteFlavor::Ollama,
                    &config.embedding.url,
                    &config.embedding.model,
                    config.embedding.dimension,
                    timeout,
                ) {
                    Ok(embedder) => Arc::new(embedder),
                    Err(err) => {
                        error!(%err, "failed to build remote embedder; embeddings disabled");
                        return;
                    }
                }
            }
        };
        let cached = Arc::new(CachedEmbedder::new(base, config.embedding.cache_size));
        match health_probe(cached.as_ref()).await {
            Ok(()) => {
                info!(model = cached.model(), dimension = cached.dimension(), "embedding pipeline ready");
                *self.embedder.write() = Some(cached);
                self.embed_queue.enable();
            }
            Err(err) => {
                warn!(%err, "embedding health probe failed; search degrades to lexical");
                *self.embedder.write() = None;
                self.embed_queue.disable();
            }
        }
    }

    pub fn embedder(&self) -> Option<Arc<CachedEmbedder>> {
        self.embedder.read().clone()
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    pub fn fulltext_config(&self) -> &FulltextConfig {
        &self.fulltext_cfg
    }

    pub fn view(&self) -> GraphView {
        GraphView::new(self.kv.snapshot())
    }

    pub fn begin_workspace(&self) -> Workspace {
        Workspace::new(self.kv.snapshot(), self.kv.generation())
    }

    pub fn last_seq(&self) -> u64 {
        self.last_committed_seq.load(Ordering::SeqCst)
    }

    pub fn bookmark(&self) -> String {
        format!("nornic:seq-{}", self.last_seq())
    }

    pub fn wal_sync(&self) -> Result<()> {
        if let Some(wal) = &self.wal {
            wal.sync()?;
        }
        Ok(())
    }

    // ---- statement execution ----

    pub fn execute_statement(
        &self,
        ws: &mut Workspace,
        text: &str,
        params: BTreeMap<String, PropertyValue>,
    ) -> Result<StatementResult> {
        let statement = cypher::parse(text)?;
        let kind = statement.kind();
        match statement {
            Statement::Query(query) => {
                let mark = ws.mark();
                let stats_before = ws.stats;
                let ctx = ExecContext {
                    catalog: &self.catalog,
                    fulltext: &self.fulltext_cfg,
                    procedures: &self.procedures,
                    params,
                    ordinals: self,
                };
                match execute_query(&query, ws, &ctx) {
                    Ok(outcome) => Ok(StatementResult {
                        outcome,
                        stats: ws.stats.since(&stats_before),
                        kind,
                    }),
                    Err(err) => {
                        ws.revert(mark);
                        if let NornicError::ConstraintViolation {
                            kind: ckind,
                            label,
                            offending_id,
                            ..
                        } = &err
                        {
                            audit::constraint_violation(ckind, label, offending_id.as_deref());
                        }
                        Err(err)
                    }
                }
            }
            Statement::CreateConstraint {
                name,
                if_not_exists,
                def,
            } => {
                let added = self.create_constraint(name, if_not_exists, def)?;
                let mut stats = WriteStats::default();
                if added {
                    stats.constraints_added = 1;
                }
                Ok(StatementResult {
                    outcome: ExecOutcome::default(),
                    stats,
                    kind,
                })
            }
            Statement::DropConstraint { name } => {
                self.drop_constraint(&name)?;
                Ok(StatementResult {
                    outcome: ExecOutcome::default(),
                    stats: WriteStats::default(),
                    kind,
                })
            }
        }
    }

    // ---- commit path ----

    /// Merges a workspace into the live store: sentinel re-validation,
    /// image install (or batch re-apply on a moved base), WAL append,
    /// lexical-index and dictionary updates, embedding enqueue.
    pub fn commit_workspace(&self, ws: Workspace) -> Result<u64> {
        if !ws.has_writes() {
            return Ok(self.last_seq());
        }
        // Writers serialize with in-flight constraint-creation scans first,
        // then with each other. Lock order matches create_constraint.
        let _creation = self.catalog.creation_guard();
        let gate = self.write_gate.lock();

        if self.kv.generation() == ws.base_generation() {
            let batches = ws.batches.len() as u64;
            self.kv.install(ws.image(), batches);
        } else {
            let live = self.kv.snapshot();
            for key in &ws.added_sentinels {
                if live.contains(key) && !ws.base_contains(key) {
                    drop(gate);
                    let printable = String::from_utf8_lossy(key).into_owned();
                    audit::constraint_violation(&printable, "", None);
                    return Err(NornicError::constraint(
                        "UNIQUE",
                        "",
                        &[],
                        None,
                        "a concurrent transaction claimed the same constrained value",
                    ));
                }
            }
            for batch in &ws.batches {
                self.kv.apply(batch);
            }
        }

        // Counter meta rides in its own batch so a WAL-less store restarts
        // with fresh, never-reused ordinals.
        let mut meta = WriteBatch::new();
        meta.put(
            keys::META_NEXT_ORDINAL.as_bytes().to_vec(),
            self.next_ordinal.load(Ordering::SeqCst).to_string().into_bytes(),
        );
        self.kv.apply(&meta);

        let seq = match &self.wal {
            Some(wal) => {
                let seq = wal.append_many(&ws.wal_ops)?;
                self.last_committed_seq.store(seq, Ordering::SeqCst);
                seq
            }
            None => self.last_seq(),
        };

        self.fulltext.apply(&ws.fulltext);
        self.catalog.apply_counts(&ws.label_deltas, &ws.rel_deltas);
        self.embed_queue.push(&ws.embed_ids);
        debug!(
            batches = ws.batches.len(),
            wal_ops = ws.wal_ops.len(),
            seq,
            "workspace committed"
        );
        Ok(seq)
    }

    // ---- constraints ----

    fn constraint_from_def(
        &self,
        name: Option<String>,
        def: &ConstraintDef,
    ) -> Result<Constraint> {
        let kind = match (&def.flavor, def.on_relationship) {
            (ConstraintFlavor::Unique, false) => ConstraintKind::Unique,
            (ConstraintFlavor::Unique, true) => ConstraintKind::RelUnique,
            (ConstraintFlavor::NodeKey, false) => ConstraintKind::NodeKey,
            (ConstraintFlavor::NodeKey, true) => {
                return Err(NornicError::Syntax(
                    "NODE KEY applies to nodes only".into(),
                ))
            }
            (ConstraintFlavor::Exists, false) => ConstraintKind::Exists,
            (ConstraintFlavor::Exists, true) => ConstraintKind::RelExists,
            (ConstraintFlavor::PropType(_), false) => ConstraintKind::PropType,
            (ConstraintFlavor::PropType(_), true) => {
                return Err(NornicError::Syntax(
                    "property type constraints apply to nodes only".into(),
                ))
            }
        };
        let value_kind = match &def.flavor {
            ConstraintFlavor::PropType(vk) => Some(*vk),
            _ => None,
        };
        schema::validate_name(&def.label, "label")?;
        let name = name.unwrap_or_else(|| {
            format!(
                "{}_{}_{}",
                def.label.to_lowercase(),
                def.properties.join("_"),
                match kind {
                    ConstraintKind::Unique | ConstraintKind::RelUnique => "unique",
                    ConstraintKind::NodeKey => "key",
                    ConstraintKind::Exists | ConstraintKind::RelExists => "exists",
                    ConstraintKind::PropType => "type",
                }
            )
        });
        Ok(Constraint {
            name,
            kind,
            label: def.label.clone(),
            properties: def.properties.clone(),
            value_kind,
        })
    }

    /// Creates a constraint: scans existing data on a read snapshot under
    /// the creation lock, rejecting on the first violation, then installs
    /// sentinels for existing rows and persists the schema.
    pub fn create_constraint(
        &self,
        name: Option<String>,
        if_not_exists: bool,
        def: ConstraintDef,
    ) -> Result<bool> {
        let constraint = self.constraint_from_def(name, &def)?;
        let _creation = self.catalog.creation_guard();
        if self.catalog.has_constraint(&constraint.name) {
            if if_not_exists {
                return Ok(false);
            }
            return Err(NornicError::InvalidRequest(format!(
                "constraint {} already exists",
                constraint.name
            )));
        }

        // Full scan of the affected label against the new predicate.
        let view = self.view();
        let mut ws = self.begin_workspace();
        let single = [constraint.clone()];
        if constraint.kind.is_relationship() {
            let (mut cursor, mut done) = (None, false);
            while !done {
                let (edges, next) = view.all_edges(cursor.as_deref(), 1024)?;
                done = next.is_none();
                cursor = next;
                for edge in edges {
                    if edge.edge_type.to_lowercase() != constraint.label_lc() {
                        continue;
                    }
                    let sentinels = schema::edge_sentinels(&single, &edge)?;
                    let change = schema::diff_sentinels(
                        &[],
                        &sentinels,
                        &edge.id,
                        (constraint.kind.name(), &constraint.label),
                        |key| {
                            ws.get_raw(key)
                                .map(|v| String::from_utf8_lossy(v).into_owned())
                        },
                    )?;
                    let mut batch = WriteBatch::new();
                    for (key, owner) in &change.add {
                        batch.put(key.clone(), owner.clone().into_bytes());
                    }
                    ws.apply_batch(batch);
                }
            }
        } else {
            for id in view.node_ids_by_label(&constraint.label) {
                let Some(node) = view.try_get_node(&id)? else {
                    continue;
                };
                let sentinels = schema::node_sentinels(&single, &node)?;
                let change = schema::diff_sentinels(
                    &[],
                    &sentinels,
                    &node.id,
                    (constraint.kind.name(), &constraint.label),
                    |key| {
                        ws.get_raw(key)
                            .map(|v| String::from_utf8_lossy(v).into_owned())
                    },
                )?;
                let mut batch = WriteBatch::new();
                for (key, owner) in &change.add {
                    batch.put(key.clone(), owner.clone().into_bytes());
                }
                ws.apply_batch(batch);
            }
        }

        {
            let _gate = self.write_gate.lock();
            for batch in &ws.batches {
                self.kv.apply(batch);
            }
            self.catalog.add_constraint(constraint.clone())?;
            self.persist_schema()?;
        }
        info!(name = %constraint.name, kind = constraint.kind.name(), "constraint created");
        Ok(true)
    }

    pub fn drop_constraint(&self, name: &str) -> Result<()> {
        let _creation = self.catalog.creation_guard();
        let constraint = self.catalog.drop_constraint(name)?;
        // Sweep the constraint's sentinel namespace.
        let prefix = format!("{}{}/", keys::SENTINEL_PREFIX, constraint.sentinel_name());
        let snap = self.kv.snapshot();
        let mut batch = WriteBatch::new();
        snap.scan_while(prefix.as_bytes(), |key, _| {
            batch.delete(key.to_vec());
            true
        });
        let _gate = self.write_gate.lock();
        self.kv.apply(&batch);
        self.persist_schema()?;
        info!(name, "constraint dropped");
        Ok(())
    }

    /// Writes the schema catalog into the KV meta key and, with the WAL
    /// enabled, checkpoints so schema changes are durable immediately.
    fn persist_schema(&self) -> Result<()> {
        let schema = self.catalog.snapshot();
        let bytes = serde_json::to_vec(&schema)
            .map_err(|e| NornicError::Serialization(e.to_string()))?;
        let mut batch = WriteBatch::new();
        batch.put(keys::META_SCHEMA.as_bytes().to_vec(), bytes);
        self.kv.apply(&batch);
        if self.wal.is_some() {
            self.write_checkpoint()?;
        } else {
            self.kv.flush()?;
        }
        Ok(())
    }

    // ---- checkpoint / recovery ----

    /// Serializes current state to the snapshot file and truncates the WAL.
    /// Callers must not hold the write gate.
    pub fn checkpoint(&self) -> Result<CheckpointInfo> {
        let _gate = self.write_gate.lock();
        self.write_checkpoint_locked()
    }

    fn write_checkpoint(&self) -> Result<()> {
        self.write_checkpoint_locked().map(|_| ())
    }

    fn write_checkpoint_locked(&self) -> Result<CheckpointInfo> {
        let view = self.view();
        let (nodes, _) = view.all_nodes(None, usize::MAX)?;
        let (edges, _) = view.all_edges(None, usize::MAX)?;
        let base_seq = self.last_seq();
        let snapshot = EngineSnapshot {
            base_seq,
            next_ordinal: self.next_ordinal.load(Ordering::SeqCst),
            schema: self.catalog.snapshot(),
            nodes,
            edges,
        };
        let info = CheckpointInfo {
            base_seq,
            nodes: snapshot.nodes.len(),
            edges: snapshot.edges.len(),
        };
        write_snapshot(&self.snapshot_path, &snapshot)?;
        if let Some(wal) = &self.wal {
            wal.reset_to_checkpoint(base_seq)?;
        }
        self.kv.flush()?;
        Ok(info)
    }

    fn replay_op(ws: &mut Workspace, catalog: &SchemaCatalog, op: WalOp) -> Result<()> {
        match op {
            WalOp::CreateNode(node) | WalOp::UpdateNode(node) => {
                ws.upsert_node_raw(catalog, node)?;
            }
            // Incident edges were journaled as their own delete entries, so
            // replay always detaches.
            WalOp::DeleteNode { id, .. } => ws.remove_node_raw(catalog, &id, true),
            WalOp::CreateEdge(edge) | WalOp::UpdateEdge(edge) => {
                ws.upsert_edge_raw(catalog, edge)?;
            }
            WalOp::DeleteEdge { id } => ws.remove_edge_raw(catalog, &id),
            WalOp::BulkNodes(nodes) => {
                for node in nodes {
                    ws.upsert_node_raw(catalog, node)?;
                }
            }
            WalOp::BulkEdges(edges) => {
                for edge in edges {
                    ws.upsert_edge_raw(catalog, edge)?;
                }
            }
            WalOp::Checkpoint { .. } => {}
        }
        Ok(())
    }

    /// Recomputes everything derivable from the store: ordinal counter,
    /// dictionary cardinalities, and the lexical index.
    fn rebuild_derived_state(&self) -> Result<()> {
        let view = self.view();
        let mut max_ordinal = 0u64;
        let mut labels: BTreeMap<String, DictEntry> = BTreeMap::new();
        let mut rels: BTreeMap<String, DictEntry> = BTreeMap::new();
        self.fulltext.clear();

        let (mut cursor, mut done) = (None::<String>, false);
        while !done {
            let (nodes, next) = view.all_nodes(cursor.as_deref(), 1024)?;
            done = next.is_none();
            cursor = next;
            for node in nodes {
                max_ordinal = max_ordinal.max(node.ordinal);
                for label in &node.labels {
                    let entry = labels
                        .entry(label.to_lowercase())
                        .or_insert_with(|| DictEntry {
                            display: label.clone(),
                            count: 0,
                        });
                    entry.count += 1;
                }
                if self
                    .fulltext_cfg
                    .covers_label(&node.labels.iter().map(|l| l.to_lowercase()).collect::<Vec<_>>())
                {
                    if let Some(text) = extract_text(&node.properties, &self.fulltext_cfg.properties)
                    {
                        self.fulltext.index_document(&node.id, &text);
                    }
                }
            }
        }
        let (mut cursor, mut done) = (None::<String>, false);
        while !done {
            let (edges, next) = view.all_edges(cursor.as_deref(), 1024)?;
            done = next.is_none();
            cursor = next;
            for edge in edges {
                max_ordinal = max_ordinal.max(edge.ordinal);
                let entry = rels
                    .entry(edge.edge_type.to_lowercase())
                    .or_insert_with(|| DictEntry {
                        display: edge.edge_type.clone(),
                        count: 0,
                    });
                entry.count += 1;
            }
        }
        self.catalog.replace_counts(labels, rels);

        // The persisted counter may be ahead of the surviving entities;
        // never hand out an ordinal twice.
        let persisted = view
            .kv()
            .get(keys::META_NEXT_ORDINAL.as_bytes())
            .and_then(|v| String::from_utf8_lossy(v).parse::<u64>().ok())
            .unwrap_or(1);
        self.next_ordinal
            .store(persisted.max(max_ordinal + 1), Ordering::SeqCst);
        Ok(())
    }

    // ---- search ----

    /// Hybrid retrieval. Degrades to lexical-only when the vector side is
    /// disabled or unavailable; the flag in the result says which happened.
    pub async fn search(
        &self,
        query: &str,
        labels: &[String],
        limit: usize,
    ) -> Result<(Vec<(SearchHit, Node)>, bool)> {
        let view = self.view();
        let pool = limit.saturating_mul(SEARCH_POOL_FACTOR).max(50);
        let mut lexical = self.fulltext.search(query, pool);
        if !labels.is_empty() {
            lexical = self.filter_by_labels(&view, lexical, labels)?;
        }

        let mut vector_unavailable = true;
        let mut hits = match self.embedder() {
            Some(embedder) => match embedder.embed(query).await {
                Ok(query_vector) => {
                    vector_unavailable = false;
                    let candidates = self.embedded_candidates(&view, labels, query_vector.len())?;
                    let ranked = vector::top_n(
                        &query_vector,
                        candidates.iter().map(|(id, v)| (id.as_str(), v.as_slice())),
                        pool,
                    );
                    hybrid::fuse(&lexical, &ranked, limit)
                }
                Err(err) => {
                    warn!(%err, "query embedding failed; lexical-only results");
                    hybrid::lexical_only(&lexical, limit)
                }
            },
            None => hybrid::lexical_only(&lexical, limit),
        };
        hits.truncate(limit);

        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            if let Some(node) = view.try_get_node(&hit.id)? {
                out.push((hit, node));
            }
        }
        Ok((out, vector_unavailable))
    }

    /// Vector-only neighbors of a stored node, source excluded, pre-filtered
    /// by the source's label set.
    pub fn similar(&self, node_id: &str, limit: usize) -> Result<Vec<(Node, f32)>> {
        let view = self.view();
        let source = view.get_node(node_id)?;
        let embedding = source.embedding.as_ref().ok_or_else(|| {
            NornicError::InvalidRequest(format!("node {node_id} has no embedding yet"))
        })?;
        let candidates =
            self.embedded_candidates(&view, &source.labels, embedding.vector.len())?;
        let ranked = vector::top_n(
            &embedding.vector,
            candidates
                .iter()
                .filter(|(id, _)| id.as_str() != node_id)
                .map(|(id, v)| (id.as_str(), v.as_slice())),
            limit,
        );
        let mut out = Vec::with_capacity(ranked.len());
        for (id, score) in ranked {
            if let Some(node) = view.try_get_node(&id)? {
                out.push((node, score));
            }
        }
        Ok(out)
    }

    fn filter_by_labels(
        &self,
        view: &GraphView,
        ranked: Vec<(String, f32)>,
        labels: &[String],
    ) -> Result<Vec<(String, f32)>> {
        let wanted: Vec<String> = labels.iter().map(|l| l.to_lowercase()).collect();
        let mut out = Vec::with_capacity(ranked.len());
        for (id, score) in ranked {
            if let Some(node) = view.try_get_node(&id)? {
                let node_labels: Vec<String> =
                    node.labels.iter().map(|l| l.to_lowercase()).collect();
                if wanted.iter().any(|w| node_labels.contains(w)) {
                    out.push((id, score));
                }
            }
        }
        Ok(out)
    }

    fn embedded_candidates(
        &self,
        view: &GraphView,
        labels: &[String],
        dimension: usize,
    ) -> Result<Vec<(String, Vec<f32>)>> {
        let wanted: Vec<String> = labels.iter().map(|l| l.to_lowercase()).collect();
        let mut out = Vec::new();
        let (mut cursor, mut done) = (None::<String>, false);
        while !done {
            let (nodes, next) = view.all_nodes(cursor.as_deref(), 1024)?;
            done = next.is_none();
            cursor = next;
            for node in nodes {
                let Some(embedding) = &node.embedding else {
                    continue;
                };
                if embedding.vector.len() != dimension {
                    continue;
                }
                if !wanted.is_empty() {
                    let node_labels: Vec<String> =
                        node.labels.iter().map(|l| l.to_lowercase()).collect();
                    if !wanted.iter().any(|w| node_labels.contains(w)) {
                        continue;
                    }
                }
                out.push((node.id.clone(), embedding.vector.clone()));
            }
        }
        Ok(out)
    }

    /// Drops the lexical index and re-indexes every covered node.
    pub fn rebuild_fulltext(&self) -> Result<usize> {
        self.fulltext.clear();
        let view = self.view();
        let mut indexed = 0usize;
        let (mut cursor, mut done) = (None::<String>, false);
        while !done {
            let (nodes, next) = view.all_nodes(cursor.as_deref(), 1024)?;
            done = next.is_none();
            cursor = next;
            for node in nodes {
                let labels_lc: Vec<String> =
                    node.labels.iter().map(|l| l.to_lowercase()).collect();
                if !self.fulltext_cfg.covers_label(&labels_lc) {
                    continue;
                }
                if let Some(text) = extract_text(&node.properties, &self.fulltext_cfg.properties) {
                    self.fulltext.index_document(&node.id, &text);
                    indexed += 1;
                }
            }
        }
        Ok(indexed)
    }

    // ---- embedding worker ----

    /// Clears every stored embedding, journaled as bulk updates. Returns the
    /// number of nodes touched.
    pub fn clear_embeddings(&self) -> Result<usize> {
        let mut ws = self.begin_workspace();
        let ids: Vec<String> = {
            let view = ws.view();
            let (nodes, _) = view.all_nodes(None, usize::MAX)?;
            nodes
                .into_iter()
                .filter(|n| n.embedding.is_some())
                .map(|n| n.id)
                .collect()
        };
        let mut cleared = Vec::with_capacity(ids.len());
        for id in &ids {
            cleared.push(ws.set_node_embedding(id, None)?);
        }
        if !cleared.is_empty() {
            ws.wal_ops.push(WalOp::BulkNodes(cleared));
            self.commit_workspace(ws)?;
        }
        Ok(ids.len())
    }

    /// Wakes the worker; with `regenerate`, clears all embeddings first and
    /// enqueues everything with indexable text.
    pub fn trigger_embedding(&self, regenerate: bool) -> Result<EmbedStats> {
        if !self.embed_queue.is_enabled() {
            if regenerate {
                return Err(NornicError::Unavailable(
                    "embedding pipeline is disabled".into(),
                ));
            }
            return Ok(self.embed_queue.stats());
        }
        if regenerate {
            self.clear_embeddings()?;
        }
        let view = self.view();
        let mut pending = Vec::new();
        let (mut cursor, mut done) = (None::<String>, false);
        while !done {
            let (nodes, next) = view.all_nodes(cursor.as_deref(), 1024)?;
            done = next.is_none();
            cursor = next;
            for node in nodes {
                if node.embedding.is_some() {
                    continue;
                }
                let labels_lc: Vec<String> =
                    node.labels.iter().map(|l| l.to_lowercase()).collect();
                if !self.fulltext_cfg.covers_label(&labels_lc) {
                    continue;
                }
                if extract_text(&node.properties, &self.fulltext_cfg.properties).is_some() {
                    pending.push(node.id);
                }
            }
        }
        self.embed_queue.push(&pending);
        self.embed_queue.wake();
        Ok(self.embed_queue.stats())
    }

    /// The single background worker: drains batches, embeds, writes back.
    /// Runs until the shutdown signal flips.
    pub async fn run_embed_worker(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.embed_queue.notified() => {}
                _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
            }
            loop {
                let batch = self.embed_queue.pull_batch(EMBED_BATCH);
                if batch.is_empty() {
                    break;
                }
                self.embed_queue.mark_processing(true);
                self.process_embed_batch(&batch).await;
            }
            self.embed_queue.mark_processing(false);
        }
        // Drain what is left before stopping.
        loop {
            let batch = self.embed_queue.pull_batch(EMBED_BATCH);
            if batch.is_empty() {
                break;
            }
            self.process_embed_batch(&batch).await;
        }
        info!("embedding worker stopped");
    }

    async fn process_embed_batch(&self, batch: &[String]) {
        let Some(embedder) = self.embedder() else {
            return;
        };
        let model = embedder.model().to_string();
        let dimension = embedder.dimension();
        let view = self.view();
        let mut computed: Vec<(String, Vec<f32>)> = Vec::new();
        let mut failed = 0u64;
        let mut skipped = 0u64;
        for id in batch {
            let node = match view.try_get_node(id) {
                Ok(Some(node)) => node,
                _ => {
                    skipped += 1;
                    continue;
                }
            };
            let current = node
                .embedding
                .as_ref()
                .map(|e| e.model == model && e.dimension == dimension)
                .unwrap_or(false);
            if current {
                skipped += 1;
                continue;
            }
            let Some(text) = extract_text(&node.properties, &self.fulltext_cfg.properties)
            else {
                skipped += 1;
                continue;
            };
            match embedder.embed(&text).await {
                Ok(vector) => computed.push((id.clone(), vector)),
                Err(EmbedError::BadInput(reason)) => {
                    debug!(node = %id, reason, "skipping unembeddable node");
                    skipped += 1;
                }
                Err(err) => {
                    warn!(node = %id, %err, "embedding failed");
                    failed += 1;
                }
            }
        }

        if !computed.is_empty() {
            let mut ws = self.begin_workspace();
            let mut updated = Vec::with_capacity(computed.len());
            let mut write_errors = 0u64;
            for (id, vector) in computed {
                let embedding = Embedding {
                    dimension: vector.len(),
                    vector,
                    model: model.clone(),
                };
                match ws.set_node_embedding(&id, Some(embedding)) {
                    Ok(node) => updated.push(node),
                    Err(err) => {
                        warn!(node = %id, %err, "embedding write-back failed");
                        write_errors += 1;
                    }
                }
            }
            let written = updated.len() as u64;
            ws.wal_ops.push(WalOp::BulkNodes(updated));
            match self.commit_workspace(ws) {
                Ok(_) => self.embed_queue.record_processed(written),
                Err(err) => {
                    error!(%err, "embedding batch commit failed");
                    failed += written;
                }
            }
            failed += write_errors;
        }
        if failed > 0 {
            self.embed_queue.record_failed(failed);
        }
        debug!(
            batch = batch.len(),
            failed,
            skipped,
            "embedding batch processed"
        );
    }

    // ---- info ----

    pub fn counts(&self) -> (usize, usize) {
        let view = self.view();
        (view.count_nodes(), view.count_edges())
    }

    /// Flush-on-shutdown: drain the WAL and write the KV image.
    pub fn shutdown_flush(&self) -> Result<()> {
        if let Some(wal) = &self.wal {
            wal.sync()?;
        }
        self.kv.flush()?;
        Ok(())
    }
}
