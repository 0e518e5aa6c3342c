//! Point-in-time engine snapshots bounding WAL replay.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{NornicError, Result};
use crate::model::{Edge, Node};
use crate::schema::SchemaSnapshot;

/// Serialized engine state. `base_seq` bounds replay: entries with a
/// sequence at or below it are already reflected here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub base_seq: u64,
    pub next_ordinal: u64,
    pub schema: SchemaSnapshot,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl EngineSnapshot {
    pub fn empty() -> Self {
        Self {
            base_seq: 0,
            next_ordinal: 1,
            schema: SchemaSnapshot::default(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }
}

/// Writes the snapshot through a temp file and an atomic rename, so a crash
/// mid-write leaves either the old file or a complete new one.
pub fn write_snapshot(path: &Path, snapshot: &EngineSnapshot) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| NornicError::Internal("snapshot path has no parent".into()))?;
    std::fs::create_dir_all(dir)?;
    let json = serde_json::to_vec_pretty(snapshot)
        .map_err(|e| NornicError::Serialization(e.to_string()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    use std::io::Write;
    tmp.as_file_mut().write_all(&json)?;
    tmp.as_file_mut().sync_all()?;
    tmp.persist(path).map_err(|e| NornicError::Io(e.error))?;
    info!(
        base_seq = snapshot.base_seq,
        nodes = snapshot.nodes.len(),
        edges = snapshot.edges.len(),
        path = %path.display(),
        "snapshot written"
    );
    Ok(())
}

/// Loads the snapshot if present.
pub fn load_snapshot(path: &Path) -> Result<Option<EngineSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;
    let snapshot = serde_json::from_slice(&bytes)
        .map_err(|e| NornicError::Corruption(format!("snapshot: {e}")))?;
    Ok(Some(snapshot))
}
