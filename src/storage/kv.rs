//! Ordered key/value substrate.
//!
//! The store is a copy-on-write `BTreeMap` behind an `Arc`: a read snapshot
//! is an `Arc` clone and observes a consistent point in time for its whole
//! lifetime; a write batch produces a new map image and swaps it in. Batch
//! serialization is the caller's job (the engine holds a single write gate),
//! which keeps this layer free of its own locking protocol beyond the swap.
//!
//! The map image persists to a single `store.kv` file of length-prefixed
//! records with a trailing CRC, written through a temp file and an atomic
//! rename. With the WAL enabled the file is a warm-start accelerator; with
//! the WAL disabled it is the only durable image and is rewritten on flush.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{NornicError, Result};

const KV_MAGIC: [u8; 4] = *b"NKV1";

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// A single put or delete inside an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Atomic group of writes.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put(key, value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete(key));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Point-in-time read view. Cheap to clone; never observes later writes.
#[derive(Clone)]
pub struct KvSnapshot {
    map: Arc<Map>,
}

impl KvSnapshot {
    pub(crate) fn new(map: Arc<Map>) -> Self {
        Self { map }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.map.get(key)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.map.contains_key(key)
    }

    /// Forward scan of all keys starting with `prefix`, bounded by `limit`
    /// (`usize::MAX` for unbounded).
    pub fn prefix_scan(&self, prefix: &[u8], limit: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        for (k, v) in self.map.range(prefix.to_vec()..) {
            if !k.starts_with(prefix) || out.len() >= limit {
                break;
            }
            out.push((k.clone(), v.clone()));
        }
        out
    }

    /// Forward scan under `prefix` starting strictly after `after` (for
    /// cursor pagination).
    pub fn scan_after(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        use std::ops::Bound;
        let lower = match after {
            Some(key) => Bound::Excluded(key.to_vec()),
            None => Bound::Included(prefix.to_vec()),
        };
        let mut out = Vec::new();
        for (k, v) in self.map.range((lower, Bound::Unbounded)) {
            if !k.starts_with(prefix) || out.len() >= limit {
                break;
            }
            out.push((k.clone(), v.clone()));
        }
        out
    }

    /// Iterates keys under `prefix` until `visit` returns `false`.
    pub fn scan_while<F>(&self, prefix: &[u8], mut visit: F)
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        for (k, v) in self.map.range(prefix.to_vec()..) {
            if !k.starts_with(prefix) || !visit(k, v) {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn arc(&self) -> Arc<Map> {
        Arc::clone(&self.map)
    }
}

/// The in-memory ordered store with its on-disk image.
pub struct MemKv {
    current: RwLock<Arc<Map>>,
    /// Bumped on every applied batch; lets a forked writer detect whether the
    /// base it forked from is still the live image.
    generation: RwLock<u64>,
    path: Option<PathBuf>,
}

impl MemKv {
    /// Opens a store, loading `store.kv` from `path` when present.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let map = match path {
            Some(p) if p.exists() => {
                let map = load_image(p)?;
                debug!(keys = map.len(), path = %p.display(), "loaded kv image");
                map
            }
            _ => Map::new(),
        };
        Ok(Self {
            current: RwLock::new(Arc::new(map)),
            generation: RwLock::new(0),
            path: path.map(|p| p.to_path_buf()),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            current: RwLock::new(Arc::new(Map::new())),
            generation: RwLock::new(0),
            path: None,
        }
    }

    /// An empty store that flushes to `path`. Used when recovery comes from
    /// the WAL instead of the on-disk image.
    pub fn empty_at(path: &Path) -> Self {
        Self {
            current: RwLock::new(Arc::new(Map::new())),
            generation: RwLock::new(0),
            path: Some(path.to_path_buf()),
        }
    }

    pub fn snapshot(&self) -> KvSnapshot {
        KvSnapshot::new(Arc::clone(&self.current.read()))
    }

    pub fn generation(&self) -> u64 {
        *self.generation.read()
    }

    /// Applies one batch atomically. Readers holding snapshots keep their
    /// old image; new snapshots observe the batch in full.
    pub fn apply(&self, batch: &WriteBatch) {
        if batch.is_empty() {
            return;
        }
        let mut current = self.current.write();
        let mut map = Arc::try_unwrap(std::mem::take(&mut *current))
            .unwrap_or_else(|shared| (*shared).clone());
        apply_to_map(&mut map, batch);
        *current = Arc::new(map);
        *self.generation.write() += 1;
    }

    /// Replaces the live image wholesale. Used when a forked writer has
    /// already produced the post-batch image and the base generation is
    /// unchanged.
    pub fn install(&self, image: Arc<Map>, batches_applied: u64) {
        let mut current = self.current.write();
        *current = image;
        *self.generation.write() += batches_applied;
    }

    /// Writes the current image to `store.kv` (temp file + atomic rename).
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = self.snapshot();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        write_image(tmp.as_file_mut(), &snapshot)?;
        tmp.as_file_mut().sync_all()?;
        tmp.persist(path)
            .map_err(|e| NornicError::Io(e.error))?;
        debug!(keys = snapshot.len(), path = %path.display(), "flushed kv image");
        Ok(())
    }
}

pub(crate) fn apply_to_map(map: &mut Map, batch: &WriteBatch) {
    for op in &batch.ops {
        match op {
            BatchOp::Put(k, v) => {
                map.insert(k.clone(), v.clone());
            }
            BatchOp::Delete(k) => {
                map.remove(k);
            }
        }
    }
}

fn write_image(file: &mut fs::File, snapshot: &KvSnapshot) -> Result<()> {
    let mut body = Vec::new();
    snapshot.scan_while(b"", |k, v| {
        body.extend_from_slice(&(k.len() as u32).to_be_bytes());
        body.extend_from_slice(k);
        body.extend_from_slice(&(v.len() as u32).to_be_bytes());
        body.extend_from_slice(v);
        true
    });
    file.write_all(&KV_MAGIC)?;
    file.write_all(&(snapshot.len() as u64).to_be_bytes())?;
    file.write_all(&body)?;
    file.write_all(&crc32fast::hash(&body).to_be_bytes())?;
    Ok(())
}

fn load_image(path: &Path) -> Result<Map> {
    let bytes = fs::read(path)?;
    if bytes.len() < 16 || bytes[0..4] != KV_MAGIC {
        return Err(NornicError::Corruption("kv image header".into()));
    }
    let count = u64::from_be_bytes(
        bytes[4..12]
            .try_into()
            .map_err(|_| NornicError::Corruption("kv image header".into()))?,
    );
    let body = &bytes[12..bytes.len() - 4];
    let stored_crc = u32::from_be_bytes(
        bytes[bytes.len() - 4..]
            .try_into()
            .map_err(|_| NornicError::Corruption("kv image trailer".into()))?,
    );
    if crc32fast::hash(body) != stored_crc {
        return Err(NornicError::Corruption("kv image crc mismatch".into()));
    }
    let mut map = Map::new();
    let mut pos = 0usize;
    let take = |pos: &mut usize, n: usize| -> Result<&[u8]> {
        let slice = body
            .get(*pos..*pos + n)
            .ok_or_else(|| NornicError::Corruption("kv image truncated".into()))?;
        *pos += n;
        Ok(slice)
    };
    for _ in 0..count {
        let klen = u32::from_be_bytes(take(&mut pos, 4)?.try_into().unwrap_or_default()) as usize;
        let key = take(&mut pos, klen)?.to_vec();
        let vlen = u32::from_be_bytes(take(&mut pos, 4)?.try_into().unwrap_or_default()) as usize;
        let value = take(&mut pos, vlen)?.to_vec();
        map.insert(key, value);
    }
    if pos != body.len() {
        warn!(trailing = body.len() - pos, "kv image has trailing bytes");
    }
    Ok(map)
}
