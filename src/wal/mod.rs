//! Write-ahead log: a durable, append-only journal of mutations.
//!
//! Frame layout, all integers big-endian:
//!
//! ```text
//! seq: u64 | op: u8 | len: u32 | payload (len bytes) | crc32(payload): u32
//! ```
//!
//! Sequence numbers are assigned under the single producer lock, so the
//! persisted order is the applied order. Reopening scans the tail; a final
//! frame with a bad checksum or a truncated body is discarded and the file
//! is cut back to the last valid frame.
//!
//! Checkpointing serializes engine state into `snapshot.json` (temp file +
//! atomic rename), truncates the journal and leaves a checkpoint sentinel
//! carrying the snapshot's base sequence. Sentinels do not consume a
//! sequence number; replay skips them.

pub mod snapshot;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{NornicError, Result};
use crate::model::{Edge, Node};

pub const WAL_FILE: &str = "wal.log";
pub const SNAPSHOT_FILE: &str = "snapshot.json";

const FRAME_HEADER_LEN: usize = 8 + 1 + 4;
const FRAME_TRAILER_LEN: usize = 4;
const MAX_PAYLOAD_LEN: u32 = 256 * 1024 * 1024;

/// Journaled operation. Payloads are self-describing so replay needs no
/// side tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalOp {
    CreateNode(Node),
    UpdateNode(Node),
    DeleteNode { id: String, detach: bool },
    CreateEdge(Edge),
    UpdateEdge(Edge),
    DeleteEdge { id: String },
    BulkNodes(Vec<Node>),
    BulkEdges(Vec<Edge>),
    Checkpoint { base_seq: u64 },
}

impl WalOp {
    pub fn tag(&self) -> u8 {
        match self {
            WalOp::CreateNode(_) => 1,
            WalOp::UpdateNode(_) => 2,
            WalOp::DeleteNode { .. } => 3,
            WalOp::CreateEdge(_) => 4,
            WalOp::UpdateEdge(_) => 5,
            WalOp::DeleteEdge { .. } => 6,
            WalOp::BulkNodes(_) => 7,
            WalOp::BulkEdges(_) => 8,
            WalOp::Checkpoint { .. } => 9,
        }
    }

    pub fn is_checkpoint(&self) -> bool {
        matches!(self, WalOp::Checkpoint { .. })
    }
}

/// When appended frames reach durable media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// Flush after every append.
    Immediate,
    /// Flush on the background ticker interval.
    Batch,
    /// Rely on the OS alone.
    None,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Immediate
    }
}

struct WalInner {
    file: File,
    next_seq: u64,
    dirty: bool,
}

/// The journal. All appends go through the producer lock.
pub struct Wal {
    inner: Mutex<WalInner>,
    policy: SyncPolicy,
    path: PathBuf,
}

impl Wal {
    /// Opens (or creates) the journal in `dir`, restoring the next sequence
    /// number from the tail.
    pub fn open(dir: &Path, policy: SyncPolicy) -> Result<Wal> {
        fs::create_dir_all(dir)?;
        let path = dir.join(WAL_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;
        let (entries, valid_len) = scan_file(&mut file)?;
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            warn!(
                discarded = file_len - valid_len,
                "discarding torn tail of write-ahead log"
            );
            file.set_len(valid_len)?;
        }
        let next_seq = entries
            .iter()
            .map(|(seq, _)| *seq)
            .max()
            .map(|s| s + 1)
            .unwrap_or(1);
        debug!(next_seq, frames = entries.len(), path = %path.display(), "opened wal");
        Ok(Wal {
            inner: Mutex::new(WalInner {
                file,
                next_seq,
                dirty: false,
            }),
            policy,
            path,
        })
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    /// Appends one mutation, returning its sequence number.
    pub fn append(&self, op: &WalOp) -> Result<u64> {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        write_frame(&mut inner.file, seq, op)?;
        self.after_write(&mut inner)?;
        Ok(seq)
    }

    /// Appends a group of mutations under one lock acquisition, returning
    /// the last assigned sequence number.
    pub fn append_many(&self, ops: &[WalOp]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut last = inner.next_seq.saturating_sub(1);
        for op in ops {
            let seq = inner.next_seq;
            inner.next_seq += 1;
            write_frame(&mut inner.file, seq, op)?;
            last = seq;
        }
        self.after_write(&mut inner)?;
        Ok(last)
    }

    fn after_write(&self, inner: &mut WalInner) -> Result<()> {
        match self.policy {
            SyncPolicy::Immediate => {
                inner.file.sync_data()?;
                inner.dirty = false;
            }
            SyncPolicy::Batch => inner.dirty = true,
            SyncPolicy::None => {}
        }
        Ok(())
    }

    /// Flushes pending frames; the batch ticker calls this on its interval.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.dirty {
            inner.file.sync_data()?;
            inner.dirty = false;
        }
        Ok(())
    }

    /// Last assigned sequence number (0 before the first append).
    pub fn last_seq(&self) -> u64 {
        self.inner.lock().next_seq - 1
    }

    /// Truncates the journal after a checkpoint and plants the sentinel.
    /// The sentinel reuses `base_seq`; mutation sequences stay strictly
    /// monotonic across the truncation.
    pub fn reset_to_checkpoint(&self, base_seq: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.set_len(0)?;
        inner.file.seek(SeekFrom::End(0))?;
        write_frame(&mut inner.file, base_seq, &WalOp::Checkpoint { base_seq })?;
        inner.file.sync_data()?;
        inner.dirty = false;
        inner.next_seq = base_seq + 1;
        info!(base_seq, "wal reset to checkpoint");
        Ok(())
    }

    /// Reads every decodable frame from a journal directory.
    pub fn read_all(dir: &Path) -> Result<Vec<(u64, WalOp)>> {
        let path = dir.join(WAL_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut file = File::open(&path)?;
        let (entries, _) = scan_file(&mut file)?;
        Ok(entries)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_frame(file: &mut File, seq: u64, op: &WalOp) -> Result<()> {
    let payload =
        serde_json::to_vec(op).map_err(|e| NornicError::Serialization(e.to_string()))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len() + FRAME_TRAILER_LEN);
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.push(op.tag());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    frame.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    file.write_all(&frame)?;
    Ok(())
}

/// Scans frames from the start, returning the decoded entries and the byte
/// length of the valid prefix.
fn scan_file(file: &mut File) -> Result<(Vec<(u64, WalOp)>, u64)> {
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let mut entries = Vec::new();
    let mut pos = 0usize;
    let mut valid_len = 0u64;
    while pos + FRAME_HEADER_LEN + FRAME_TRAILER_LEN <= bytes.len() {
        let seq = u64::from_be_bytes(bytes[pos..pos + 8].try_into().unwrap_or_default());
        let len =
            u32::from_be_bytes(bytes[pos + 9..pos + 13].try_into().unwrap_or_default());
        if len > MAX_PAYLOAD_LEN {
            warn!(seq, len, "wal frame length implausible; discarding tail");
            break;
        }
        let body_start = pos + FRAME_HEADER_LEN;
        let body_end = body_start + len as usize;
        let frame_end = body_end + FRAME_TRAILER_LEN;
        if frame_end > bytes.len() {
            break;
        }
        let payload = &bytes[body_start..body_end];
        let stored_crc =
            u32::from_be_bytes(bytes[body_end..frame_end].try_into().unwrap_or_default());
        if crc32fast::hash(payload) != stored_crc {
            warn!(seq, "wal frame checksum mismatch; discarding tail");
            break;
        }
        match serde_json::from_slice::<WalOp>(payload) {
            Ok(op) => entries.push((seq, op)),
            Err(err) => {
                warn!(seq, %err, "undecodable wal payload; discarding tail");
                break;
            }
        }
        pos = frame_end;
        valid_len = frame_end as u64;
    }
    Ok((entries, valid_len))
}
