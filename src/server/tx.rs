//! Explicit-transaction registry.
//!
//! Each open transaction owns a workspace held across HTTP requests. The
//! expiry timestamp refreshes on every use; the maintenance sweeper (shared
//! with the rate-limiter GC) expires idle entries, which is equivalent to a
//! rollback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{NornicError, Result};
use crate::model::millis_to_rfc3339;
use crate::model::now_millis;
use crate::storage::graph::Workspace;

struct TxEntry {
    workspace: Workspace,
    expires_at: Instant,
}

pub struct TxRegistry {
    inner: Mutex<HashMap<u64, TxEntry>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl TxRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    /// Registers a workspace, returning the transaction id and its expiry
    /// rendered for the wire.
    pub fn open(&self, workspace: Workspace) -> (u64, String) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let expires_at = Instant::now() + self.timeout;
        self.inner.lock().insert(
            id,
            TxEntry {
                workspace,
                expires_at,
            },
        );
        (id, self.wire_expiry())
    }

    fn wire_expiry(&self) -> String {
        millis_to_rfc3339(now_millis() + self.timeout.as_millis() as i64)
    }

    /// Removes the workspace for exclusive use by one request. An expired
    /// entry is dropped on access and reported unknown.
    pub fn take(&self, id: u64) -> Result<Workspace> {
        let mut inner = self.inner.lock();
        match inner.remove(&id) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(entry.workspace),
            Some(_) | None => Err(NornicError::UnknownTransaction(id.to_string())),
        }
    }

    /// Returns a workspace after a request, refreshing the expiry.
    pub fn put_back(&self, id: u64, workspace: Workspace) -> String {
        let expires_at = Instant::now() + self.timeout;
        self.inner.lock().insert(
            id,
            TxEntry {
                workspace,
                expires_at,
            },
        );
        self.wire_expiry()
    }

    /// Rollback: drop the workspace. Unknown ids report an error so clients
    /// see the difference between rollback and double-rollback.
    pub fn rollback(&self, id: u64) -> Result<()> {
        self.take(id).map(|_| ())
    }

    /// Drops every expired transaction, returning how many went.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|_, entry| entry.expires_at > now);
        before - inner.len()
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().len()
    }
}
