//! Per-source-address token buckets with minute and hour refill rates plus
//! a small burst. `/health` never passes through here.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::{NornicError, Result};

const IDLE_EVICT: Duration = Duration::from_secs(3600);

struct Bucket {
    minute_tokens: f64,
    hour_tokens: f64,
    refilled_at: Instant,
    last_seen: Instant,
}

impl Bucket {
    // Capacity is the refill rate's window quota; `burst` is a floor so a
    // very low quota still admits a short run.
    fn minute_cap(cfg: &RateLimitConfig) -> f64 {
        cfg.per_minute.max(cfg.burst).max(1) as f64
    }

    fn hour_cap(cfg: &RateLimitConfig) -> f64 {
        cfg.per_hour.max(cfg.burst).max(1) as f64
    }

    fn fresh(cfg: &RateLimitConfig) -> Self {
        let now = Instant::now();
        Self {
            minute_tokens: Self::minute_cap(cfg),
            hour_tokens: Self::hour_cap(cfg),
            refilled_at: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, cfg: &RateLimitConfig) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.minute_tokens = (self.minute_tokens + elapsed * cfg.per_minute as f64 / 60.0)
            .min(Self::minute_cap(cfg));
        self.hour_tokens = (self.hour_tokens + elapsed * cfg.per_hour as f64 / 3600.0)
            .min(Self::hour_cap(cfg));
        self.refilled_at = now;
        self.last_seen = now;
    }

    /// Consumes one token from both windows, or reports seconds until one
    /// becomes available.
    fn consume(&mut self, cfg: &RateLimitConfig) -> std::result::Result<(), u64> {
        self.refill(cfg);
        if self.minute_tokens >= 1.0 && self.hour_tokens >= 1.0 {
            self.minute_tokens -= 1.0;
            self.hour_tokens -= 1.0;
            return Ok(());
        }
        let minute_wait = if self.minute_tokens < 1.0 {
            (1.0 - self.minute_tokens) * 60.0 / cfg.per_minute.max(1) as f64
        } else {
            0.0
        };
        let hour_wait = if self.hour_tokens < 1.0 {
            (1.0 - self.hour_tokens) * 3600.0 / cfg.per_hour.max(1) as f64
        } else {
            0.0
        };
        Err(minute_wait.max(hour_wait).ceil().max(1.0) as u64)
    }
}

pub struct RateLimiter {
    cfg: RateLimitConfig,
    buckets: RwLock<HashMap<IpAddr, Arc<Mutex<Bucket>>>>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            cfg,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn check(&self, addr: IpAddr) -> Result<()> {
        if !self.cfg.enabled {
            return Ok(());
        }
        let bucket = {
            let buckets = self.buckets.read();
            buckets.get(&addr).cloned()
        };
        let bucket = match bucket {
            Some(bucket) => bucket,
            None => {
                let mut buckets = self.buckets.write();
                Arc::clone(
                    buckets
                        .entry(addr)
                        .or_insert_with(|| Arc::new(Mutex::new(Bucket::fresh(&self.cfg)))),
                )
            }
        };
        let mut guard = bucket.lock();
        guard.consume(&self.cfg).map_err(|retry_after_secs| {
            debug!(%addr, retry_after_secs, "rate limited");
            NornicError::RateLimited { retry_after_secs }
        })
    }

    /// Drops buckets idle for over an hour. Runs on the maintenance sweep.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let guard = bucket.lock();
            now.duration_since(guard.last_seen) < IDLE_EVICT
        });
        before - buckets.len()
    }

    pub fn tracked_addresses(&self) -> usize {
        self.buckets.read().len()
    }
}
