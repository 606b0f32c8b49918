//! Time sources for operation stamps and presence bookkeeping.
//!
//! Uses `web_time` so the same code runs on native and in the browser.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use web_time::{SystemTime, UNIX_EPOCH};

/// Wall clock in milliseconds since the Unix epoch.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start_ms)))
    }

    pub fn set(&self, now_ms: u64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.0.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Monotonic stamp generator.
///
/// Local stamps never go backwards and never repeat, and a replica that has
/// seen a remote timestamp never stamps below it. That keeps a user's later
/// edit ahead of everything it was made on top of, even with skewed clocks.
#[derive(Debug, Default)]
pub struct HybridClock {
    last: u64,
}

impl HybridClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next local timestamp: `max(wall, last + 1)`.
    pub fn tick(&mut self, wall_ms: u64) -> u64 {
        self.last = wall_ms.max(self.last.saturating_add(1));
        self.last
    }

    /// Fold in a timestamp seen on a remote operation.
    pub fn observe(&mut self, remote_ms: u64) {
        self.last = self.last.max(remote_ms);
    }

    pub fn last(&self) -> u64 {
        self.last
    }
}
