//! Time source for timers and liveness deadlines.
//!
//! Core logic takes `now_ms` explicitly; the coordinator reads it from a
//! [`Clock`] so tests can drive time by hand.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;
use web_time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Wall-clock time anchored once, then advanced by the tokio clock.
///
/// Follows `tokio::time::pause`, so paused-time tests see timer and liveness
/// deadlines move together with `sleep`.
#[derive(Debug, Clone)]
pub struct RuntimeClock {
    wall_base_ms: u64,
    started: Instant,
}

impl RuntimeClock {
    pub fn new() -> Self {
        let wall_base_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            wall_base_ms,
            started: Instant::now(),
        }
    }
}

impl Default for RuntimeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RuntimeClock {
    fn now_ms(&self) -> u64 {
        self.wall_base_ms + self.started.elapsed().as_millis() as u64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
