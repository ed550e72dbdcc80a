//! Shared countdown timer.
//!
//! The timer is stored as data rather than ticking: while running, remaining
//! time is derived from `start_time` and the caller's clock, so every replica
//! renders the same countdown without extra traffic.

use serde::{Deserialize, Serialize};

/// Longest countdown a timer accepts, in seconds.
pub const MAX_DURATION_SECS: f64 = u32::MAX as f64;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    /// Wall-clock ms when the current run started. `None` while paused or idle.
    pub start_time: Option<u64>,
    /// Seconds remaining as of `start_time` (or as of the pause, if paused).
    pub duration: f64,
    pub is_running: bool,
}

impl TimerState {
    /// A timer running for `duration_secs` from `now_ms`.
    pub fn started(duration_secs: f64, now_ms: u64) -> Self {
        Self {
            start_time: Some(now_ms),
            duration: duration_secs,
            is_running: true,
        }
    }

    /// Seconds left at `now_ms`, never negative.
    pub fn remaining(&self, now_ms: u64) -> f64 {
        match (self.is_running, self.start_time) {
            (true, Some(start)) => {
                let elapsed = now_ms.saturating_sub(start) as f64 / 1000.0;
                (self.duration - elapsed).max(0.0)
            }
            _ => self.duration,
        }
    }

    /// Whether a countdown has been set (running or paused with time left).
    pub fn has_started(&self) -> bool {
        self.duration > 0.0 || self.is_running
    }

    /// Running and out of time.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.is_running && self.remaining(now_ms) <= 0.0
    }

    /// Wall-clock ms at which a running timer reaches zero.
    pub fn expires_at(&self) -> Option<u64> {
        match (self.is_running, self.start_time) {
            (true, Some(start)) => Some(start.saturating_add((self.duration * 1000.0).ceil() as u64)),
            _ => None,
        }
    }

    /// Pause a running timer or resume a paused one.
    ///
    /// Pausing folds elapsed time into `duration`. Returns `None` when there is
    /// nothing to resume.
    pub fn toggled(&self, now_ms: u64) -> Option<Self> {
        if self.is_running {
            Some(Self {
                start_time: None,
                duration: self.remaining(now_ms),
                is_running: false,
            })
        } else if self.duration > 0.0 {
            Some(Self::started(self.duration, now_ms))
        } else {
            None
        }
    }
}
