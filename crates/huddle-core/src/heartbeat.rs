//! Heartbeat-based liveness.
//!
//! The facilitator pings every open channel on a fixed interval. A replica
//! (re)arms a liveness deadline each time a PING arrives and reports the link
//! as disconnected once the deadline passes without another one.
//!
//! Sans-IO: the caller supplies `now_ms`, sends the PINGs, and sleeps until
//! [`HeartbeatMonitor::next_wakeup`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the heartbeat monitor.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often the facilitator pings (default: 5s)
    pub ping_interval: Duration,
    /// How long a replica waits for the next PING before giving up (default: 15s)
    pub liveness_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(15),
        }
    }
}

/// Local view of the link to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    status: LinkStatus,
    /// Liveness deadline (ms). `None` when not armed.
    deadline: Option<u64>,
    /// Last time we sent a round of PINGs (ms). `None` when not pinging.
    last_ping_cycle: Option<u64>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig, status: LinkStatus) -> Self {
        Self {
            config,
            status,
            deadline: None,
            last_ping_cycle: None,
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    /// Start the ping schedule; the first round is due one interval after `now_ms`.
    pub fn start_pinging(&mut self, now_ms: u64) {
        self.last_ping_cycle = Some(now_ms);
    }

    /// Check if it's time for another round of PINGs.
    pub fn should_ping(&self, now_ms: u64) -> bool {
        let interval_ms = self.config.ping_interval.as_millis() as u64;
        self.last_ping_cycle
            .is_some_and(|last| now_ms.saturating_sub(last) >= interval_ms)
    }

    /// Mark that we've sent a round of PINGs.
    pub fn mark_ping_cycle(&mut self, now_ms: u64) {
        self.last_ping_cycle = Some(now_ms);
    }

    fn next_ping_at(&self) -> Option<u64> {
        let interval_ms = self.config.ping_interval.as_millis() as u64;
        self.last_ping_cycle.map(|last| last + interval_ms)
    }

    /// Earliest time something is due: a ping round or the liveness deadline.
    pub fn next_wakeup(&self) -> Option<u64> {
        match (self.next_ping_at(), self.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Arm (or re-arm) the liveness deadline.
    pub fn arm(&mut self, now_ms: u64) {
        self.deadline = Some(now_ms + self.config.liveness_timeout.as_millis() as u64);
    }

    /// A PING arrived: re-arm and upgrade the status.
    ///
    /// Returns the new status if it changed.
    pub fn on_ping(&mut self, now_ms: u64) -> Option<LinkStatus> {
        self.arm(now_ms);
        self.set_status(LinkStatus::Connected)
    }

    /// Fire the liveness deadline if it has passed.
    ///
    /// Returns the new status if it changed. The deadline is disarmed either way
    /// once it fires; only another PING re-arms it.
    pub fn check_timeout(&mut self, now_ms: u64) -> Option<LinkStatus> {
        match self.deadline {
            Some(deadline) if now_ms >= deadline => {
                self.deadline = None;
                self.set_status(LinkStatus::Disconnected)
            }
            _ => None,
        }
    }

    pub fn set_status(&mut self, status: LinkStatus) -> Option<LinkStatus> {
        if self.status == status {
            None
        } else {
            self.status = status;
            Some(status)
        }
    }

    /// Disarm the deadline and stop pinging.
    pub fn cancel(&mut self) {
        self.deadline = None;
        self.last_ping_cycle = None;
    }
}
