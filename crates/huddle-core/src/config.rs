//! Session configuration.
//!
//! All durations are in milliseconds so the config reads naturally from JSON.

use crate::heartbeat::HeartbeatConfig;
use crate::identity::{DEFAULT_FACILITATOR_PREFIX, DEFAULT_PARTICIPANT_PREFIX};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Floor for the ping interval, so a zero in the config cannot spin the loop.
const MIN_PING_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Interval between facilitator PINGs (default: 5s)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Replica gives up on the link after this long without a PING (default: 15s)
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_ms: u64,

    /// Bound on re-opening the facilitator channel during reconnect/refresh (default: 7s)
    #[serde(default = "default_reverify_timeout")]
    pub reverify_timeout_ms: u64,

    /// Bound on the first connect attempt when joining (default: 25s)
    #[serde(default = "default_first_connect_timeout")]
    pub first_connect_timeout_ms: u64,

    /// Bound on later connect attempts when joining (default: 12s)
    #[serde(default = "default_retry_connect_timeout")]
    pub retry_connect_timeout_ms: u64,

    /// Connect attempts before a join fails (default: 2)
    #[serde(default = "default_join_attempts")]
    pub join_attempts: u32,

    /// Pause between connect attempts (default: 500ms)
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Bound on claiming an address with the signaling service (default: 8s)
    #[serde(default = "default_signaling_timeout")]
    pub signaling_timeout_ms: u64,

    #[serde(default = "default_facilitator_prefix")]
    pub facilitator_prefix: String,

    #[serde(default = "default_participant_prefix")]
    pub participant_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval(),
            liveness_timeout_ms: default_liveness_timeout(),
            reverify_timeout_ms: default_reverify_timeout(),
            first_connect_timeout_ms: default_first_connect_timeout(),
            retry_connect_timeout_ms: default_retry_connect_timeout(),
            join_attempts: default_join_attempts(),
            retry_delay_ms: default_retry_delay(),
            signaling_timeout_ms: default_signaling_timeout(),
            facilitator_prefix: default_facilitator_prefix(),
            participant_prefix: default_participant_prefix(),
        }
    }
}

impl SessionConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            ping_interval: Duration::from_millis(self.ping_interval_ms.max(MIN_PING_INTERVAL_MS)),
            liveness_timeout: Duration::from_millis(self.liveness_timeout_ms),
        }
    }

    /// Timeout for connect attempt `attempt` (1-based) while joining.
    pub fn connect_timeout(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::from_millis(self.first_connect_timeout_ms)
        } else {
            Duration::from_millis(self.retry_connect_timeout_ms)
        }
    }

    pub fn reverify_timeout(&self) -> Duration {
        Duration::from_millis(self.reverify_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn signaling_timeout(&self) -> Duration {
        Duration::from_millis(self.signaling_timeout_ms)
    }
}

fn default_ping_interval() -> u64 {
    5_000
}

fn default_liveness_timeout() -> u64 {
    15_000
}

fn default_reverify_timeout() -> u64 {
    7_000
}

fn default_first_connect_timeout() -> u64 {
    25_000
}

fn default_retry_connect_timeout() -> u64 {
    12_000
}

fn default_join_attempts() -> u32 {
    2
}

fn default_retry_delay() -> u64 {
    500
}

fn default_signaling_timeout() -> u64 {
    8_000
}

fn default_facilitator_prefix() -> String {
    DEFAULT_FACILITATOR_PREFIX.to_string()
}

fn default_participant_prefix() -> String {
    DEFAULT_PARTICIPANT_PREFIX.to_string()
}
