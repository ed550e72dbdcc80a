//! Relay wire frames.
//!
//! Every frame is a JSON text WebSocket message tagged by `type`. A client
//! registers one address per socket, then opens and accepts channels that the
//! relay multiplexes over the sockets of the two endpoints.

use huddle_core::PeerIdentity;
use huddle_core::protocol::MAX_MESSAGE_SIZE;
use serde::{Deserialize, Serialize};

/// Upper bound on a single relay frame: one session message plus framing.
pub const MAX_FRAME_SIZE: usize = MAX_MESSAGE_SIZE + 1024;

/// Relay-assigned channel number, unique per relay process.
pub type WireChannel = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RelayFrame {
    /// Client -> relay: claim an address for this socket.
    Register { id: PeerIdentity },
    /// Relay -> client: the address is ours until the socket closes.
    Registered { id: PeerIdentity },
    /// Relay -> client: registration refused.
    Rejected { reason: RejectReason },

    /// Client -> relay: open a channel to `to`. `request` is echoed back.
    Open { request: u64, to: PeerIdentity },
    /// Relay -> opener: the channel exists and `to` has been told.
    Opened { request: u64, channel: WireChannel },
    /// Relay -> opener: nobody holds `to`, or we are not registered.
    OpenFailed { request: u64, reason: String },
    /// Relay -> acceptor: `from` opened a channel to us.
    Incoming { channel: WireChannel, from: PeerIdentity },

    /// Either direction: one session message on a channel.
    Data { channel: WireChannel, text: String },
    /// Either direction: the channel is gone.
    Close { channel: WireChannel },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    AddressTaken,
    AlreadyRegistered,
}

impl RelayFrame {
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).expect("RelayFrame serialization should not fail")
    }

    /// Parse a frame. Returns `None` for oversized or malformed input.
    pub fn from_text(text: &str) -> Option<Self> {
        if text.len() > MAX_FRAME_SIZE {
            return None;
        }
        serde_json::from_str(text).ok()
    }
}
