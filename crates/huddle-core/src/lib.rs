//! huddle-core: replicated session state for peer-to-peer planning poker and retros.
//!
//! One endpoint per room holds the authoritative state (the facilitator);
//! every other endpoint keeps a replica that forwards intents and applies the
//! facilitator's echoes. This crate provides:
//! - The session state model, domain actions and a pure reducer
//! - The JSON `{type, payload}` wire protocol
//! - A connection registry, heartbeat monitor and role-aware router
//! - The session coordinator that joins a room and runs the event loop
//! - Transport traits plus an in-memory implementation for tests

pub mod action;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod memory;
pub mod protocol;
pub mod reducer;
pub mod registry;
pub mod router;
pub mod state;
pub mod tally;
pub mod timer;
pub mod transport;

pub use action::Action;
pub use clock::{Clock, ManualClock, RuntimeClock};
pub use config::SessionConfig;
pub use coordinator::{Profile, SessionHandle, join, join_with_clock};
pub use error::{JoinError, SessionError};
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor, LinkStatus};
pub use identity::{IdentityError, PeerIdentity, RoomCode};
pub use memory::MemoryNetwork;
pub use protocol::{Control, Message, ProtocolError};
pub use reducer::{SessionStore, reduce};
pub use registry::{ConnectionRegistry, ConnectionStatus, DisconnectReason, RegistryUpdate};
pub use router::{MessageRouter, Outbound, Role, Routed};
pub use state::{
    Participant, RetroCard, RetroColumn, RetroColumnId, RoomMode, SessionState, Story, VoteValue,
};
pub use timer::TimerState;
pub use transport::{Channel, ChannelId, ChannelTransport, Signaling, SignalingError, TransportError};
