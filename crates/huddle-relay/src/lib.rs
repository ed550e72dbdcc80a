//! huddle-relay: WebSocket signaling and channel relay for huddle sessions.
//!
//! The server side lets each socket claim one address and relays channels
//! between addresses. The client side implements the session transport
//! traits over that server, so `huddle_core::join` works across processes.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{RelaySignaling, RelayTransport};
pub use protocol::{MAX_FRAME_SIZE, RejectReason, RelayFrame};
pub use server::RelayServer;
