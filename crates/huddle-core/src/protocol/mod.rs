//! Wire protocol for session channels.
//!
//! Every message is UTF-8 JSON of the form `{"type": ..., "payload": ...}`:
//! - Control messages (liveness, introduction, state requests)
//! - Domain actions, including the `SET_STATE` snapshot

pub mod envelope;

pub use envelope::{Control, MAX_MESSAGE_SIZE, Message, ProtocolError};
