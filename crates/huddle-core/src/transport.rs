//! Channel transport traits.
//!
//! The session layer only needs four capabilities from the network: claim an
//! address, open a named channel, accept inbound channels, and exchange text
//! messages until the channel closes.
//!
//! Implementations:
//! - In-memory network (`memory` module, for tests and simulations)
//! - WebSocket relay client (`huddle-relay` crate)

use crate::identity::PeerIdentity;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Channel closed")]
    Closed,

    #[error("Transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    /// The signaling service could not be reached at all.
    #[error("Signaling unavailable: {0}")]
    Unavailable(String),

    /// Another endpoint already holds the requested address.
    #[error("Address already taken: {0}")]
    AddressTaken(PeerIdentity),

    #[error("Signaling error: {0}")]
    Other(String),
}

/// Process-unique channel identifier.
///
/// Lets the registry tell a replaced channel's late close event apart from the
/// current channel's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// A reliable, ordered text channel to one remote endpoint.
#[async_trait]
pub trait Channel: Send + Sync {
    fn id(&self) -> ChannelId;

    /// Identity of the remote endpoint.
    fn remote(&self) -> &PeerIdentity;

    fn is_open(&self) -> bool;

    async fn send(&self, text: &str) -> Result<()>;

    /// Wait for the next message.
    ///
    /// Returns `Err(TransportError::Closed)` once the channel has closed
    /// normally; any other error means the channel failed.
    async fn recv(&self) -> Result<String>;

    /// Close the channel. Idempotent.
    async fn close(&self);
}

/// An endpoint registered on the signaling service under one address.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    fn local_id(&self) -> &PeerIdentity;

    /// Open a channel to `remote`. May never resolve; callers bound it with a timeout.
    async fn open(&self, remote: &PeerIdentity) -> Result<Arc<dyn Channel>>;

    /// Wait for the next inbound channel. `None` once the endpoint is shut down.
    async fn accept(&self) -> Option<Arc<dyn Channel>>;

    /// Release the address and close every channel.
    async fn shutdown(&self);
}

/// The signaling capability: claims addresses.
#[async_trait]
pub trait Signaling: Send + Sync {
    async fn claim(
        &self,
        identity: &PeerIdentity,
    ) -> std::result::Result<Arc<dyn ChannelTransport>, SignalingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_ids_are_unique() {
        let a = ChannelId::next();
        let b = ChannelId::next();
        assert_ne!(a, b);
        assert!(a < b);
    }
}
