use crate::identity::PeerIdentity;
use thiserror::Error;

/// Errors from a running session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Connection to {0} timed out")]
    ConnectTimeout(PeerIdentity),

    #[error("No open channel to {0}")]
    ChannelNotOpen(PeerIdentity),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session has been closed")]
    Closed,
}

/// Why joining a room failed. Messages are shown to the user as-is.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("Could not connect to signaling server. Please check your network and try again.")]
    SignalingUnavailable(String),

    #[error(
        "Could not connect to the room. This can happen on restrictive networks or due to temporary issues with the public relay servers. Please try again."
    )]
    FacilitatorUnreachable(#[source] SessionError),

    #[error("Could not create or join the room. Please check your network and try again.")]
    Other(String),
}
