//! Identities on the signaling service: room codes and peer addresses.
//!
//! The facilitator's address is derived from the room code, so any participant
//! can dial it without discovery. Participant addresses are random per join.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Prefix for the address the facilitator claims for a room.
pub const DEFAULT_FACILITATOR_PREFIX: &str = "scrum-facilitator-peer-";

/// Prefix for randomly generated participant addresses.
pub const DEFAULT_PARTICIPANT_PREFIX: &str = "scrum-participant-";

/// Length of the random suffix of a participant address.
const PARTICIPANT_SUFFIX_LEN: usize = 9;

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

const CODE_ADJECTIVES: &[&str] = &[
    "Swift", "Red", "Blue", "Green", "Solar", "Lunar", "Cosmic", "Magic",
];
const CODE_NOUNS: &[&str] = &[
    "River", "Mountain", "Forest", "Star", "Planet", "Comet", "Galaxy", "Nebula",
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Identity cannot be empty")]
    Empty,
    #[error("Invalid character {0:?} in room code")]
    InvalidRoomCode(char),
}

/// Shared code naming a session, e.g. `Swift-River-123`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Validate and wrap a user-entered room code (surrounding whitespace is trimmed).
    pub fn new(code: impl AsRef<str>) -> Result<Self, IdentityError> {
        let code = code.as_ref().trim();
        if code.is_empty() {
            return Err(IdentityError::Empty);
        }
        if let Some(c) = code
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(IdentityError::InvalidRoomCode(c));
        }
        Ok(Self(code.to_string()))
    }

    /// Generate a memorable random room code like `Cosmic-Comet-512`.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let adjective = CODE_ADJECTIVES[rng.random_range(0..CODE_ADJECTIVES.len())];
        let noun = CODE_NOUNS[rng.random_range(0..CODE_NOUNS.len())];
        let number: u16 = rng.random_range(100..1000);
        Self(format!("{adjective}-{noun}-{number}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RoomCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomCode {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Address of an endpoint on the signaling service.
///
/// Doubles as the participant id inside session state, so the identity a
/// channel reports for its remote end is the same id used in `participants`
/// and `votes`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(id: impl Into<String>) -> Result<Self, IdentityError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdentityError::Empty);
        }
        Ok(Self(id))
    }

    /// The well-known address the facilitator of `room` claims.
    pub fn facilitator(prefix: &str, room: &RoomCode) -> Self {
        Self(format!("{prefix}{room}"))
    }

    /// Generate a fresh participant address: `prefix` plus 9 random base36 chars.
    pub fn generate(prefix: &str) -> Self {
        let mut rng = rand::rng();
        let suffix: String = (0..PARTICIPANT_SUFFIX_LEN)
            .map(|_| BASE36[rng.random_range(0..BASE36.len())] as char)
            .collect();
        Self(format!("{prefix}{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for PeerIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
