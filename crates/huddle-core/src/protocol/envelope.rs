//! Typed envelope for everything sent over a session channel.
//!
//! Control kinds are recognised first; anything else with a known action tag
//! is a domain [`Action`]. Unknown tags are ignored rather than rejected so
//! newer peers can add message kinds without breaking older ones.

use crate::action::Action;
use crate::state::{Participant, SessionState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Upper bound on a single inbound message.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Message too large: {0} bytes")]
    TooLarge(usize),
    #[error("Malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("Message has no \"type\" field")]
    MissingType,
    #[error("Invalid payload for {kind}: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Control messages. Never reach the reducer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Control {
    Ping,
    Pong,
    /// First message a replica sends once its channel to the facilitator opens.
    IntroduceAndRequestState(Participant),
    RequestState,
}

impl Control {
    pub const KINDS: &'static [&'static str] =
        &["PING", "PONG", "INTRODUCE_AND_REQUEST_STATE", "REQUEST_STATE"];

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::IntroduceAndRequestState(_) => "INTRODUCE_AND_REQUEST_STATE",
            Self::RequestState => "REQUEST_STATE",
        }
    }
}

/// Anything that can travel over a session channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Control(Control),
    Action(Action),
}

impl Message {
    /// A `SET_STATE` snapshot.
    pub fn snapshot(state: SessionState) -> Self {
        Self::Action(Action::SetState(Box::new(state)))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Control(control) => control.kind(),
            Self::Action(action) => action.kind(),
        }
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Message serialization should not fail")
    }

    /// Parse a received message.
    ///
    /// Returns `Ok(None)` for well-formed messages of an unknown kind.
    pub fn decode(text: &str) -> Result<Option<Self>, ProtocolError> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge(text.len()));
        }

        let value: Value = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        if Control::KINDS.contains(&kind.as_str()) {
            serde_json::from_value(value)
                .map(|control| Some(Self::Control(control)))
                .map_err(|source| ProtocolError::InvalidPayload { kind, source })
        } else if Action::KINDS.contains(&kind.as_str()) {
            serde_json::from_value(value)
                .map(|action| Some(Self::Action(action)))
                .map_err(|source| ProtocolError::InvalidPayload { kind, source })
        } else {
            Ok(None)
        }
    }
}

impl From<Control> for Message {
    fn from(control: Control) -> Self {
        Self::Control(control)
    }
}

impl From<Action> for Message {
    fn from(action: Action) -> Self {
        Self::Action(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{PeerIdentity, RoomCode};
    use crate::state::VoteValue;
    use serde_json::json;

    fn participant() -> Participant {
        Participant {
            id: PeerIdentity::new("scrum-participant-abc123def").unwrap(),
            name: "Brave Badger".into(),
            avatar: "bottts/Casper".into(),
        }
    }

    #[test]
    fn test_ping_pong_wire_format() {
        assert_eq!(Message::from(Control::Ping).to_json(), r#"{"type":"PING"}"#);
        assert_eq!(Message::from(Control::Pong).to_json(), r#"{"type":"PONG"}"#);
    }

    #[test]
    fn test_introduce_carries_participant() {
        let msg = Message::from(Control::IntroduceAndRequestState(participant()));
        let value: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(value["type"], "INTRODUCE_AND_REQUEST_STATE");
        assert_eq!(value["payload"]["name"], "Brave Badger");

        let decoded = Message::decode(&msg.to_json()).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_snapshot_is_action() {
        let state = SessionState::new(RoomCode::new("room").unwrap(), participant(), "Hi?");
        let msg = Message::snapshot(state);
        match Message::decode(&msg.to_json()).unwrap() {
            Some(Message::Action(action)) => assert!(action.is_snapshot()),
            other => panic!("Expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_action() {
        let text = json!({
            "type": "CAST_VOTE",
            "payload": {"participantId": "p1", "value": "☕"}
        })
        .to_string();
        let decoded = Message::decode(&text).unwrap();
        assert_eq!(
            decoded,
            Some(Message::Action(Action::CastVote {
                participant_id: PeerIdentity::new("p1").unwrap(),
                value: VoteValue::Coffee,
            }))
        );
    }

    #[test]
    fn test_ping_with_null_payload_is_accepted() {
        let decoded = Message::decode(r#"{"type":"PING","payload":null}"#).unwrap();
        assert_eq!(decoded, Some(Message::Control(Control::Ping)));
    }

    #[test]
    fn test_unknown_kind_is_ignored() {
        assert_eq!(Message::decode(r#"{"type":"CONFETTI","payload":1}"#).unwrap(), None);
    }

    #[test]
    fn test_malformed_messages_are_errors() {
        assert!(matches!(Message::decode("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(Message::decode(r#"{"payload":1}"#), Err(ProtocolError::MissingType)));
        assert!(matches!(Message::decode(r#"{"type":5}"#), Err(ProtocolError::MissingType)));
        assert!(matches!(
            Message::decode(r#"{"type":"CAST_VOTE","payload":{"value":3}}"#),
            Err(ProtocolError::InvalidPayload { kind, .. }) if kind == "CAST_VOTE"
        ));
    }

    #[test]
    fn test_oversized_message_rejected() {
        let text = format!(r#"{{"type":"SET_ICEBREAKER","payload":"{}"}}"#, "x".repeat(MAX_MESSAGE_SIZE));
        assert!(matches!(Message::decode(&text), Err(ProtocolError::TooLarge(_))));
    }
}
