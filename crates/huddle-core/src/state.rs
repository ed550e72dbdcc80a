//! Shared session state and the domain types it is built from.
//!
//! Everything here serializes to the camelCase JSON shape carried in
//! `SET_STATE` snapshots, so the facilitator's state can be replayed verbatim
//! on every replica.

use crate::identity::{PeerIdentity, RoomCode};
use crate::timer::TimerState;
use rand::Rng;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

const COFFEE: &str = "☕";
const UNSURE: &str = "❓";

/// Cards offered for planning votes, in display order.
pub const VOTING_SCALE: [VoteValue; 9] = [
    VoteValue::Points(1),
    VoteValue::Points(2),
    VoteValue::Points(3),
    VoteValue::Points(5),
    VoteValue::Points(8),
    VoteValue::Points(13),
    VoteValue::Points(21),
    VoteValue::Unsure,
    VoteValue::Coffee,
];

pub const ICEBREAKER_QUESTIONS: [&str; 8] = [
    "What's the most useful thing you own?",
    "If you could have any superpower, what would it be and why?",
    "What's a small thing that made you smile this week?",
    "What's your favorite productivity hack?",
    "If you had to eat one meal for the rest of your life, what would it be?",
    "What's a skill you'd like to learn?",
    "What's the best thing you've watched or read recently?",
    "If you could travel anywhere in the world, where would you go first?",
];

/// Pick a random icebreaker question.
pub fn random_icebreaker() -> &'static str {
    ICEBREAKER_QUESTIONS[rand::rng().random_range(0..ICEBREAKER_QUESTIONS.len())]
}

/// Pick a random icebreaker question different from `current` when possible.
pub fn next_icebreaker(current: &str) -> &'static str {
    let candidates: Vec<&'static str> = ICEBREAKER_QUESTIONS
        .iter()
        .copied()
        .filter(|q| *q != current)
        .collect();
    if candidates.is_empty() {
        return random_icebreaker();
    }
    candidates[rand::rng().random_range(0..candidates.len())]
}

/// Fresh opaque id for stories and retro cards.
pub fn new_item_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: PeerIdentity,
    pub name: String,
    pub avatar: String,
}

/// A planning vote: a point value or one of the two special cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoteValue {
    Points(u32),
    /// "☕", needs a break.
    Coffee,
    /// "❓", not sure.
    Unsure,
}

impl VoteValue {
    pub fn points(&self) -> Option<u32> {
        match self {
            Self::Points(n) => Some(*n),
            _ => None,
        }
    }
}

impl Display for VoteValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Points(n) => write!(f, "{n}"),
            Self::Coffee => f.write_str(COFFEE),
            Self::Unsure => f.write_str(UNSURE),
        }
    }
}

impl Serialize for VoteValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Points(n) => serializer.serialize_u32(*n),
            Self::Coffee => serializer.serialize_str(COFFEE),
            Self::Unsure => serializer.serialize_str(UNSURE),
        }
    }
}

impl<'de> Deserialize<'de> for VoteValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct VoteValueVisitor;

        impl Visitor<'_> for VoteValueVisitor {
            type Value = VoteValue;

            fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative integer, \"☕\" or \"❓\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<VoteValue, E> {
                u32::try_from(v)
                    .map(VoteValue::Points)
                    .map_err(|_| E::custom(format!("vote value {v} out of range")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<VoteValue, E> {
                u64::try_from(v)
                    .map_err(|_| E::custom(format!("negative vote value {v}")))
                    .and_then(|v| self.visit_u64(v))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<VoteValue, E> {
                if v.fract() == 0.0 && v >= 0.0 && v <= u32::MAX as f64 {
                    Ok(VoteValue::Points(v as u32))
                } else {
                    Err(E::custom(format!("vote value {v} is not a whole number")))
                }
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<VoteValue, E> {
                match v {
                    COFFEE => Ok(VoteValue::Coffee),
                    UNSURE => Ok(VoteValue::Unsure),
                    other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
                }
            }
        }

        deserializer.deserialize_any(VoteValueVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate: Option<VoteValue>,
}

impl Story {
    /// A new story with a fresh id and no estimate.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: new_item_id(),
            title: title.into(),
            description: None,
            estimate: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomMode {
    #[default]
    Planning,
    Retro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetroColumnId {
    Well,
    Improve,
    Actions,
}

impl RetroColumnId {
    pub const ALL: [RetroColumnId; 3] = [Self::Well, Self::Improve, Self::Actions];

    pub fn title(&self) -> &'static str {
        match self {
            Self::Well => "What went well?",
            Self::Improve => "What could be improved?",
            Self::Actions => "Action Items",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetroCard {
    pub id: String,
    pub text: String,
    pub author_id: PeerIdentity,
    pub votes: u32,
}

impl RetroCard {
    pub fn new(text: impl Into<String>, author_id: PeerIdentity) -> Self {
        Self {
            id: new_item_id(),
            text: text.into(),
            author_id,
            votes: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetroColumn {
    pub id: RetroColumnId,
    pub title: String,
    pub cards: Vec<RetroCard>,
}

impl RetroColumn {
    pub fn empty(id: RetroColumnId) -> Self {
        Self {
            id,
            title: id.title().to_string(),
            cards: Vec::new(),
        }
    }
}

/// The replicated session state.
///
/// Authoritative on the facilitator; every replica holds the last snapshot it
/// received plus the actions applied since.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub room_code: RoomCode,
    pub mode: RoomMode,
    pub participants: Vec<Participant>,
    pub facilitator_id: PeerIdentity,
    pub stories: Vec<Story>,
    pub current_story_id: Option<String>,
    pub votes: BTreeMap<PeerIdentity, VoteValue>,
    pub are_votes_revealed: bool,
    pub is_voting_active: bool,
    #[serde(default)]
    pub show_individual_votes: bool,
    pub retro_columns: Vec<RetroColumn>,
    pub icebreaker: String,
    #[serde(default)]
    pub timer: TimerState,
}

impl SessionState {
    /// Initial state created by the facilitator when it claims a room.
    pub fn new(room_code: RoomCode, facilitator: Participant, icebreaker: impl Into<String>) -> Self {
        let facilitator_id = facilitator.id.clone();
        Self {
            room_code,
            mode: RoomMode::Planning,
            participants: vec![facilitator],
            facilitator_id,
            stories: Vec::new(),
            current_story_id: None,
            votes: BTreeMap::new(),
            are_votes_revealed: false,
            is_voting_active: false,
            show_individual_votes: false,
            retro_columns: RetroColumnId::ALL.into_iter().map(RetroColumn::empty).collect(),
            icebreaker: icebreaker.into(),
            timer: TimerState::default(),
        }
    }

    /// Provisional state a replica shows until the first snapshot arrives.
    ///
    /// Names the expected facilitator but lists only the local participant.
    pub fn provisional(room_code: RoomCode, facilitator_id: PeerIdentity, local: Participant) -> Self {
        let mut state = Self::new(room_code, local, String::new());
        state.facilitator_id = facilitator_id;
        state
    }

    pub fn participant(&self, id: &PeerIdentity) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.id == id)
    }

    pub fn is_facilitator(&self, id: &PeerIdentity) -> bool {
        &self.facilitator_id == id
    }

    pub fn story(&self, id: &str) -> Option<&Story> {
        self.stories.iter().find(|s| s.id == id)
    }

    pub fn current_story(&self) -> Option<&Story> {
        self.current_story_id.as_deref().and_then(|id| self.story(id))
    }

    pub fn column(&self, id: RetroColumnId) -> Option<&RetroColumn> {
        self.retro_columns.iter().find(|c| c.id == id)
    }

    pub(crate) fn column_mut(&mut self, id: RetroColumnId) -> Option<&mut RetroColumn> {
        self.retro_columns.iter_mut().find(|c| c.id == id)
    }
}
