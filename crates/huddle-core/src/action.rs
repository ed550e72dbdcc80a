//! Domain actions: the only way session state changes.
//!
//! Actions travel on the wire as `{"type": "CAST_VOTE", "payload": {...}}`,
//! the same envelope the control messages use.

use crate::identity::PeerIdentity;
use crate::state::{Participant, RetroCard, RetroColumnId, RoomMode, SessionState, Story, VoteValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Action {
    /// Replace the whole state with a facilitator snapshot.
    SetState(Box<SessionState>),
    SetMode(RoomMode),
    AddParticipant(Participant),
    RemoveParticipant(PeerIdentity),
    AddStory(Story),
    UpdateStory {
        id: String,
        title: String,
    },
    DeleteStory(String),
    SetCurrentStory(Option<String>),
    CastVote {
        participant_id: PeerIdentity,
        value: VoteValue,
    },
    SetVotes(BTreeMap<PeerIdentity, VoteValue>),
    RevealVotes,
    ResetVoting,
    StartVoting,
    ToggleShowIndividualVotes,
    SetEstimate {
        story_id: String,
        estimate: VoteValue,
    },
    AddRetroCard {
        column_id: RetroColumnId,
        card: RetroCard,
    },
    VoteRetroCard {
        column_id: RetroColumnId,
        card_id: String,
    },
    DeleteRetroCard {
        column_id: RetroColumnId,
        card_id: String,
    },
    SortRetroColumn(RetroColumnId),
    MoveRetroCard {
        source_column_id: RetroColumnId,
        dest_column_id: RetroColumnId,
        card_id: String,
        insert_at_index: usize,
    },
    SetIcebreaker(String),
    SetFacilitator(PeerIdentity),
    StartTimer {
        /// Seconds.
        duration: f64,
    },
    TogglePauseTimer,
    ResetTimer,
}

impl Action {
    /// Every `type` tag this enum understands.
    pub const KINDS: &'static [&'static str] = &[
        "SET_STATE",
        "SET_MODE",
        "ADD_PARTICIPANT",
        "REMOVE_PARTICIPANT",
        "ADD_STORY",
        "UPDATE_STORY",
        "DELETE_STORY",
        "SET_CURRENT_STORY",
        "CAST_VOTE",
        "SET_VOTES",
        "REVEAL_VOTES",
        "RESET_VOTING",
        "START_VOTING",
        "TOGGLE_SHOW_INDIVIDUAL_VOTES",
        "SET_ESTIMATE",
        "ADD_RETRO_CARD",
        "VOTE_RETRO_CARD",
        "DELETE_RETRO_CARD",
        "SORT_RETRO_COLUMN",
        "MOVE_RETRO_CARD",
        "SET_ICEBREAKER",
        "SET_FACILITATOR",
        "START_TIMER",
        "TOGGLE_PAUSE_TIMER",
        "RESET_TIMER",
    ];

    /// The wire `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SetState(_) => "SET_STATE",
            Self::SetMode(_) => "SET_MODE",
            Self::AddParticipant(_) => "ADD_PARTICIPANT",
            Self::RemoveParticipant(_) => "REMOVE_PARTICIPANT",
            Self::AddStory(_) => "ADD_STORY",
            Self::UpdateStory { .. } => "UPDATE_STORY",
            Self::DeleteStory(_) => "DELETE_STORY",
            Self::SetCurrentStory(_) => "SET_CURRENT_STORY",
            Self::CastVote { .. } => "CAST_VOTE",
            Self::SetVotes(_) => "SET_VOTES",
            Self::RevealVotes => "REVEAL_VOTES",
            Self::ResetVoting => "RESET_VOTING",
            Self::StartVoting => "START_VOTING",
            Self::ToggleShowIndividualVotes => "TOGGLE_SHOW_INDIVIDUAL_VOTES",
            Self::SetEstimate { .. } => "SET_ESTIMATE",
            Self::AddRetroCard { .. } => "ADD_RETRO_CARD",
            Self::VoteRetroCard { .. } => "VOTE_RETRO_CARD",
            Self::DeleteRetroCard { .. } => "DELETE_RETRO_CARD",
            Self::SortRetroColumn(_) => "SORT_RETRO_COLUMN",
            Self::MoveRetroCard { .. } => "MOVE_RETRO_CARD",
            Self::SetIcebreaker(_) => "SET_ICEBREAKER",
            Self::SetFacilitator(_) => "SET_FACILITATOR",
            Self::StartTimer { .. } => "START_TIMER",
            Self::TogglePauseTimer => "TOGGLE_PAUSE_TIMER",
            Self::ResetTimer => "RESET_TIMER",
        }
    }

    /// Whether this is a full-state snapshot rather than an incremental change.
    pub fn is_snapshot(&self) -> bool {
        matches!(self, Self::SetState(_))
    }
}
