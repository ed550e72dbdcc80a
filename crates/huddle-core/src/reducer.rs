//! The replicated state store.
//!
//! [`reduce`] is the single state transition function, used identically by the
//! facilitator and by replicas. [`SessionStore`] wraps it with the current
//! state and a clock for timer actions.

use crate::action::Action;
use crate::clock::Clock;
use crate::state::SessionState;
use crate::timer::{MAX_DURATION_SECS, TimerState};
use std::sync::Arc;
use tracing::debug;

/// Apply `action` to `state`.
///
/// Returns `None` when the action is rejected by a guard (unknown story or
/// card, duplicate participant, ...) or leaves the state unchanged. Only
/// timer actions read `now_ms`.
pub fn reduce(state: &SessionState, action: &Action, now_ms: u64) -> Option<SessionState> {
    let mut next = state.clone();

    match action {
        Action::SetState(snapshot) => {
            next = snapshot.as_ref().clone();
        }
        Action::SetMode(mode) => {
            next.mode = *mode;
            next.is_voting_active = false;
            next.show_individual_votes = false;
        }
        Action::AddParticipant(participant) => {
            if state.participant(&participant.id).is_some() {
                return None;
            }
            next.participants.push(participant.clone());
        }
        Action::RemoveParticipant(id) => {
            state.participant(id)?;
            next.participants.retain(|p| &p.id != id);
            if next.participants.is_empty() {
                return None;
            }
            if &next.facilitator_id == id {
                next.facilitator_id = next.participants[0].id.clone();
            }
        }
        Action::AddStory(story) => {
            if state.story(&story.id).is_some() {
                return None;
            }
            next.stories.push(story.clone());
            if next.current_story_id.is_none() {
                next.current_story_id = Some(story.id.clone());
            }
        }
        Action::UpdateStory { id, title } => {
            let story = next.stories.iter_mut().find(|s| &s.id == id)?;
            story.title = title.clone();
        }
        Action::DeleteStory(id) => {
            state.story(id)?;
            next.stories.retain(|s| &s.id != id);
            if next.current_story_id.as_ref() == Some(id) {
                next.current_story_id = next
                    .stories
                    .iter()
                    .find(|s| s.estimate.is_none())
                    .map(|s| s.id.clone());
            }
        }
        Action::SetCurrentStory(id) => {
            if let Some(id) = id {
                state.story(id)?;
            }
            next.current_story_id = id.clone();
            next.votes.clear();
            next.are_votes_revealed = false;
            next.is_voting_active = false;
        }
        Action::CastVote {
            participant_id,
            value,
        } => {
            next.votes.insert(participant_id.clone(), *value);
        }
        Action::SetVotes(votes) => {
            next.votes = votes.clone();
        }
        Action::RevealVotes => {
            next.are_votes_revealed = true;
        }
        Action::ResetVoting => {
            next.votes.clear();
            next.are_votes_revealed = false;
            next.is_voting_active = false;
        }
        Action::StartVoting => {
            next.votes.clear();
            next.are_votes_revealed = false;
            next.is_voting_active = true;
        }
        Action::ToggleShowIndividualVotes => {
            next.show_individual_votes = !next.show_individual_votes;
        }
        Action::SetEstimate { story_id, estimate } => {
            let story = next.stories.iter_mut().find(|s| &s.id == story_id)?;
            story.estimate = Some(*estimate);
        }
        Action::AddRetroCard { column_id, card } => {
            if state.retro_columns.iter().any(|c| c.cards.iter().any(|k| k.id == card.id)) {
                return None;
            }
            next.column_mut(*column_id)?.cards.push(card.clone());
        }
        Action::VoteRetroCard { column_id, card_id } => {
            let card = next
                .column_mut(*column_id)?
                .cards
                .iter_mut()
                .find(|c| &c.id == card_id)?;
            let votes = card.votes.saturating_add(1);
            if votes == card.votes {
                return None;
            }
            card.votes = votes;
        }
        Action::DeleteRetroCard { column_id, card_id } => {
            let column = next.column_mut(*column_id)?;
            let index = column.cards.iter().position(|c| &c.id == card_id)?;
            column.cards.remove(index);
        }
        Action::SortRetroColumn(column_id) => {
            // Stable, so cards with equal votes keep their relative order.
            next.column_mut(*column_id)?
                .cards
                .sort_by(|a, b| b.votes.cmp(&a.votes));
        }
        Action::MoveRetroCard {
            source_column_id,
            dest_column_id,
            card_id,
            insert_at_index,
        } => {
            next.column(*dest_column_id)?;
            let source = next.column_mut(*source_column_id)?;
            let index = source.cards.iter().position(|c| &c.id == card_id)?;
            let card = source.cards.remove(index);
            let dest = next.column_mut(*dest_column_id)?;
            let at = (*insert_at_index).min(dest.cards.len());
            dest.cards.insert(at, card);
        }
        Action::SetIcebreaker(question) => {
            next.icebreaker = question.clone();
        }
        Action::SetFacilitator(id) => {
            state.participant(id)?;
            next.facilitator_id = id.clone();
        }
        Action::StartTimer { duration } => {
            if !duration.is_finite() || *duration <= 0.0 || *duration > MAX_DURATION_SECS {
                return None;
            }
            next.timer = TimerState::started(*duration, now_ms);
        }
        Action::TogglePauseTimer => {
            next.timer = state.timer.toggled(now_ms)?;
        }
        Action::ResetTimer => {
            next.timer = TimerState::default();
        }
    }

    (next != *state).then_some(next)
}

/// Current session state plus the clock used for timer actions.
pub struct SessionStore {
    state: SessionState,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(state: SessionState, clock: Arc<dyn Clock>) -> Self {
        Self { state, clock }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Apply an action. Returns whether the state changed.
    pub fn apply(&mut self, action: &Action) -> bool {
        match reduce(&self.state, action, self.clock.now_ms()) {
            Some(next) => {
                self.state = next;
                true
            }
            None => {
                debug!("Action {} had no effect", action.kind());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::identity::{PeerIdentity, RoomCode};
    use crate::state::{Participant, RetroCard, RetroColumnId, RoomMode, Story, VoteValue};

    fn id(s: &str) -> PeerIdentity {
        PeerIdentity::new(s).unwrap()
    }

    fn participant(s: &str) -> Participant {
        Participant {
            id: id(s),
            name: s.to_uppercase(),
            avatar: format!("avatar-{s}"),
        }
    }

    fn story(s: &str) -> Story {
        Story {
            id: s.into(),
            title: format!("Story {s}"),
            description: None,
            estimate: None,
        }
    }

    fn card(s: &str, votes: u32) -> RetroCard {
        RetroCard {
            id: s.into(),
            text: s.into(),
            author_id: id("host"),
            votes,
        }
    }

    fn base() -> SessionState {
        SessionState::new(RoomCode::new("room").unwrap(), participant("host"), "Hi?")
    }

    /// Apply a sequence of actions, panicking if any of them is a no-op.
    fn apply_all(state: SessionState, actions: &[Action]) -> SessionState {
        actions.iter().fold(state, |s, a| {
            reduce(&s, a, 0).unwrap_or_else(|| panic!("{} was a no-op", a.kind()))
        })
    }

    fn cards(state: &SessionState, column: RetroColumnId) -> Vec<&str> {
        state
            .column(column)
            .unwrap()
            .cards
            .iter()
            .map(|c| c.id.as_str())
            .collect()
    }

    // ==================== Snapshot ====================

    #[test]
    fn test_set_state_replaces_everything() {
        let mut snapshot = base();
        snapshot.participants.push(participant("p1"));
        snapshot.icebreaker = "Other?".into();
        let action = Action::SetState(Box::new(snapshot.clone()));

        let next = reduce(&base(), &action, 0).unwrap();
        assert_eq!(next, snapshot);
    }

    #[test]
    fn test_set_state_is_idempotent() {
        let mut snapshot = base();
        snapshot.stories.push(story("s1"));
        let action = Action::SetState(Box::new(snapshot));

        let once = reduce(&base(), &action, 0).unwrap();
        let twice = reduce(&once, &action, 0).unwrap_or_else(|| once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_reduce_is_deterministic() {
        let state = apply_all(base(), &[Action::AddStory(story("s1"))]);
        let action = Action::CastVote {
            participant_id: id("host"),
            value: VoteValue::Points(3),
        };
        assert_eq!(reduce(&state, &action, 7), reduce(&state, &action, 7));
    }

    // ==================== Participants ====================

    #[test]
    fn test_add_participant_twice_is_noop() {
        let state = apply_all(base(), &[Action::AddParticipant(participant("p1"))]);
        assert_eq!(state.participants.len(), 2);
        assert!(reduce(&state, &Action::AddParticipant(participant("p1")), 0).is_none());
    }

    #[test]
    fn test_remove_participant() {
        let state = apply_all(base(), &[Action::AddParticipant(participant("p1"))]);
        let next = reduce(&state, &Action::RemoveParticipant(id("p1")), 0).unwrap();
        assert!(next.participant(&id("p1")).is_none());
        assert!(reduce(&next, &Action::RemoveParticipant(id("p1")), 0).is_none());
    }

    #[test]
    fn test_removing_logical_facilitator_hands_role_to_first_participant() {
        let state = apply_all(
            base(),
            &[
                Action::AddParticipant(participant("p1")),
                Action::AddParticipant(participant("p2")),
                Action::SetFacilitator(id("p2")),
            ],
        );
        let next = reduce(&state, &Action::RemoveParticipant(id("p2")), 0).unwrap();
        assert_eq!(next.facilitator_id, id("host"));
    }

    #[test]
    fn test_cannot_remove_last_participant() {
        assert!(reduce(&base(), &Action::RemoveParticipant(id("host")), 0).is_none());
    }

    #[test]
    fn test_set_facilitator_requires_participant() {
        assert!(reduce(&base(), &Action::SetFacilitator(id("ghost")), 0).is_none());

        let state = apply_all(base(), &[Action::AddParticipant(participant("p1"))]);
        let next = reduce(&state, &Action::SetFacilitator(id("p1")), 0).unwrap();
        assert!(next.is_facilitator(&id("p1")));
    }

    // ==================== Stories ====================

    #[test]
    fn test_first_story_becomes_current() {
        let state = apply_all(
            base(),
            &[Action::AddStory(story("s1")), Action::AddStory(story("s2"))],
        );
        assert_eq!(state.current_story_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_update_story_title_only() {
        let state = apply_all(base(), &[Action::AddStory(story("s1"))]);
        let next = reduce(
            &state,
            &Action::UpdateStory {
                id: "s1".into(),
                title: "Renamed".into(),
            },
            0,
        )
        .unwrap();
        assert_eq!(next.story("s1").unwrap().title, "Renamed");
        assert!(
            reduce(
                &state,
                &Action::UpdateStory {
                    id: "missing".into(),
                    title: "x".into()
                },
                0
            )
            .is_none()
        );
    }

    #[test]
    fn test_delete_current_story_advances_to_unestimated() {
        let state = apply_all(
            base(),
            &[
                Action::AddStory(story("s1")),
                Action::AddStory(story("s2")),
                Action::AddStory(story("s3")),
                Action::SetEstimate {
                    story_id: "s2".into(),
                    estimate: VoteValue::Points(5),
                },
            ],
        );
        let next = reduce(&state, &Action::DeleteStory("s1".into()), 0).unwrap();
        assert_eq!(next.current_story_id.as_deref(), Some("s3"));
        assert_eq!(next.stories.len(), 2);
    }

    #[test]
    fn test_delete_current_story_clears_selection_when_all_estimated() {
        let state = apply_all(
            base(),
            &[
                Action::AddStory(story("s1")),
                Action::AddStory(story("s2")),
                Action::SetEstimate {
                    story_id: "s2".into(),
                    estimate: VoteValue::Coffee,
                },
            ],
        );
        let next = reduce(&state, &Action::DeleteStory("s1".into()), 0).unwrap();
        assert_eq!(next.current_story_id, None);
    }

    #[test]
    fn test_delete_other_story_keeps_selection() {
        let state = apply_all(
            base(),
            &[Action::AddStory(story("s1")), Action::AddStory(story("s2"))],
        );
        let next = reduce(&state, &Action::DeleteStory("s2".into()), 0).unwrap();
        assert_eq!(next.current_story_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_set_current_story_clears_round() {
        let state = apply_all(
            base(),
            &[
                Action::AddStory(story("s1")),
                Action::AddStory(story("s2")),
                Action::StartVoting,
                Action::CastVote {
                    participant_id: id("host"),
                    value: VoteValue::Points(8),
                },
                Action::RevealVotes,
            ],
        );
        let next = reduce(&state, &Action::SetCurrentStory(Some("s2".into())), 0).unwrap();
        assert_eq!(next.current_story_id.as_deref(), Some("s2"));
        assert!(next.votes.is_empty());
        assert!(!next.are_votes_revealed);
        assert!(!next.is_voting_active);

        assert!(reduce(&state, &Action::SetCurrentStory(Some("nope".into())), 0).is_none());
    }

    // ==================== Voting ====================

    #[test]
    fn test_voting_round() {
        let state = apply_all(
            base(),
            &[
                Action::StartVoting,
                Action::CastVote {
                    participant_id: id("host"),
                    value: VoteValue::Points(3),
                },
                Action::CastVote {
                    participant_id: id("p1"),
                    value: VoteValue::Unsure,
                },
                Action::CastVote {
                    participant_id: id("host"),
                    value: VoteValue::Points(5),
                },
            ],
        );
        assert!(state.is_voting_active);
        assert_eq!(state.votes.len(), 2);
        assert_eq!(state.votes[&id("host")], VoteValue::Points(5));

        let revealed = reduce(&state, &Action::RevealVotes, 0).unwrap();
        assert!(revealed.are_votes_revealed);
        assert_eq!(revealed.votes, state.votes);

        let reset = reduce(&revealed, &Action::ResetVoting, 0).unwrap();
        assert!(reset.votes.is_empty());
        assert!(!reset.are_votes_revealed);
        assert!(!reset.is_voting_active);
    }

    #[test]
    fn test_start_voting_clears_previous_round() {
        let state = apply_all(
            base(),
            &[
                Action::CastVote {
                    participant_id: id("host"),
                    value: VoteValue::Points(1),
                },
                Action::RevealVotes,
            ],
        );
        let next = reduce(&state, &Action::StartVoting, 0).unwrap();
        assert!(next.votes.is_empty());
        assert!(!next.are_votes_revealed);
        assert!(next.is_voting_active);
    }

    #[test]
    fn test_repeated_reveal_is_noop() {
        let state = apply_all(base(), &[Action::RevealVotes]);
        assert!(reduce(&state, &Action::RevealVotes, 0).is_none());
    }

    #[test]
    fn test_set_mode_clears_voting_flags() {
        let state = apply_all(
            base(),
            &[Action::StartVoting, Action::ToggleShowIndividualVotes],
        );
        let next = reduce(&state, &Action::SetMode(RoomMode::Retro), 0).unwrap();
        assert_eq!(next.mode, RoomMode::Retro);
        assert!(!next.is_voting_active);
        assert!(!next.show_individual_votes);

        // Same mode still clears the active flag.
        let again = reduce(&state, &Action::SetMode(RoomMode::Planning), 0).unwrap();
        assert!(!again.is_voting_active);
    }

    // ==================== Retro Board ====================

    #[test]
    fn test_move_card_across_columns() {
        let state = apply_all(
            base(),
            &[
                Action::AddRetroCard {
                    column_id: RetroColumnId::Well,
                    card: card("w0", 0),
                },
                Action::AddRetroCard {
                    column_id: RetroColumnId::Well,
                    card: card("w1", 0),
                },
                Action::AddRetroCard {
                    column_id: RetroColumnId::Improve,
                    card: card("i0", 0),
                },
                Action::AddRetroCard {
                    column_id: RetroColumnId::Improve,
                    card: card("i1", 0),
                },
                Action::AddRetroCard {
                    column_id: RetroColumnId::Improve,
                    card: card("i2", 0),
                },
            ],
        );
        let next = reduce(
            &state,
            &Action::MoveRetroCard {
                source_column_id: RetroColumnId::Well,
                dest_column_id: RetroColumnId::Improve,
                card_id: "w0".into(),
                insert_at_index: 2,
            },
            0,
        )
        .unwrap();
        assert_eq!(cards(&next, RetroColumnId::Well), ["w1"]);
        assert_eq!(cards(&next, RetroColumnId::Improve), ["i0", "i1", "w0", "i2"]);
    }

    #[test]
    fn test_move_card_within_column() {
        let state = apply_all(
            base(),
            &[
                Action::AddRetroCard {
                    column_id: RetroColumnId::Actions,
                    card: card("a", 0),
                },
                Action::AddRetroCard {
                    column_id: RetroColumnId::Actions,
                    card: card("b", 0),
                },
                Action::AddRetroCard {
                    column_id: RetroColumnId::Actions,
                    card: card("c", 0),
                },
            ],
        );
        let next = reduce(
            &state,
            &Action::MoveRetroCard {
                source_column_id: RetroColumnId::Actions,
                dest_column_id: RetroColumnId::Actions,
                card_id: "a".into(),
                insert_at_index: 2,
            },
            0,
        )
        .unwrap();
        assert_eq!(cards(&next, RetroColumnId::Actions), ["b", "c", "a"]);
    }

    #[test]
    fn test_move_card_index_is_clamped() {
        let state = apply_all(
            base(),
            &[Action::AddRetroCard {
                column_id: RetroColumnId::Well,
                card: card("w0", 0),
            }],
        );
        let next = reduce(
            &state,
            &Action::MoveRetroCard {
                source_column_id: RetroColumnId::Well,
                dest_column_id: RetroColumnId::Actions,
                card_id: "w0".into(),
                insert_at_index: 99,
            },
            0,
        )
        .unwrap();
        assert_eq!(cards(&next, RetroColumnId::Actions), ["w0"]);
    }

    #[test]
    fn test_move_missing_card_is_noop() {
        let action = Action::MoveRetroCard {
            source_column_id: RetroColumnId::Well,
            dest_column_id: RetroColumnId::Improve,
            card_id: "ghost".into(),
            insert_at_index: 0,
        };
        assert!(reduce(&base(), &action, 0).is_none());
    }

    #[test]
    fn test_vote_delete_and_sort_cards() {
        let state = apply_all(
            base(),
            &[
                Action::AddRetroCard {
                    column_id: RetroColumnId::Improve,
                    card: card("a", 1),
                },
                Action::AddRetroCard {
                    column_id: RetroColumnId::Improve,
                    card: card("b", 0),
                },
                Action::AddRetroCard {
                    column_id: RetroColumnId::Improve,
                    card: card("c", 1),
                },
                Action::VoteRetroCard {
                    column_id: RetroColumnId::Improve,
                    card_id: "b".into(),
                },
                Action::VoteRetroCard {
                    column_id: RetroColumnId::Improve,
                    card_id: "b".into(),
                },
                Action::SortRetroColumn(RetroColumnId::Improve),
            ],
        );
        assert_eq!(cards(&state, RetroColumnId::Improve), ["b", "a", "c"]);

        let next = reduce(
            &state,
            &Action::DeleteRetroCard {
                column_id: RetroColumnId::Improve,
                card_id: "a".into(),
            },
            0,
        )
        .unwrap();
        assert_eq!(cards(&next, RetroColumnId::Improve), ["b", "c"]);
        // Sorting an already sorted column changes nothing.
        assert!(reduce(&next, &Action::SortRetroColumn(RetroColumnId::Improve), 0).is_none());
    }

    #[test]
    fn test_vote_card_in_wrong_column_is_noop() {
        let state = apply_all(
            base(),
            &[Action::AddRetroCard {
                column_id: RetroColumnId::Well,
                card: card("w0", 0),
            }],
        );
        let action = Action::VoteRetroCard {
            column_id: RetroColumnId::Actions,
            card_id: "w0".into(),
        };
        assert!(reduce(&state, &action, 0).is_none());
    }

    #[test]
    fn test_vote_on_maxed_card_is_noop() {
        let state = apply_all(
            base(),
            &[Action::AddRetroCard {
                column_id: RetroColumnId::Well,
                card: card("full", u32::MAX),
            }],
        );
        let action = Action::VoteRetroCard {
            column_id: RetroColumnId::Well,
            card_id: "full".into(),
        };
        assert!(reduce(&state, &action, 0).is_none());
        assert_eq!(state.column(RetroColumnId::Well).unwrap().cards[0].votes, u32::MAX);
    }

    // ==================== Timer ====================

    #[test]
    fn test_timer_pause_resume_keeps_remaining() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mut store = SessionStore::new(base(), clock.clone());

        assert!(store.apply(&Action::StartTimer { duration: 300.0 }));
        clock.advance(10_000);
        assert!(store.apply(&Action::TogglePauseTimer));
        assert_eq!(store.state().timer.remaining(store.now_ms()), 290.0);

        clock.advance(60_000);
        assert!(store.apply(&Action::TogglePauseTimer));
        assert_eq!(store.state().timer.remaining(store.now_ms()), 290.0);
        assert!(store.state().timer.is_running);

        assert!(store.apply(&Action::ResetTimer));
        assert_eq!(store.state().timer, TimerState::default());
    }

    #[test]
    fn test_invalid_timer_actions_are_noops() {
        let clock = Arc::new(ManualClock::new(0));
        let mut store = SessionStore::new(base(), clock);
        assert!(!store.apply(&Action::StartTimer { duration: 0.0 }));
        assert!(!store.apply(&Action::StartTimer { duration: f64::NAN }));
        assert!(!store.apply(&Action::StartTimer { duration: 1e300 }));
        assert!(!store.apply(&Action::StartTimer {
            duration: f64::INFINITY
        }));
        assert!(!store.apply(&Action::TogglePauseTimer));
        assert!(!store.apply(&Action::ResetTimer));
    }

    #[test]
    fn test_store_reports_noop() {
        let clock = Arc::new(ManualClock::new(0));
        let mut store = SessionStore::new(base(), clock);
        assert!(store.apply(&Action::SetIcebreaker("New?".into())));
        assert!(!store.apply(&Action::SetIcebreaker("New?".into())));
        assert_eq!(store.state().icebreaker, "New?");
    }
}
