//! Role-aware message routing.
//!
//! Decides, for every inbound message and every locally dispatched action,
//! what happens to the store and what must be sent where. Sans-IO: returns
//! [`Outbound`] instructions for the coordinator to carry out.

use crate::action::Action;
use crate::heartbeat::{HeartbeatMonitor, LinkStatus};
use crate::identity::PeerIdentity;
use crate::protocol::{Control, Message};
use crate::reducer::SessionStore;
use serde::Serialize;
use tracing::{debug, warn};

/// Network role, fixed at join time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    /// Holds the room's derived address and the authoritative state
    Facilitator,
    /// Holds a cached copy and forwards intents to the facilitator
    Replica,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Send { to: PeerIdentity, message: Message },
    Broadcast(Message),
}

/// Result of routing one message.
#[derive(Debug, Default, PartialEq)]
pub struct Routed {
    pub outbound: Vec<Outbound>,
    /// The store changed.
    pub state_changed: bool,
    /// The link status changed to this.
    pub status: Option<LinkStatus>,
}

pub struct MessageRouter {
    role: Role,
    /// Address of the facilitator endpoint (ours, if we are it)
    facilitator: PeerIdentity,
}

impl MessageRouter {
    pub fn new(role: Role, facilitator: PeerIdentity) -> Self {
        Self { role, facilitator }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn facilitator(&self) -> &PeerIdentity {
        &self.facilitator
    }

    /// Route a raw message received from `from`.
    ///
    /// Malformed input is logged and dropped.
    pub fn route(
        &self,
        from: &PeerIdentity,
        text: &str,
        store: &mut SessionStore,
        heartbeat: &mut HeartbeatMonitor,
    ) -> Routed {
        match Message::decode(text) {
            Ok(Some(Message::Control(control))) => self.on_control(from, control, store, heartbeat),
            Ok(Some(Message::Action(action))) => self.on_action(from, action, store),
            Ok(None) => {
                debug!("Ignoring message of unknown type from {}", from);
                Routed::default()
            }
            Err(e) => {
                warn!("Dropping message from {}: {}", from, e);
                Routed::default()
            }
        }
    }

    fn on_control(
        &self,
        from: &PeerIdentity,
        control: Control,
        store: &mut SessionStore,
        heartbeat: &mut HeartbeatMonitor,
    ) -> Routed {
        let mut routed = Routed::default();

        match control {
            Control::Ping => {
                routed.outbound.push(Outbound::Send {
                    to: from.clone(),
                    message: Control::Pong.into(),
                });
                routed.status = heartbeat.on_ping(store.now_ms());
            }
            Control::Pong => {}
            Control::IntroduceAndRequestState(participant) => {
                if self.role != Role::Facilitator {
                    warn!("Ignoring introduction from {}: not the facilitator", from);
                    return routed;
                }
                if &participant.id != from {
                    warn!(
                        "Ignoring introduction from {} claiming to be {}",
                        from, participant.id
                    );
                    return routed;
                }
                debug!("{} ({}) joined", participant.name, participant.id);

                // The newcomer's first snapshot must already contain them.
                let mut snapshot = store.state().clone();
                if snapshot.participant(&participant.id).is_none() {
                    snapshot.participants.push(participant.clone());
                }
                routed.outbound.push(Outbound::Send {
                    to: from.clone(),
                    message: Message::snapshot(snapshot),
                });

                let action = Action::AddParticipant(participant);
                if store.apply(&action) {
                    routed.state_changed = true;
                    routed.outbound.push(Outbound::Broadcast(action.into()));
                }
            }
            Control::RequestState => {
                if self.role != Role::Facilitator {
                    warn!("Ignoring state request from {}: not the facilitator", from);
                    return routed;
                }
                routed.outbound.push(Outbound::Send {
                    to: from.clone(),
                    message: Message::snapshot(store.state().clone()),
                });
            }
        }

        routed
    }

    fn on_action(&self, from: &PeerIdentity, action: Action, store: &mut SessionStore) -> Routed {
        let mut routed = Routed::default();

        match self.role {
            Role::Facilitator => {
                if action.is_snapshot() {
                    warn!("Ignoring snapshot from replica {}", from);
                    return routed;
                }
                if store.apply(&action) {
                    debug!("Applied {} from {}", action.kind(), from);
                    routed.state_changed = true;
                    routed.outbound.push(Outbound::Broadcast(action.into()));
                }
            }
            Role::Replica => {
                if from != &self.facilitator {
                    warn!("Ignoring {} from non-facilitator {}", action.kind(), from);
                    return routed;
                }
                // Timer actions read the local clock, so a replica's startTime
                // trails the facilitator's by the delivery latency until the
                // next SET_STATE replaces it.
                routed.state_changed = store.apply(&action);
            }
        }

        routed
    }

    /// Handle an action produced locally.
    ///
    /// The facilitator applies it and broadcasts it if it took effect; a
    /// replica only forwards it and waits for the echo.
    pub fn dispatch(&self, action: Action, store: &mut SessionStore) -> Routed {
        let mut routed = Routed::default();

        match self.role {
            Role::Facilitator => {
                if store.apply(&action) {
                    routed.state_changed = true;
                    if !action.is_snapshot() {
                        routed.outbound.push(Outbound::Broadcast(action.into()));
                    }
                }
            }
            Role::Replica => {
                if action.is_snapshot() {
                    warn!("Replicas cannot dispatch snapshots");
                    return routed;
                }
                routed.outbound.push(Outbound::Send {
                    to: self.facilitator.clone(),
                    message: action.into(),
                });
            }
        }

        routed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::heartbeat::HeartbeatConfig;
    use crate::identity::RoomCode;
    use crate::state::{Participant, SessionState, VoteValue};
    use crate::timer::TimerState;
    use std::sync::Arc;

    fn id(s: &str) -> PeerIdentity {
        PeerIdentity::new(s).unwrap()
    }

    fn participant(s: &str) -> Participant {
        Participant {
            id: id(s),
            name: s.to_uppercase(),
            avatar: String::new(),
        }
    }

    struct Fixture {
        router: MessageRouter,
        store: SessionStore,
        heartbeat: HeartbeatMonitor,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new(role: Role) -> Self {
            let clock = Arc::new(ManualClock::new(1_000));
            let state = SessionState::new(RoomCode::new("room").unwrap(), participant("host"), "Hi?");
            let status = match role {
                Role::Facilitator => LinkStatus::Connected,
                Role::Replica => LinkStatus::Connecting,
            };
            Self {
                router: MessageRouter::new(role, id("host")),
                store: SessionStore::new(state, clock.clone()),
                heartbeat: HeartbeatMonitor::new(HeartbeatConfig::default(), status),
                clock,
            }
        }

        fn route(&mut self, from: &str, message: impl Into<Message>) -> Routed {
            let message: Message = message.into();
            let text = message.to_json();
            self.router
                .route(&id(from), &text, &mut self.store, &mut self.heartbeat)
        }

        fn route_text(&mut self, from: &str, text: &str) -> Routed {
            self.router
                .route(&id(from), text, &mut self.store, &mut self.heartbeat)
        }
    }

    fn vote(who: &str, points: u32) -> Action {
        Action::CastVote {
            participant_id: id(who),
            value: VoteValue::Points(points),
        }
    }

    // ==================== Facilitator ====================

    #[test]
    fn test_introduction_sends_snapshot_with_newcomer_then_broadcasts() {
        let mut f = Fixture::new(Role::Facilitator);
        let routed = f.route("p1", Control::IntroduceAndRequestState(participant("p1")));

        assert!(routed.state_changed);
        assert_eq!(routed.outbound.len(), 2);
        match &routed.outbound[0] {
            Outbound::Send {
                to,
                message: Message::Action(Action::SetState(snapshot)),
            } => {
                assert_eq!(to, &id("p1"));
                assert!(snapshot.participant(&id("p1")).is_some());
                assert!(snapshot.participant(&id("host")).is_some());
            }
            other => panic!("Expected snapshot first, got {other:?}"),
        }
        assert_eq!(
            routed.outbound[1],
            Outbound::Broadcast(Action::AddParticipant(participant("p1")).into())
        );
        assert!(f.store.state().participant(&id("p1")).is_some());
    }

    #[test]
    fn test_repeated_introduction_only_resends_snapshot() {
        let mut f = Fixture::new(Role::Facilitator);
        f.route("p1", Control::IntroduceAndRequestState(participant("p1")));
        let routed = f.route("p1", Control::IntroduceAndRequestState(participant("p1")));

        assert!(!routed.state_changed);
        assert_eq!(routed.outbound.len(), 1);
        assert!(matches!(routed.outbound[0], Outbound::Send { .. }));
        assert_eq!(f.store.state().participants.len(), 2);
    }

    #[test]
    fn test_introduction_for_someone_else_is_ignored() {
        let mut f = Fixture::new(Role::Facilitator);
        let routed = f.route("p1", Control::IntroduceAndRequestState(participant("p2")));
        assert_eq!(routed, Routed::default());
        assert_eq!(f.store.state().participants.len(), 1);
    }

    #[test]
    fn test_request_state_returns_unmodified_snapshot() {
        let mut f = Fixture::new(Role::Facilitator);
        let routed = f.route("p1", Control::RequestState);
        assert_eq!(
            routed.outbound,
            vec![Outbound::Send {
                to: id("p1"),
                message: Message::snapshot(f.store.state().clone()),
            }]
        );
        assert!(!routed.state_changed);
    }

    #[test]
    fn test_facilitator_applies_and_broadcasts_actions() {
        let mut f = Fixture::new(Role::Facilitator);
        let routed = f.route("p1", vote("p1", 5));
        assert!(routed.state_changed);
        assert_eq!(routed.outbound, vec![Outbound::Broadcast(vote("p1", 5).into())]);
        assert_eq!(f.store.state().votes[&id("p1")], VoteValue::Points(5));
    }

    #[test]
    fn test_facilitator_does_not_broadcast_noops() {
        let mut f = Fixture::new(Role::Facilitator);
        f.route("p1", vote("p1", 5));
        let routed = f.route("p1", vote("p1", 5));
        assert_eq!(routed, Routed::default());

        let routed = f.route("p1", Action::DeleteStory("missing".into()));
        assert_eq!(routed, Routed::default());
    }

    #[test]
    fn test_facilitator_ignores_snapshots_from_replicas() {
        let mut f = Fixture::new(Role::Facilitator);
        let mut forged = f.store.state().clone();
        forged.icebreaker = "Forged".into();
        let routed = f.route("p1", Message::snapshot(forged));
        assert_eq!(routed, Routed::default());
        assert_eq!(f.store.state().icebreaker, "Hi?");
    }

    #[test]
    fn test_local_dispatch_on_facilitator() {
        let mut f = Fixture::new(Role::Facilitator);
        let routed = f.router.dispatch(Action::StartVoting, &mut f.store);
        assert!(routed.state_changed);
        assert_eq!(routed.outbound, vec![Outbound::Broadcast(Action::StartVoting.into())]);

        let routed = f.router.dispatch(Action::StartVoting, &mut f.store);
        assert!(routed.outbound.is_empty());
    }

    // ==================== Replica ====================

    #[test]
    fn test_ping_replies_pong_and_upgrades_status() {
        let mut f = Fixture::new(Role::Replica);
        let routed = f.route("host", Control::Ping);
        assert_eq!(
            routed.outbound,
            vec![Outbound::Send {
                to: id("host"),
                message: Control::Pong.into(),
            }]
        );
        assert_eq!(routed.status, Some(LinkStatus::Connected));
        assert_eq!(f.heartbeat.deadline(), Some(f.clock.now_ms() + 15_000));

        // Already connected: no status change, deadline re-armed
        f.clock.advance(5_000);
        let routed = f.route("host", Control::Ping);
        assert_eq!(routed.status, None);
        assert_eq!(f.heartbeat.deadline(), Some(21_000));
    }

    #[test]
    fn test_replica_applies_facilitator_actions() {
        let mut f = Fixture::new(Role::Replica);
        let routed = f.route("host", vote("p1", 3));
        assert!(routed.state_changed);
        assert!(routed.outbound.is_empty());
        assert_eq!(f.store.state().votes.len(), 1);
    }

    #[test]
    fn test_replica_timer_uses_local_clock_until_snapshot() {
        let mut f = Fixture::new(Role::Replica);
        let mut leader = f.store.state().clone();
        leader.timer = TimerState::started(60.0, 1_000);

        f.clock.advance(40);
        f.route("host", Action::StartTimer { duration: 60.0 });
        assert_eq!(f.store.state().timer.start_time, Some(1_040));

        f.route("host", Action::SetState(Box::new(leader.clone())));
        assert_eq!(f.store.state().timer, leader.timer);
    }

    #[test]
    fn test_replica_ignores_actions_from_other_peers() {
        let mut f = Fixture::new(Role::Replica);
        let routed = f.route("p2", vote("p2", 3));
        assert_eq!(routed, Routed::default());
        assert!(f.store.state().votes.is_empty());
    }

    #[test]
    fn test_replica_applies_snapshot_by_replacement() {
        let mut f = Fixture::new(Role::Replica);
        let mut snapshot = f.store.state().clone();
        snapshot.participants.push(participant("me"));
        snapshot.icebreaker = "Fresh".into();

        let routed = f.route("host", Message::snapshot(snapshot.clone()));
        assert!(routed.state_changed);
        assert_eq!(f.store.state(), &snapshot);

        // Same snapshot again changes nothing
        let routed = f.route("host", Message::snapshot(snapshot.clone()));
        assert!(!routed.state_changed);
        assert_eq!(f.store.state(), &snapshot);
    }

    #[test]
    fn test_replica_ignores_control_meant_for_facilitator() {
        let mut f = Fixture::new(Role::Replica);
        assert_eq!(f.route("p2", Control::RequestState), Routed::default());
        assert_eq!(
            f.route("p2", Control::IntroduceAndRequestState(participant("p2"))),
            Routed::default()
        );
    }

    #[test]
    fn test_replica_dispatch_forwards_without_applying() {
        let mut f = Fixture::new(Role::Replica);
        let routed = f.router.dispatch(vote("me", 8), &mut f.store);
        assert!(!routed.state_changed);
        assert_eq!(
            routed.outbound,
            vec![Outbound::Send {
                to: id("host"),
                message: vote("me", 8).into(),
            }]
        );
        assert!(f.store.state().votes.is_empty());
    }

    // ==================== Malformed ====================

    #[test]
    fn test_malformed_and_unknown_messages_are_dropped() {
        let mut f = Fixture::new(Role::Facilitator);
        let before = f.store.state().clone();
        assert_eq!(f.route_text("p1", "{not json"), Routed::default());
        assert_eq!(f.route_text("p1", r#"{"type":"HIGH_FIVE"}"#), Routed::default());
        assert_eq!(
            f.route_text("p1", r#"{"type":"CAST_VOTE","payload":"oops"}"#),
            Routed::default()
        );
        assert_eq!(f.store.state(), &before);
    }
}
