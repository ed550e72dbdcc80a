//! Session coordinator: joins a room and drives one endpoint's event loop.
//!
//! Joining claims the room's derived facilitator address. Whoever gets it is
//! the facilitator and holds the authoritative state; everyone else claims a
//! random participant address, opens a channel to the facilitator and becomes
//! a replica.
//!
//! After the join, a single task owns the registry, router, store and
//! heartbeat. The [`SessionHandle`] talks to it over a command channel and
//! observes it through `watch` channels, so state only ever changes on that
//! one task.

use crate::action::Action;
use crate::clock::{Clock, RuntimeClock};
use crate::config::SessionConfig;
use crate::error::{JoinError, SessionError};
use crate::heartbeat::{HeartbeatMonitor, LinkStatus};
use crate::identity::{PeerIdentity, RoomCode};
use crate::protocol::{Control, Message};
use crate::reducer::SessionStore;
use crate::registry::{ConnectionRegistry, RegistryUpdate};
use crate::router::{MessageRouter, Outbound, Role, Routed};
use crate::state::{Participant, SessionState, VoteValue, next_icebreaker, random_icebreaker};
use crate::tally::{median_estimate, next_unestimated_story};
use crate::transport::{Channel, ChannelTransport, Signaling, SignalingError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How the local user appears to everyone else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub avatar: String,
}

impl Profile {
    pub fn new(name: impl Into<String>, avatar: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            avatar: avatar.into(),
        }
    }

    fn into_participant(self, id: PeerIdentity) -> Participant {
        Participant {
            id,
            name: self.name,
            avatar: self.avatar,
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Dispatch(Action),
    Reconnect(Reply<Result<(), SessionError>>),
    Refresh(Reply<Result<(), SessionError>>),
    /// Sent by a refresh once the facilitator channel is verified.
    RequestState(Reply<Result<(), SessionError>>),
    Leave(Reply<()>),
}

/// Join `room`, creating it if nobody holds it yet.
pub async fn join(
    signaling: Arc<dyn Signaling>,
    room: RoomCode,
    profile: Profile,
    config: SessionConfig,
) -> Result<SessionHandle, JoinError> {
    join_with_clock(signaling, room, profile, config, Arc::new(RuntimeClock::new())).await
}

/// [`join`] with an explicit time source.
pub async fn join_with_clock(
    signaling: Arc<dyn Signaling>,
    room: RoomCode,
    profile: Profile,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
) -> Result<SessionHandle, JoinError> {
    let facilitator_id = PeerIdentity::facilitator(&config.facilitator_prefix, &room);
    info!("Joining room {} (facilitator address {})", room, facilitator_id);

    match claim(signaling.as_ref(), &facilitator_id, config.signaling_timeout()).await {
        Ok(transport) => {
            info!("Claimed {}; hosting room {}", facilitator_id, room);
            let local = profile.into_participant(facilitator_id);
            let state = SessionState::new(room, local.clone(), random_icebreaker());
            Ok(SessionCoordinator::spawn(
                Role::Facilitator,
                local,
                transport,
                state,
                None,
                config,
                clock,
            ))
        }
        Err(SignalingError::AddressTaken(_)) => {
            debug!("{} is taken; joining as a participant", facilitator_id);
            join_as_replica(signaling, room, profile, facilitator_id, config, clock).await
        }
        Err(SignalingError::Unavailable(reason)) => {
            error!("Signaling unavailable: {}", reason);
            Err(JoinError::SignalingUnavailable(reason))
        }
        Err(SignalingError::Other(reason)) => {
            error!("Failed to claim {}: {}", facilitator_id, reason);
            Err(JoinError::Other(reason))
        }
    }
}

async fn join_as_replica(
    signaling: Arc<dyn Signaling>,
    room: RoomCode,
    profile: Profile,
    facilitator_id: PeerIdentity,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
) -> Result<SessionHandle, JoinError> {
    let local_id = PeerIdentity::generate(&config.participant_prefix);
    let transport = match claim(signaling.as_ref(), &local_id, config.signaling_timeout()).await {
        Ok(transport) => transport,
        Err(SignalingError::Unavailable(reason)) => {
            error!("Signaling unavailable: {}", reason);
            return Err(JoinError::SignalingUnavailable(reason));
        }
        Err(e) => {
            error!("Failed to claim {}: {}", local_id, e);
            return Err(JoinError::Other(e.to_string()));
        }
    };

    let channel = match connect_with_retry(transport.as_ref(), &facilitator_id, &config).await {
        Ok(channel) => channel,
        Err(e) => {
            error!("Could not reach facilitator {}: {}", facilitator_id, e);
            transport.shutdown().await;
            return Err(JoinError::FacilitatorUnreachable(e));
        }
    };

    info!("Connected to facilitator {} as {}", facilitator_id, local_id);
    let local = profile.into_participant(local_id);
    let state = SessionState::provisional(room, facilitator_id, local.clone());
    Ok(SessionCoordinator::spawn(
        Role::Replica,
        local,
        transport,
        state,
        Some(channel),
        config,
        clock,
    ))
}

async fn claim(
    signaling: &dyn Signaling,
    identity: &PeerIdentity,
    timeout: Duration,
) -> Result<Arc<dyn ChannelTransport>, SignalingError> {
    match tokio::time::timeout(timeout, signaling.claim(identity)).await {
        Ok(result) => result,
        Err(_) => Err(SignalingError::Unavailable(format!(
            "claiming {identity} timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Open the first channel to the facilitator, retrying a bounded number of times.
async fn connect_with_retry(
    transport: &dyn ChannelTransport,
    facilitator: &PeerIdentity,
    config: &SessionConfig,
) -> Result<Arc<dyn Channel>, SessionError> {
    let attempts = config.join_attempts.max(1);
    let mut last_error = SessionError::ConnectTimeout(facilitator.clone());

    for attempt in 1..=attempts {
        if attempt > 1 {
            tokio::time::sleep(config.retry_delay()).await;
        }
        let timeout = config.connect_timeout(attempt);
        debug!("Connecting to {} (attempt {}/{})", facilitator, attempt, attempts);

        match tokio::time::timeout(timeout, transport.open(facilitator)).await {
            Ok(Ok(channel)) => return Ok(channel),
            Ok(Err(e)) => {
                warn!("Attempt {} to reach {} failed: {}", attempt, facilitator, e);
                last_error = SessionError::Transport(e.to_string());
            }
            Err(_) => {
                warn!("Attempt {} to reach {} timed out", attempt, facilitator);
                last_error = SessionError::ConnectTimeout(facilitator.clone());
            }
        }
    }

    Err(last_error)
}

struct SessionCoordinator {
    local: Participant,
    router: MessageRouter,
    registry: ConnectionRegistry,
    transport: Arc<dyn ChannelTransport>,
    heartbeat: HeartbeatMonitor,
    store: SessionStore,
    config: SessionConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    /// For follow-up commands from spawned tasks; weak so dropping every
    /// handle still ends the session.
    command_tx: mpsc::WeakUnboundedSender<Command>,
    state_tx: watch::Sender<SessionState>,
    status_tx: watch::Sender<LinkStatus>,
    /// Inbound channels are still being accepted
    accepting: bool,
}

impl SessionCoordinator {
    fn spawn(
        role: Role,
        local: Participant,
        transport: Arc<dyn ChannelTransport>,
        state: SessionState,
        initial_channel: Option<Arc<dyn Channel>>,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> SessionHandle {
        let facilitator = match role {
            Role::Facilitator => local.id.clone(),
            Role::Replica => state.facilitator_id.clone(),
        };
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(state.clone());
        let (status_tx, status_rx) = watch::channel(LinkStatus::Connecting);

        let mut coordinator = Self {
            local: local.clone(),
            router: MessageRouter::new(role, facilitator),
            registry: ConnectionRegistry::new(transport.clone()),
            transport,
            heartbeat: HeartbeatMonitor::new(config.heartbeat(), LinkStatus::Connecting),
            store: SessionStore::new(state, clock),
            config,
            commands,
            command_tx: command_tx.downgrade(),
            state_tx,
            status_tx,
            accepting: true,
        };
        let task = tokio::spawn(async move {
            coordinator.start(initial_channel).await;
            coordinator.run().await;
        });

        SessionHandle {
            local,
            role,
            commands: command_tx,
            state_rx,
            status_rx,
            task: Arc::new(task),
        }
    }

    async fn start(&mut self, initial_channel: Option<Arc<dyn Channel>>) {
        let now = self.store.now_ms();
        match self.router.role() {
            Role::Facilitator => {
                self.heartbeat.start_pinging(now);
                self.set_status(LinkStatus::Connected);
            }
            Role::Replica => {
                if let Some(channel) = initial_channel {
                    self.registry.register(channel);
                }
                self.on_facilitator_opened().await;
            }
        }
    }

    async fn run(&mut self) {
        loop {
            let delay = self
                .next_wakeup()
                .map(|at| Duration::from_millis(at.saturating_sub(self.store.now_ms())));

            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!("Every session handle dropped");
                        self.leave().await;
                        break;
                    };
                    if !self.on_command(command).await {
                        break;
                    }
                }

                Some(update) = self.registry.poll() => {
                    self.on_registry_update(update).await;
                }

                channel = self.transport.accept(), if self.accepting => {
                    match channel {
                        Some(channel) => {
                            info!("Incoming channel from {}", channel.remote());
                            self.registry.register(channel);
                        }
                        None => {
                            warn!("Endpoint {} stopped accepting channels", self.local.id);
                            self.accepting = false;
                        }
                    }
                }

                _ = sleep_for(delay) => {
                    self.on_wake().await;
                }
            }
        }
        info!("Session for {} ended", self.local.id);
    }

    /// Earliest of the heartbeat schedule and, on the facilitator, timer expiry.
    fn next_wakeup(&self) -> Option<u64> {
        let timer = match self.router.role() {
            Role::Facilitator => self.store.state().timer.expires_at(),
            Role::Replica => None,
        };
        match (self.heartbeat.next_wakeup(), timer) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    async fn on_wake(&mut self) {
        let now = self.store.now_ms();

        match self.router.role() {
            Role::Facilitator => {
                if self.heartbeat.should_ping(now) {
                    let sent = self.registry.broadcast(&Control::Ping.into()).await;
                    debug!("Pinged {} peer(s)", sent);
                    self.heartbeat.mark_ping_cycle(now);
                }
                if self.store.state().timer.is_expired(now) {
                    info!("Timer expired");
                    self.dispatch(Action::TogglePauseTimer).await;
                }
            }
            Role::Replica => {
                if let Some(status) = self.heartbeat.check_timeout(now) {
                    warn!("Connection timed out. No PING received.");
                    self.publish_status(status);
                }
            }
        }
    }

    /// Returns `false` once the session should stop.
    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Dispatch(action) => self.dispatch(action).await,
            Command::Reconnect(reply) => self.reconnect(reply).await,
            Command::Refresh(reply) => self.refresh(reply).await,
            Command::RequestState(reply) => {
                let facilitator = self.router.facilitator().clone();
                let result = self
                    .registry
                    .send(&facilitator, &Control::RequestState.into())
                    .await;
                let _ = reply.send(result);
            }
            Command::Leave(reply) => {
                self.leave().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn dispatch(&mut self, action: Action) {
        let routed = self.router.dispatch(action, &mut self.store);
        self.execute(routed).await;
    }

    async fn on_registry_update(&mut self, update: RegistryUpdate) {
        let facilitator = self.router.facilitator().clone();

        match update {
            RegistryUpdate::Message { from, text } => {
                self.registry.touch(&from, self.store.now_ms());
                let routed = self
                    .router
                    .route(&from, &text, &mut self.store, &mut self.heartbeat);
                self.execute(routed).await;
            }
            RegistryUpdate::Opened { peer } => {
                if self.router.role() == Role::Replica && peer == facilitator {
                    self.on_facilitator_opened().await;
                }
            }
            RegistryUpdate::ConnectFailed { peer, error } => {
                if self.router.role() == Role::Replica && peer == facilitator {
                    warn!("Could not reach facilitator: {}", error);
                    self.set_status(LinkStatus::Disconnected);
                }
            }
            RegistryUpdate::Disconnected { peer, reason } => {
                info!("Peer disconnected: {} ({:?})", peer, reason);
                match self.router.role() {
                    Role::Facilitator => {
                        self.dispatch(Action::RemoveParticipant(peer)).await;
                    }
                    Role::Replica if peer == facilitator => {
                        warn!("Lost connection to facilitator");
                        self.heartbeat.cancel();
                        self.set_status(LinkStatus::Disconnected);
                    }
                    Role::Replica => {}
                }
            }
        }
    }

    /// Introduce ourselves on a fresh facilitator channel and start watching it.
    async fn on_facilitator_opened(&mut self) {
        let facilitator = self.router.facilitator().clone();
        let hello: Message = Control::IntroduceAndRequestState(self.local.clone()).into();
        if let Err(e) = self.registry.send(&facilitator, &hello).await {
            warn!("Failed to introduce to {}: {}", facilitator, e);
            self.set_status(LinkStatus::Disconnected);
            return;
        }
        self.heartbeat.arm(self.store.now_ms());
        self.set_status(LinkStatus::Connected);
    }

    async fn reconnect(&mut self, reply: Reply<Result<(), SessionError>>) {
        if self.router.role() == Role::Facilitator {
            let _ = reply.send(Ok(()));
            return;
        }

        let facilitator = self.router.facilitator().clone();
        if self.registry.is_open(&facilitator) {
            debug!("Channel to {} is open; requesting state", facilitator);
            let result = self
                .registry
                .send(&facilitator, &Control::RequestState.into())
                .await;
            let _ = reply.send(result);
            return;
        }

        info!("Attempting to reconnect to facilitator...");
        self.set_status(LinkStatus::Connecting);
        let pending = self
            .registry
            .connect(&facilitator, self.config.reverify_timeout());
        tokio::spawn(async move {
            let result = pending.await.unwrap_or(Err(SessionError::Closed));
            if let Err(e) = &result {
                error!("Reconnect failed: {}", e);
            }
            let _ = reply.send(result);
        });
    }

    async fn refresh(&mut self, reply: Reply<Result<(), SessionError>>) {
        if self.router.role() == Role::Facilitator {
            info!("Broadcasting full state to all peers");
            let snapshot = Message::snapshot(self.store.state().clone());
            self.registry.broadcast(&snapshot).await;
            let _ = reply.send(Ok(()));
            return;
        }

        let facilitator = self.router.facilitator().clone();
        if !self.registry.is_open(&facilitator) {
            self.set_status(LinkStatus::Connecting);
        }
        let pending = self
            .registry
            .connect(&facilitator, self.config.reverify_timeout());
        let command_tx = self.command_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = pending.await.unwrap_or(Err(SessionError::Closed)) {
                error!("Refresh failed: {}", e);
                let _ = reply.send(Err(e));
                return;
            }
            debug!("Connection healthy; requesting state from facilitator");
            match command_tx.upgrade() {
                Some(tx) => {
                    if let Err(mpsc::error::SendError(Command::RequestState(reply))) =
                        tx.send(Command::RequestState(reply))
                    {
                        let _ = reply.send(Err(SessionError::Closed));
                    }
                }
                None => {
                    let _ = reply.send(Err(SessionError::Closed));
                }
            }
        });
    }

    async fn leave(&mut self) {
        info!("Leaving room {}", self.store.state().room_code);
        self.commands.close();
        self.registry.close_all().await;
        self.heartbeat.cancel();
        self.transport.shutdown().await;
        self.accepting = false;
        self.set_status(LinkStatus::Disconnected);
    }

    async fn execute(&mut self, routed: Routed) {
        for outbound in routed.outbound {
            match outbound {
                Outbound::Send { to, message } => {
                    if let Err(e) = self.registry.send(&to, &message).await {
                        warn!("Failed to send {} to {}: {}", message.kind(), to, e);
                    }
                }
                Outbound::Broadcast(message) => {
                    self.registry.broadcast(&message).await;
                }
            }
        }
        if let Some(status) = routed.status {
            self.publish_status(status);
        }
        if routed.state_changed {
            self.state_tx.send_replace(self.store.state().clone());
        }
    }

    fn set_status(&mut self, status: LinkStatus) {
        self.heartbeat.set_status(status);
        self.publish_status(status);
    }

    fn publish_status(&self, status: LinkStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                debug!("Link status: {} -> {}", current, status);
                *current = status;
                true
            }
        });
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

/// Handle to a running session. Cheap to clone.
///
/// The session ends when [`leave`](Self::leave) is called or every handle is
/// dropped.
#[derive(Clone)]
pub struct SessionHandle {
    local: Participant,
    role: Role,
    commands: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<SessionState>,
    status_rx: watch::Receiver<LinkStatus>,
    task: Arc<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn local(&self) -> &Participant {
        &self.local
    }

    /// Network role, fixed at join.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the local participant currently holds facilitator authority.
    ///
    /// Follows `SET_FACILITATOR`, unlike [`role`](Self::role).
    pub fn is_facilitator(&self) -> bool {
        self.state_rx.borrow().is_facilitator(&self.local.id)
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn status(&self) -> LinkStatus {
        *self.status_rx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<LinkStatus> {
        self.status_rx.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }

    /// Submit an action. A replica forwards it to the facilitator and sees the
    /// effect once the facilitator echoes it back.
    pub fn dispatch(&self, action: Action) -> Result<(), SessionError> {
        self.commands
            .send(Command::Dispatch(action))
            .map_err(|_| SessionError::Closed)
    }

    /// Re-open the facilitator channel after a loss. No-op on the facilitator.
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.request(Command::Reconnect).await
    }

    /// Resynchronize: the facilitator re-broadcasts its state, a replica
    /// verifies its channel and asks for a fresh snapshot.
    pub async fn refresh(&self) -> Result<(), SessionError> {
        self.request(Command::Refresh).await
    }

    async fn request(
        &self,
        command: impl FnOnce(Reply<Result<(), SessionError>>) -> Command,
    ) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| SessionError::Closed)?;
        rx.await.unwrap_or(Err(SessionError::Closed))
    }

    /// Close every channel and release the address.
    pub async fn leave(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Leave(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Reveal votes and record the median as the current story's estimate.
    pub fn reveal_votes(&self) -> Result<(), SessionError> {
        self.dispatch(Action::RevealVotes)?;
        let estimate = {
            let state = self.state_rx.borrow();
            state
                .current_story_id
                .clone()
                .zip(median_estimate(&state.votes))
        };
        if let Some((story_id, median)) = estimate {
            self.dispatch(Action::SetEstimate {
                story_id,
                estimate: VoteValue::Points(median),
            })?;
        }
        Ok(())
    }

    /// Move on to the next story without an estimate.
    ///
    /// When none is left the selection is cleared, which also ends the
    /// current round. Returns whether a story was selected.
    pub fn next_story(&self) -> Result<bool, SessionError> {
        let next = {
            let state = self.state_rx.borrow();
            next_unestimated_story(&state.stories, state.current_story_id.as_deref())
                .map(|story| story.id.clone())
        };
        let found = next.is_some();
        self.dispatch(Action::SetCurrentStory(next))?;
        Ok(found)
    }

    /// Swap the icebreaker for a different question.
    pub fn new_icebreaker(&self) -> Result<(), SessionError> {
        let question = next_icebreaker(&self.state_rx.borrow().icebreaker);
        self.dispatch(Action::SetIcebreaker(question.to_string()))
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("local", &self.local.id)
            .field("role", &self.role)
            .field("status", &self.status())
            .finish()
    }
}
