//! Connection registry: at most one open channel per remote identity.
//!
//! Owns every channel the endpoint holds, providing:
//! - Idempotent, time-bounded connects (concurrent requests share one attempt)
//! - Last-writer-wins replacement when a second channel arrives for a peer
//! - A read task per channel forwarding messages and closes as events
//! - Send/broadcast of protocol messages

use crate::error::SessionError;
use crate::identity::PeerIdentity;
use crate::protocol::Message;
use crate::transport::{Channel, ChannelId, ChannelTransport, TransportError};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle of a registry slot.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    /// Connect in progress, no channel yet
    Opening,
    /// Channel registered and readable
    Open,
    /// No channel
    Closed,
}

/// Reason for disconnection.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DisconnectReason {
    /// Remote end closed the channel
    RemoteClosed,
    /// Channel failed with a transport error
    NetworkError,
}

/// Something the session coordinator needs to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryUpdate {
    /// Text received on a peer's current channel
    Message { from: PeerIdentity, text: String },
    /// A `connect` finished with a usable channel
    Opened { peer: PeerIdentity },
    /// A `connect` failed or timed out
    ConnectFailed {
        peer: PeerIdentity,
        error: SessionError,
    },
    /// A registered channel closed or failed; its slot is gone
    Disconnected {
        peer: PeerIdentity,
        reason: DisconnectReason,
    },
}

/// Event from a read task or connect task.
enum RegistryEvent {
    Message {
        peer: PeerIdentity,
        channel: ChannelId,
        text: String,
    },
    Closed {
        peer: PeerIdentity,
        channel: ChannelId,
        reason: DisconnectReason,
    },
    Opened {
        peer: PeerIdentity,
        result: Result<Arc<dyn Channel>, SessionError>,
    },
}

type Waiter = oneshot::Sender<Result<(), SessionError>>;

struct Connection {
    channel: Option<Arc<dyn Channel>>,
    status: ConnectionStatus,
    reader: Option<JoinHandle<()>>,
    /// Last time anything arrived from this peer (ms)
    last_seen_ms: Option<u64>,
}

impl Connection {
    fn opening() -> Self {
        Self {
            channel: None,
            status: ConnectionStatus::Opening,
            reader: None,
            last_seen_ms: None,
        }
    }

    fn open_channel(&self) -> Option<&Arc<dyn Channel>> {
        match self.status {
            ConnectionStatus::Open => self.channel.as_ref(),
            _ => None,
        }
    }

    fn channel_id(&self) -> Option<ChannelId> {
        self.channel.as_ref().map(|c| c.id())
    }
}

pub struct ConnectionRegistry {
    transport: Arc<dyn ChannelTransport>,
    connections: HashMap<PeerIdentity, Connection>,
    /// Channels already taken into the registry
    processed: HashSet<ChannelId>,
    /// Callers waiting on an in-flight connect, per peer
    waiters: HashMap<PeerIdentity, Vec<Waiter>>,
    event_tx: mpsc::UnboundedSender<RegistryEvent>,
    event_rx: mpsc::UnboundedReceiver<RegistryEvent>,
}

impl ConnectionRegistry {
    pub fn new(transport: Arc<dyn ChannelTransport>) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            connections: HashMap::new(),
            processed: HashSet::new(),
            waiters: HashMap::new(),
            event_tx,
            event_rx,
        }
    }

    pub fn local_id(&self) -> &PeerIdentity {
        self.transport.local_id()
    }

    /// Ensure a usable channel to `peer` exists.
    ///
    /// Resolves immediately if one is already open. Otherwise joins the
    /// in-flight attempt for `peer` or starts one bounded by `timeout`. The
    /// outcome is also reported through [`poll`](Self::poll).
    pub fn connect(
        &mut self,
        peer: &PeerIdentity,
        timeout: Duration,
    ) -> oneshot::Receiver<Result<(), SessionError>> {
        let (tx, rx) = oneshot::channel();

        if self.is_open(peer) {
            debug!("Already connected to {}", peer);
            let _ = tx.send(Ok(()));
            return rx;
        }

        let in_flight = self.waiters.contains_key(peer);
        self.waiters.entry(peer.clone()).or_default().push(tx);
        if in_flight {
            debug!("Connect to {} already in progress", peer);
            return rx;
        }

        info!("Connecting to {}", peer);
        self.connections
            .entry(peer.clone())
            .or_insert_with(Connection::opening);

        let transport = self.transport.clone();
        let event_tx = self.event_tx.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, transport.open(&peer)).await {
                Ok(Ok(channel)) => Ok(channel),
                Ok(Err(e)) => Err(SessionError::Transport(e.to_string())),
                Err(_) => Err(SessionError::ConnectTimeout(peer.clone())),
            };
            if let Err(mpsc::error::SendError(RegistryEvent::Opened {
                result: Ok(channel),
                ..
            })) = event_tx.send(RegistryEvent::Opened { peer, result })
            {
                // Registry is gone; don't leak the channel.
                channel.close().await;
            }
        });

        rx
    }

    /// Take a channel into the registry, replacing any existing channel to the same peer.
    ///
    /// Returns `false` if this channel object was already registered or is
    /// already closed.
    pub fn register(&mut self, channel: Arc<dyn Channel>) -> bool {
        let id = channel.id();
        if !channel.is_open() {
            debug!("Ignoring closed channel {}", id);
            return false;
        }
        if !self.processed.insert(id) {
            debug!("Channel {} already registered", id);
            return false;
        }

        let peer = channel.remote().clone();
        if let Some(Connection {
            channel: Some(old),
            reader,
            ..
        }) = self.connections.remove(&peer)
        {
            info!("Replacing channel {} to {} with {}", old.id(), peer, id);
            self.processed.remove(&old.id());
            if let Some(reader) = reader {
                reader.abort();
            }
            tokio::spawn(async move { old.close().await });
        }

        let reader = tokio::spawn(read_loop(peer.clone(), channel.clone(), self.event_tx.clone()));
        self.connections.insert(
            peer.clone(),
            Connection {
                channel: Some(channel),
                status: ConnectionStatus::Open,
                reader: Some(reader),
                last_seen_ms: None,
            },
        );
        debug!("Registered channel {} to {}", id, peer);

        self.resolve_waiters(&peer, Ok(()));
        true
    }

    /// Wait for the next update.
    ///
    /// Cancel safe: state only changes after an event has been received.
    pub async fn poll(&mut self) -> Option<RegistryUpdate> {
        loop {
            let event = self.event_rx.recv().await?;
            if let Some(update) = self.on_event(event) {
                return Some(update);
            }
        }
    }

    fn on_event(&mut self, event: RegistryEvent) -> Option<RegistryUpdate> {
        match event {
            RegistryEvent::Message {
                peer,
                channel,
                text,
            } => {
                if self.current_channel(&peer) != Some(channel) {
                    debug!("Dropping message from stale channel {} ({})", channel, peer);
                    return None;
                }
                Some(RegistryUpdate::Message { from: peer, text })
            }
            RegistryEvent::Closed {
                peer,
                channel,
                reason,
            } => {
                self.processed.remove(&channel);
                if self.current_channel(&peer) != Some(channel) {
                    debug!("Ignoring close of stale channel {} ({})", channel, peer);
                    return None;
                }
                self.connections.remove(&peer);
                info!("Connection with {} closed ({:?})", peer, reason);
                Some(RegistryUpdate::Disconnected { peer, reason })
            }
            RegistryEvent::Opened {
                peer,
                result: Ok(channel),
            } => {
                let id = channel.id();
                if self.register(channel) {
                    Some(RegistryUpdate::Opened { peer })
                } else {
                    self.on_connect_failed(
                        peer,
                        SessionError::Transport(format!("channel {id} closed while opening")),
                    )
                }
            }
            RegistryEvent::Opened {
                peer,
                result: Err(error),
            } => self.on_connect_failed(peer, error),
        }
    }

    fn on_connect_failed(&mut self, peer: PeerIdentity, error: SessionError) -> Option<RegistryUpdate> {
        warn!("Failed to connect to {}: {}", peer, error);
        if self.status(&peer) == ConnectionStatus::Opening {
            self.connections.remove(&peer);
        }
        self.resolve_waiters(&peer, Err(error.clone()));
        Some(RegistryUpdate::ConnectFailed { peer, error })
    }

    fn resolve_waiters(&mut self, peer: &PeerIdentity, result: Result<(), SessionError>) {
        for waiter in self.waiters.remove(peer).unwrap_or_default() {
            let _ = waiter.send(result.clone());
        }
    }

    fn current_channel(&self, peer: &PeerIdentity) -> Option<ChannelId> {
        self.connections.get(peer).and_then(Connection::channel_id)
    }

    pub fn status(&self, peer: &PeerIdentity) -> ConnectionStatus {
        self.connections
            .get(peer)
            .map_or(ConnectionStatus::Closed, |c| c.status)
    }

    pub fn is_open(&self, peer: &PeerIdentity) -> bool {
        self.status(peer) == ConnectionStatus::Open
    }

    /// Record that something arrived from `peer`.
    pub fn touch(&mut self, peer: &PeerIdentity, now_ms: u64) {
        if let Some(conn) = self.connections.get_mut(peer) {
            conn.last_seen_ms = Some(now_ms);
        }
    }

    pub fn last_seen(&self, peer: &PeerIdentity) -> Option<u64> {
        self.connections.get(peer).and_then(|c| c.last_seen_ms)
    }

    /// Peers with an open channel.
    pub fn open_peers(&self) -> Vec<PeerIdentity> {
        self.connections
            .iter()
            .filter(|(_, c)| c.status == ConnectionStatus::Open)
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.status == ConnectionStatus::Open)
            .count()
    }

    /// Send a message to one peer.
    pub async fn send(&self, peer: &PeerIdentity, message: &Message) -> Result<(), SessionError> {
        let channel = self
            .connections
            .get(peer)
            .and_then(Connection::open_channel)
            .ok_or_else(|| SessionError::ChannelNotOpen(peer.clone()))?;
        channel
            .send(&message.to_json())
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    /// Send a message to every open channel. Returns how many sends succeeded.
    pub async fn broadcast(&self, message: &Message) -> usize {
        let text = message.to_json();
        let mut sent = 0;
        for (peer, conn) in &self.connections {
            if let Some(channel) = conn.open_channel() {
                match channel.send(&text).await {
                    Ok(()) => sent += 1,
                    Err(e) => warn!("Failed to broadcast {} to {}: {}", message.kind(), peer, e),
                }
            }
        }
        sent
    }

    /// Close every channel and fail pending connects.
    pub async fn close_all(&mut self) {
        for (peer, conn) in self.connections.drain() {
            if let Some(reader) = conn.reader {
                reader.abort();
            }
            if let Some(channel) = conn.channel {
                debug!("Closing channel {} to {}", channel.id(), peer);
                channel.close().await;
            }
        }
        self.processed.clear();
        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(SessionError::Closed));
            }
        }
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        for conn in self.connections.values() {
            if let Some(reader) = &conn.reader {
                reader.abort();
            }
        }
    }
}

/// Forward everything a channel receives until it closes.
async fn read_loop(
    peer: PeerIdentity,
    channel: Arc<dyn Channel>,
    event_tx: mpsc::UnboundedSender<RegistryEvent>,
) {
    let id = channel.id();
    let reason = loop {
        match channel.recv().await {
            Ok(text) => {
                let event = RegistryEvent::Message {
                    peer: peer.clone(),
                    channel: id,
                    text,
                };
                if event_tx.send(event).is_err() {
                    return;
                }
            }
            Err(TransportError::Closed) => {
                debug!("Channel {} to {} closed", id, peer);
                break DisconnectReason::RemoteClosed;
            }
            Err(e) => {
                warn!("Channel {} to {} failed: {}", id, peer, e);
                break DisconnectReason::NetworkError;
            }
        }
    };

    let _ = event_tx.send(RegistryEvent::Closed {
        peer,
        channel: id,
        reason,
    });
}
