//! In-memory signaling and channel transport.
//!
//! A shared [`MemoryNetwork`] broker routes channels between endpoints in the
//! same process. Besides plain delivery it can simulate the failures the
//! session layer has to survive: an unreachable signaling service, peers whose
//! channels never finish opening, and links that silently drop traffic.

use crate::identity::PeerIdentity;
use crate::transport::{
    Channel, ChannelId, ChannelTransport, Result, Signaling, SignalingError, TransportError,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::debug;

enum Frame {
    Data(String),
    Close,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<PeerIdentity, mpsc::UnboundedSender<Arc<dyn Channel>>>,
    channels: HashMap<PeerIdentity, Vec<Weak<MemoryChannel>>>,
    signaling_down: bool,
    unresponsive: HashSet<PeerIdentity>,
    muted: HashSet<(PeerIdentity, PeerIdentity)>,
}

/// Shared broker connecting [`MemoryTransport`] endpoints.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every subsequent `claim` fail with `SignalingError::Unavailable`.
    pub fn set_signaling_available(&self, available: bool) {
        self.lock().signaling_down = !available;
    }

    /// Channels opened towards `id` never finish opening while set.
    pub fn set_unresponsive(&self, id: &PeerIdentity, unresponsive: bool) {
        let mut state = self.lock();
        if unresponsive {
            state.unresponsive.insert(id.clone());
        } else {
            state.unresponsive.remove(id);
        }
    }

    /// Silently drop messages sent from `from` to `to` while set. Channels stay open.
    pub fn set_muted(&self, from: &PeerIdentity, to: &PeerIdentity, muted: bool) {
        let key = (from.clone(), to.clone());
        let mut state = self.lock();
        if muted {
            state.muted.insert(key);
        } else {
            state.muted.remove(&key);
        }
    }

    pub fn is_registered(&self, id: &PeerIdentity) -> bool {
        self.lock().endpoints.contains_key(id)
    }

    /// Close every open channel between `a` and `b`, as if the link failed.
    pub fn sever(&self, a: &PeerIdentity, b: &PeerIdentity) {
        let doomed: Vec<Arc<MemoryChannel>> = self
            .lock()
            .channels
            .get(a)
            .into_iter()
            .flatten()
            .filter_map(Weak::upgrade)
            .filter(|c| &c.remote == b)
            .collect();
        for channel in doomed {
            channel.close_now();
        }
    }

    fn is_muted(&self, from: &PeerIdentity, to: &PeerIdentity) -> bool {
        self.lock().muted.contains(&(from.clone(), to.clone()))
    }

    fn track(&self, channel: &Arc<MemoryChannel>) {
        let mut state = self.lock();
        let list = state.channels.entry(channel.local.clone()).or_default();
        list.retain(|c| c.strong_count() > 0);
        list.push(Arc::downgrade(channel));
    }
}

#[async_trait]
impl Signaling for MemoryNetwork {
    async fn claim(
        &self,
        identity: &PeerIdentity,
    ) -> std::result::Result<Arc<dyn ChannelTransport>, SignalingError> {
        let mut state = self.lock();
        if state.signaling_down {
            return Err(SignalingError::Unavailable("memory network is down".into()));
        }
        if state.endpoints.contains_key(identity) {
            return Err(SignalingError::AddressTaken(identity.clone()));
        }
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        state.endpoints.insert(identity.clone(), accept_tx);
        debug!("Registered {} on memory network", identity);

        Ok(Arc::new(MemoryTransport {
            local: identity.clone(),
            network: self.clone(),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        }))
    }
}

/// One endpoint on a [`MemoryNetwork`].
pub struct MemoryTransport {
    local: PeerIdentity,
    network: MemoryNetwork,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<dyn Channel>>>,
}

#[async_trait]
impl ChannelTransport for MemoryTransport {
    fn local_id(&self) -> &PeerIdentity {
        &self.local
    }

    async fn open(&self, remote: &PeerIdentity) -> Result<Arc<dyn Channel>> {
        let (accept_tx, unresponsive) = {
            let state = self.network.lock();
            let accept_tx = state
                .endpoints
                .get(remote)
                .cloned()
                .ok_or_else(|| TransportError::PeerNotFound(remote.to_string()))?;
            (accept_tx, state.unresponsive.contains(remote))
        };

        if unresponsive {
            std::future::pending::<()>().await;
        }

        let (local_end, remote_end) = MemoryChannel::pair(&self.local, remote, &self.network);
        self.network.track(&local_end);
        self.network.track(&remote_end);

        accept_tx
            .send(remote_end)
            .map_err(|_| TransportError::ConnectionFailed(format!("{remote} is not accepting")))?;
        Ok(local_end)
    }

    async fn accept(&self) -> Option<Arc<dyn Channel>> {
        self.accept_rx.lock().await.recv().await
    }

    async fn shutdown(&self) {
        let channels = {
            let mut state = self.network.lock();
            state.endpoints.remove(&self.local);
            state.channels.remove(&self.local).unwrap_or_default()
        };
        for channel in channels.iter().filter_map(Weak::upgrade) {
            channel.close_now();
        }
        self.accept_rx.lock().await.close();
        debug!("Released {} from memory network", self.local);
    }
}

/// One end of an in-memory channel.
struct MemoryChannel {
    id: ChannelId,
    local: PeerIdentity,
    remote: PeerIdentity,
    /// Shared by both ends.
    open: Arc<AtomicBool>,
    peer_inbox: mpsc::UnboundedSender<Frame>,
    own_inbox: mpsc::UnboundedSender<Frame>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
    network: MemoryNetwork,
}

impl MemoryChannel {
    fn pair(
        a: &PeerIdentity,
        b: &PeerIdentity,
        network: &MemoryNetwork,
    ) -> (Arc<MemoryChannel>, Arc<MemoryChannel>) {
        let open = Arc::new(AtomicBool::new(true));
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let a_end = Arc::new(MemoryChannel {
            id: ChannelId::next(),
            local: a.clone(),
            remote: b.clone(),
            open: open.clone(),
            peer_inbox: b_tx.clone(),
            own_inbox: a_tx.clone(),
            inbox: tokio::sync::Mutex::new(a_rx),
            network: network.clone(),
        });
        let b_end = Arc::new(MemoryChannel {
            id: ChannelId::next(),
            local: b.clone(),
            remote: a.clone(),
            open,
            peer_inbox: a_tx,
            own_inbox: b_tx,
            inbox: tokio::sync::Mutex::new(b_rx),
            network: network.clone(),
        });
        (a_end, b_end)
    }

    fn close_now(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.peer_inbox.send(Frame::Close);
            let _ = self.own_inbox.send(Frame::Close);
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn remote(&self) -> &PeerIdentity {
        &self.remote
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        if self.network.is_muted(&self.local, &self.remote) {
            return Ok(());
        }
        self.peer_inbox
            .send(Frame::Data(text.to_string()))
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<String> {
        let mut inbox = self.inbox.lock().await;
        match inbox.recv().await {
            Some(Frame::Data(text)) => Ok(text),
            Some(Frame::Close) | None => {
                // Keep reporting closed on later calls.
                let _ = self.own_inbox.send(Frame::Close);
                Err(TransportError::Closed)
            }
        }
    }

    async fn close(&self) {
        self.close_now();
    }
}
