//! Relay client: the session transport traits over one WebSocket per endpoint.
//!
//! [`RelaySignaling::claim`] connects and registers an address. The resulting
//! [`RelayTransport`] opens and accepts channels, all multiplexed over that
//! socket. A writer task owns the sink; a reader task dispatches inbound
//! frames to pending opens, the accept queue and per-channel inboxes.

use crate::protocol::{RejectReason, RelayFrame, WireChannel};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use huddle_core::PeerIdentity;
use huddle_core::transport::{
    Channel, ChannelId, ChannelTransport, Result, Signaling, SignalingError, TransportError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Instruction for the writer task.
enum Outgoing {
    Frame(RelayFrame),
    /// Send a close frame and stop.
    Shutdown,
}

/// Signaling through a relay server at `url` (e.g. `ws://127.0.0.1:8080`).
#[derive(Debug, Clone)]
pub struct RelaySignaling {
    url: String,
}

impl RelaySignaling {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Signaling for RelaySignaling {
    async fn claim(
        &self,
        identity: &PeerIdentity,
    ) -> std::result::Result<Arc<dyn ChannelTransport>, SignalingError> {
        let (ws, _) = connect_async(&self.url)
            .await
            .map_err(|e| SignalingError::Unavailable(format!("{}: {}", self.url, e)))?;
        let (mut write, mut read) = ws.split();

        let register = RelayFrame::Register {
            id: identity.clone(),
        };
        write
            .send(Message::Text(register.to_text().into()))
            .await
            .map_err(|e| SignalingError::Unavailable(e.to_string()))?;

        match next_frame(&mut read).await {
            Some(RelayFrame::Registered { .. }) => {
                info!("Registered {} with relay {}", identity, self.url);
                Ok(RelayTransport::start(identity.clone(), write, read))
            }
            Some(RelayFrame::Rejected {
                reason: RejectReason::AddressTaken,
            }) => Err(SignalingError::AddressTaken(identity.clone())),
            Some(other) => Err(SignalingError::Other(format!(
                "unexpected reply to register: {other:?}"
            ))),
            None => Err(SignalingError::Unavailable(
                "relay closed the connection during registration".into(),
            )),
        }
    }
}

/// Next relay frame on the socket, skipping anything that isn't one.
async fn next_frame(read: &mut SplitStream<WsStream>) -> Option<RelayFrame> {
    while let Some(msg) = read.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(data)) => String::from_utf8_lossy(&data).into_owned(),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        };
        match RelayFrame::from_text(&text) {
            Some(frame) => return Some(frame),
            None => warn!("Dropping malformed relay frame ({} bytes)", text.len()),
        }
    }
    None
}

type PendingOpen = oneshot::Sender<Result<Arc<RelayChannel>>>;

/// State shared between the transport, its channels and the reader task.
#[derive(Default)]
struct Shared {
    pending: HashMap<u64, (PeerIdentity, PendingOpen)>,
    inboxes: HashMap<WireChannel, mpsc::UnboundedSender<String>>,
    /// Set once the socket is gone
    closed: bool,
}

struct Link {
    local: PeerIdentity,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    shared: Mutex<Shared>,
}

impl Link {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, frame: RelayFrame) -> Result<()> {
        self.outgoing
            .send(Outgoing::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    fn new_channel(self: &Arc<Self>, wire: WireChannel, remote: PeerIdentity) -> Arc<RelayChannel> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        self.lock().inboxes.insert(wire, inbox_tx);
        Arc::new(RelayChannel {
            id: ChannelId::next(),
            wire,
            remote,
            open: AtomicBool::new(true),
            inbox: tokio::sync::Mutex::new(inbox_rx),
            link: self.clone(),
        })
    }

    /// Record an open awaiting the relay's answer.
    ///
    /// The entry lives as long as the returned guard, so an opener that gives
    /// up does not leave it behind.
    fn begin_open(
        &self,
        request: u64,
        remote: &PeerIdentity,
    ) -> Result<(PendingOpenGuard<'_>, oneshot::Receiver<Result<Arc<RelayChannel>>>)> {
        let (tx, rx) = oneshot::channel();
        let mut shared = self.lock();
        if shared.closed {
            return Err(TransportError::Closed);
        }
        shared.pending.insert(request, (remote.clone(), tx));
        Ok((PendingOpenGuard { link: self, request }, rx))
    }

    /// Drop every inbox and fail every pending open.
    fn close_all(&self) {
        let mut shared = self.lock();
        shared.closed = true;
        shared.inboxes.clear();
        for (_, (to, pending)) in shared.pending.drain() {
            let _ = pending.send(Err(TransportError::ConnectionFailed(format!(
                "relay connection lost while opening {to}"
            ))));
        }
    }
}

struct PendingOpenGuard<'a> {
    link: &'a Link,
    request: u64,
}

impl Drop for PendingOpenGuard<'_> {
    fn drop(&mut self) {
        self.link.lock().pending.remove(&self.request);
    }
}

/// An endpoint registered on a relay.
pub struct RelayTransport {
    link: Arc<Link>,
    next_request: AtomicU64,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<dyn Channel>>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl RelayTransport {
    fn start(
        local: PeerIdentity,
        write: SplitSink<WsStream, Message>,
        read: SplitStream<WsStream>,
    ) -> Arc<dyn ChannelTransport> {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Link {
            local,
            outgoing,
            shared: Mutex::new(Shared::default()),
        });

        let writer = tokio::spawn(write_loop(write, outgoing_rx));
        let reader = tokio::spawn(read_loop(read, link.clone(), accept_tx));

        Arc::new(Self {
            link,
            next_request: AtomicU64::new(1),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            writer,
            reader,
        })
    }
}

#[async_trait]
impl ChannelTransport for RelayTransport {
    fn local_id(&self) -> &PeerIdentity {
        &self.link.local
    }

    async fn open(&self, remote: &PeerIdentity) -> Result<Arc<dyn Channel>> {
        let request = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (_guard, rx) = self.link.begin_open(request, remote)?;

        self.link.send(RelayFrame::Open {
            request,
            to: remote.clone(),
        })?;

        match rx.await {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Closed),
        }
    }

    async fn accept(&self) -> Option<Arc<dyn Channel>> {
        self.accept_rx.lock().await.recv().await
    }

    async fn shutdown(&self) {
        debug!("Releasing {} from relay", self.link.local);
        let _ = self.link.outgoing.send(Outgoing::Shutdown);
        self.link.close_all();
        self.accept_rx.lock().await.close();
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(outgoing) = outgoing_rx.recv().await {
        match outgoing {
            Outgoing::Frame(frame) => {
                if let Err(e) = write.send(Message::Text(frame.to_text().into())).await {
                    warn!("Failed to send to relay: {}", e);
                    break;
                }
            }
            Outgoing::Shutdown => {
                let _ = write.send(Message::Close(None)).await;
                let _ = write.close().await;
                break;
            }
        }
    }
}

async fn read_loop(
    mut read: SplitStream<WsStream>,
    link: Arc<Link>,
    accept_tx: mpsc::UnboundedSender<Arc<dyn Channel>>,
) {
    while let Some(frame) = next_frame(&mut read).await {
        match frame {
            RelayFrame::Opened { request, channel } => {
                let Some((remote, pending)) = link.lock().pending.remove(&request) else {
                    continue;
                };
                let opened = link.new_channel(channel, remote);
                if let Err(Ok(opened)) = pending.send(Ok(opened)) {
                    // The opener gave up waiting.
                    debug!("Nobody waiting for channel {}; closing it", channel);
                    opened.close_now();
                }
            }
            RelayFrame::OpenFailed { request, reason } => {
                if let Some((remote, pending)) = link.lock().pending.remove(&request) {
                    let error = match reason.as_str() {
                        "peer-unavailable" => TransportError::PeerNotFound(remote.to_string()),
                        _ => TransportError::ConnectionFailed(reason),
                    };
                    let _ = pending.send(Err(error));
                }
            }
            RelayFrame::Incoming { channel, from } => {
                debug!("Incoming channel {} from {}", channel, from);
                let incoming = link.new_channel(channel, from);
                if accept_tx.send(incoming.clone()).is_err() {
                    incoming.close_now();
                }
            }
            RelayFrame::Data { channel, text } => {
                let inbox = link.lock().inboxes.get(&channel).cloned();
                match inbox {
                    Some(inbox) => {
                        let _ = inbox.send(text);
                    }
                    None => debug!("Dropping data for unknown channel {}", channel),
                }
            }
            RelayFrame::Close { channel } => {
                debug!("Relay closed channel {}", channel);
                link.lock().inboxes.remove(&channel);
            }
            other => warn!("Unexpected frame from relay: {:?}", other),
        }
    }

    info!("Relay connection for {} closed", link.local);
    link.close_all();
}

/// One channel multiplexed over the relay socket.
struct RelayChannel {
    id: ChannelId,
    wire: WireChannel,
    remote: PeerIdentity,
    open: AtomicBool,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
    link: Arc<Link>,
}

impl RelayChannel {
    fn close_now(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.link.lock().inboxes.remove(&self.wire);
            let _ = self.link.send(RelayFrame::Close { channel: self.wire });
        }
    }
}

#[async_trait]
impl Channel for RelayChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn remote(&self) -> &PeerIdentity {
        &self.remote
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.link.lock().inboxes.contains_key(&self.wire)
    }

    async fn send(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.link.send(RelayFrame::Data {
            channel: self.wire,
            text: text.to_string(),
        })
    }

    async fn recv(&self) -> Result<String> {
        // The inbox ends once the channel is closed from either side.
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    async fn close(&self) {
        self.close_now();
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        self.close_now();
    }
}
