//! WebSocket relay server.
//!
//! Plays the signaling role for sessions: each socket registers one address,
//! and channels between two addresses are multiplexed over their sockets.
//! A single hub task owns every table; sockets only forward frames to it.

use crate::protocol::{RejectReason, RelayFrame, WireChannel};
use anyhow::{Result, anyhow};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use huddle_core::PeerIdentity;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing::{debug, error, info, warn};

type ClientId = u64;
type WsWrite = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Event forwarded to the hub.
enum HubEvent {
    /// WebSocket upgrade finished
    Connected {
        addr: SocketAddr,
        ws: WebSocketStream<TcpStream>,
    },
    Frame {
        client: ClientId,
        frame: RelayFrame,
    },
    Closed {
        client: ClientId,
    },
}

/// One connected socket.
struct Client {
    addr: SocketAddr,
    identity: Option<PeerIdentity>,
    write: Arc<Mutex<WsWrite>>,
    read_task: JoinHandle<()>,
}

impl Client {
    async fn send(&self, frame: &RelayFrame) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(frame.to_text().into()))
            .await
            .map_err(|e| anyhow!("Failed to send frame: {}", e))
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

/// Both ends of a relayed channel.
#[derive(Debug, Clone, Copy)]
struct Route {
    opener: ClientId,
    acceptor: ClientId,
}

impl Route {
    fn other(&self, client: ClientId) -> Option<ClientId> {
        if client == self.opener {
            Some(self.acceptor)
        } else if client == self.acceptor {
            Some(self.opener)
        } else {
            None
        }
    }
}

pub struct RelayServer {
    clients: HashMap<ClientId, Client>,
    /// Registered address -> owning socket
    identities: HashMap<PeerIdentity, ClientId>,
    routes: HashMap<WireChannel, Route>,
    next_client_id: ClientId,
    next_channel: WireChannel,
    event_tx: mpsc::UnboundedSender<HubEvent>,
    event_rx: mpsc::UnboundedReceiver<HubEvent>,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayServer {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            clients: HashMap::new(),
            identities: HashMap::new(),
            routes: HashMap::new(),
            next_client_id: 1,
            next_channel: 1,
            event_tx,
            event_rx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept sockets and relay frames until the listener fails.
    pub async fn serve(mut self, listener: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.upgrade(stream, addr),
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }

                Some(event) = self.event_rx.recv() => {
                    self.on_event(event).await;
                }
            }
        }
    }

    /// Upgrade off the hub task so a slow handshake doesn't stall relaying.
    fn upgrade(&self, stream: TcpStream, addr: SocketAddr) {
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            match accept_async(stream).await {
                Ok(ws) => {
                    let _ = event_tx.send(HubEvent::Connected { addr, ws });
                }
                Err(e) => {
                    // Health checks connect and close without finishing the handshake.
                    let err_str = e.to_string();
                    if err_str.contains("Handshake not finished")
                        || err_str.contains("Connection reset")
                        || err_str.contains("unexpected EOF")
                    {
                        debug!("Connection closed before handshake from {}", addr);
                    } else {
                        error!("WebSocket upgrade failed for {}: {}", addr, e);
                    }
                }
            }
        });
    }

    async fn on_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Connected { addr, ws } => {
                let client = self.next_client_id;
                self.next_client_id += 1;
                info!("New connection from {} (client {})", addr, client);

                let (write, read) = ws.split();
                let read_task = tokio::spawn(read_loop(client, read, self.event_tx.clone()));
                self.clients.insert(
                    client,
                    Client {
                        addr,
                        identity: None,
                        write: Arc::new(Mutex::new(write)),
                        read_task,
                    },
                );
            }
            HubEvent::Frame { client, frame } => self.on_frame(client, frame).await,
            HubEvent::Closed { client } => self.on_closed(client).await,
        }
    }

    async fn on_frame(&mut self, client: ClientId, frame: RelayFrame) {
        match frame {
            RelayFrame::Register { id } => self.on_register(client, id).await,
            RelayFrame::Open { request, to } => self.on_open(client, request, to).await,
            RelayFrame::Data { channel, text } => {
                let Some(other) = self.routes.get(&channel).and_then(|r| r.other(client)) else {
                    debug!("Dropping data for unknown channel {} from client {}", channel, client);
                    return;
                };
                self.send_to(other, &RelayFrame::Data { channel, text }).await;
            }
            RelayFrame::Close { channel } => {
                let other = self.routes.get(&channel).and_then(|r| r.other(client));
                if let Some(other) = other {
                    self.routes.remove(&channel);
                    debug!("Channel {} closed by client {}", channel, client);
                    self.send_to(other, &RelayFrame::Close { channel }).await;
                }
            }
            other => {
                warn!("Unexpected frame from client {}: {:?}", client, other);
            }
        }
    }

    async fn on_register(&mut self, client: ClientId, id: PeerIdentity) {
        let already = self.clients.get(&client).and_then(|c| c.identity.clone());
        let reply = if let Some(existing) = already {
            warn!("Client {} is already registered as {}", client, existing);
            RelayFrame::Rejected {
                reason: RejectReason::AlreadyRegistered,
            }
        } else if self.identities.contains_key(&id) {
            info!("Address {} is taken; rejecting client {}", id, client);
            RelayFrame::Rejected {
                reason: RejectReason::AddressTaken,
            }
        } else {
            self.identities.insert(id.clone(), client);
            if let Some(c) = self.clients.get_mut(&client) {
                c.identity = Some(id.clone());
            }
            info!("Registered {} (client {})", id, client);
            RelayFrame::Registered { id }
        };
        self.send_to(client, &reply).await;
    }

    async fn on_open(&mut self, client: ClientId, request: u64, to: PeerIdentity) {
        let from = self.clients.get(&client).and_then(|c| c.identity.clone());
        let target = self.identities.get(&to).copied();

        let (from, target) = match (from, target) {
            (Some(from), Some(target)) => (from, target),
            (None, _) => {
                let reason = "not-registered".to_string();
                self.send_to(client, &RelayFrame::OpenFailed { request, reason }).await;
                return;
            }
            (_, None) => {
                debug!("Client {} opened unknown address {}", client, to);
                let reason = "peer-unavailable".to_string();
                self.send_to(client, &RelayFrame::OpenFailed { request, reason }).await;
                return;
            }
        };

        let channel = self.next_channel;
        self.next_channel += 1;
        self.routes.insert(
            channel,
            Route {
                opener: client,
                acceptor: target,
            },
        );
        debug!("Channel {}: {} -> {}", channel, from, to);

        // The acceptor must learn about the channel before any data can reach it.
        self.send_to(target, &RelayFrame::Incoming { channel, from }).await;
        self.send_to(client, &RelayFrame::Opened { request, channel }).await;
    }

    async fn on_closed(&mut self, client: ClientId) {
        let Some(gone) = self.clients.remove(&client) else {
            return;
        };
        match &gone.identity {
            Some(id) => {
                self.identities.remove(id);
                info!("Connection with {} closed ({})", id, gone.addr);
            }
            None => debug!("Unregistered client {} disconnected", client),
        }

        let orphaned: Vec<(WireChannel, ClientId)> = self
            .routes
            .iter()
            .filter_map(|(channel, route)| route.other(client).map(|other| (*channel, other)))
            .collect();
        for (channel, other) in orphaned {
            self.routes.remove(&channel);
            self.send_to(other, &RelayFrame::Close { channel }).await;
        }
    }

    async fn send_to(&self, client: ClientId, frame: &RelayFrame) {
        let Some(c) = self.clients.get(&client) else {
            return;
        };
        if let Err(e) = c.send(frame).await {
            warn!("Failed to send to client {}: {}", client, e);
        }
    }
}

/// Forward every frame from one socket to the hub until it closes.
async fn read_loop(
    client: ClientId,
    mut read: SplitStream<WebSocketStream<TcpStream>>,
    event_tx: mpsc::UnboundedSender<HubEvent>,
) {
    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                let text = match msg {
                    Message::Text(text) => text.to_string(),
                    Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Dropping non-UTF-8 frame from client {}", client);
                            continue;
                        }
                    },
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                    Message::Close(_) => {
                        debug!("Received close frame from client {}", client);
                        break;
                    }
                };

                match RelayFrame::from_text(&text) {
                    Some(frame) => {
                        if event_tx.send(HubEvent::Frame { client, frame }).is_err() {
                            return;
                        }
                    }
                    None => warn!("Dropping malformed frame from client {} ({} bytes)", client, text.len()),
                }
            }
            Some(Err(e)) => {
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        debug!("Client {} closed", client);
                    }
                    _ => {
                        error!("WebSocket error on client {}: {}", client, e);
                    }
                }
                break;
            }
            None => {
                debug!("Client {} stream ended", client);
                break;
            }
        }
    }

    let _ = event_tx.send(HubEvent::Closed { client });
}
