//! Message transports.
//!
//! The protocols assume an unreliable network: messages may be lost,
//! duplicated, or reordered, and `send` only reports whether a message was
//! handed off. Two implementations are provided:
//!
//! - [`MemoryNetwork`]: in-process channels with crash, partition, loss and
//!   duplication injection, for tests.
//! - [`TcpTransport`]: one persistent outbound connection per peer and an
//!   accept loop, carrying newline-delimited JSON.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cluster::PeerId;
use crate::config::NodeConfig;
use crate::message::{Message, Payload, read_message, write_message};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Outbound half of a transport.
pub trait Transport: Send + Sync + 'static {
    /// Hands `message` to the network. `false` means it was refused outright
    /// (unknown peer, closed transport); `true` does not promise delivery.
    fn send(&self, message: Message) -> bool;

    /// Every peer this transport can address, including the local one.
    fn peers(&self) -> Vec<PeerId>;

    /// Sends `payload` to every peer except `from`. Returns how many were handed off.
    fn broadcast(&self, from: PeerId, payload: Payload) -> usize {
        self.peers()
            .into_iter()
            .filter(|peer| *peer != from)
            .filter(|peer| self.send(Message::new(from, *peer, payload.clone())))
            .count()
    }
}

/// Inbound half of a transport.
pub struct Inbox {
    rx: UnboundedReceiver<Message>,
}

impl Inbox {
    fn new(rx: UnboundedReceiver<Message>) -> Self {
        Self { rx }
    }

    /// Waits for the next message. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Waits at most `timeout` for the next message.
    pub async fn receive(&mut self, timeout: Duration) -> Option<Message> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }
}

#[derive(Default)]
struct NetworkState {
    inboxes: BTreeMap<PeerId, UnboundedSender<Message>>,
    crashed: BTreeSet<PeerId>,
    /// Peers on one side of a partition; traffic across the cut is lost.
    partition: Option<BTreeSet<PeerId>>,
    drop_rate: f64,
    duplicate_rate: f64,
}

/// In-process network shared by every node of a test cluster.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches `id`, replacing any previous inbox it had.
    pub fn join(&self, id: PeerId) -> (MemoryTransport, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.inboxes.insert(id, tx);
        state.crashed.remove(&id);
        (
            MemoryTransport {
                id,
                network: self.clone(),
            },
            Inbox::new(rx),
        )
    }

    /// Silences `id` in both directions.
    pub fn crash(&self, id: PeerId) {
        info!(peer = id, "network: crash");
        self.lock().crashed.insert(id);
    }

    pub fn restore(&self, id: PeerId) {
        info!(peer = id, "network: restore");
        self.lock().crashed.remove(&id);
    }

    /// Cuts `side` off from everyone else.
    pub fn partition(&self, side: impl IntoIterator<Item = PeerId>) {
        let side: BTreeSet<PeerId> = side.into_iter().collect();
        info!(side = ?side, "network: partition");
        self.lock().partition = Some(side);
    }

    pub fn heal(&self) {
        info!("network: heal");
        self.lock().partition = None;
    }

    pub fn set_drop_rate(&self, rate: f64) {
        self.lock().drop_rate = rate.clamp(0.0, 1.0);
    }

    pub fn set_duplicate_rate(&self, rate: f64) {
        self.lock().duplicate_rate = rate.clamp(0.0, 1.0);
    }

    fn deliver(&self, message: Message) -> bool {
        let state = self.lock();
        let Some(inbox) = state.inboxes.get(&message.to) else {
            return false;
        };
        if state.crashed.contains(&message.from) {
            return false;
        }
        if state.crashed.contains(&message.to) {
            return true;
        }
        if let Some(side) = &state.partition {
            if side.contains(&message.from) != side.contains(&message.to) {
                return true;
            }
        }

        let mut rng = rand::thread_rng();
        if state.drop_rate > 0.0 && rng.gen_bool(state.drop_rate) {
            debug!(from = message.from, to = message.to, kind = message.payload.kind(), "network: dropped");
            return true;
        }
        if state.duplicate_rate > 0.0 && rng.gen_bool(state.duplicate_rate) {
            let _ = inbox.send(message.clone());
        }
        inbox.send(message).is_ok()
    }

    fn ids(&self) -> Vec<PeerId> {
        self.lock().inboxes.keys().copied().collect()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct MemoryTransport {
    id: PeerId,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn id(&self) -> PeerId {
        self.id
    }
}

impl Transport for MemoryTransport {
    fn send(&self, message: Message) -> bool {
        self.network.deliver(message)
    }

    fn peers(&self) -> Vec<PeerId> {
        self.network.ids()
    }
}

/// TCP transport with newline-delimited JSON framing.
///
/// Each peer gets a writer task that owns one connection, reconnecting on
/// demand. Messages queued while a peer is unreachable are dropped.
pub struct TcpTransport {
    local: PeerId,
    writers: BTreeMap<PeerId, UnboundedSender<Message>>,
    acceptor: JoinHandle<()>,
}

impl TcpTransport {
    /// Binds `config.listen_addr` and starts the accept loop and per-peer writers.
    pub async fn bind(config: &NodeConfig) -> Result<(Self, Inbox, SocketAddr)> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.listen_addr))?;
        let addr = listener.local_addr().context("failed to read bound address")?;
        info!(node = config.id, %addr, "listening for peers");

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let acceptor = tokio::spawn(accept_loop(listener, config.id, inbox_tx));

        let writers = config
            .peers
            .iter()
            .filter(|(id, _)| **id != config.id)
            .map(|(id, peer_addr)| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(peer_writer(*id, peer_addr.clone(), rx));
                (*id, tx)
            })
            .collect();

        Ok((
            Self {
                local: config.id,
                writers,
                acceptor,
            },
            Inbox::new(inbox_rx),
            addr,
        ))
    }
}

impl Transport for TcpTransport {
    fn send(&self, message: Message) -> bool {
        match self.writers.get(&message.to) {
            Some(writer) => writer.send(message).is_ok(),
            None => {
                warn!(to = message.to, "no route to peer");
                false
            }
        }
    }

    fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.writers.keys().copied().collect();
        peers.push(self.local);
        peers.sort_unstable();
        peers
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn accept_loop(listener: TcpListener, local: PeerId, inbox: UnboundedSender<Message>) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let inbox = inbox.clone();
                tokio::spawn(async move {
                    if let Err(err) = read_peer(stream, local, inbox).await {
                        warn!(remote = %remote, error = ?err, "peer connection closed with error");
                    }
                });
            }
            Err(err) => warn!(error = ?err, "failed to accept connection"),
        }
    }
}

async fn read_peer(stream: TcpStream, local: PeerId, inbox: UnboundedSender<Message>) -> Result<()> {
    let mut reader = BufReader::new(stream);
    while let Some(message) = read_message::<_, Message>(&mut reader).await? {
        if message.to != local {
            warn!(to = message.to, from = message.from, "message for another node");
            continue;
        }
        if inbox.send(message).is_err() {
            // Node stopped.
            break;
        }
    }
    Ok(())
}

async fn peer_writer(peer: PeerId, addr: String, mut rx: UnboundedReceiver<Message>) {
    let mut connection: Option<BufWriter<TcpStream>> = None;
    while let Some(message) = rx.recv().await {
        if connection.is_none() {
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => {
                    debug!(peer, %addr, "connected");
                    connection = Some(BufWriter::new(stream));
                }
                Ok(Err(err)) => {
                    debug!(peer, error = ?err, kind = message.payload.kind(), "peer unreachable, dropping message");
                    continue;
                }
                Err(_) => {
                    debug!(peer, "connect timed out, dropping message");
                    continue;
                }
            }
        }
        if let Some(stream) = connection.as_mut() {
            if let Err(err) = write_message(stream, &message).await {
                warn!(peer, error = ?err, "send failed, will reconnect");
                connection = None;
            }
        }
    }
}
