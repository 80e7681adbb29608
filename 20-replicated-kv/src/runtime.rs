//! Worker task that drives a [`Node`] over a real transport.
//!
//! One tokio task owns the node, so protocol state needs no locks. It waits
//! on three sources with `select!`:
//!
//! - **Client requests** from [`NodeHandle`]s
//! - **Inbound messages** from the transport's [`Inbox`]
//! - **Ticks** every `tick_interval`, which drive every timeout
//!
//! After each event the worker drains [`Node::poll_ready`]: messages go to the
//! transport and events answer waiting clients.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::PeerId;
use crate::config::NodeConfig;
use crate::error::KvError;
use crate::message::{GossipId, TxnId};
use crate::node::{Consistency, Node, NodeEvent, NodeStatus, Proposal, ReadOutcome};
use crate::transport::{Inbox, Transport};

type Reply<T> = oneshot::Sender<Result<T, KvError>>;

/// Client handle to a running node. Cheap to clone.
#[derive(Clone)]
pub struct NodeHandle {
    id: PeerId,
    request_tx: mpsc::UnboundedSender<ClientRequest>,
}

impl NodeHandle {
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Stores `value` under `key`.
    ///
    /// Strong writes resolve once the transaction is decided; eventual
    /// writes resolve as soon as they are applied locally.
    pub async fn put(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
        consistency: Consistency,
    ) -> Result<(), KvError> {
        let key = key.into();
        let value = Some(value.into());
        self.request(|respond_to| ClientRequest::Write {
            key,
            value,
            consistency,
            respond_to,
        })
        .await
    }

    /// Deletes `key`, replicated the same way as a put.
    pub async fn delete(&self, key: impl Into<String>, consistency: Consistency) -> Result<(), KvError> {
        let key = key.into();
        self.request(|respond_to| ClientRequest::Write {
            key,
            value: None,
            consistency,
            respond_to,
        })
        .await
    }

    pub async fn get(&self, key: impl Into<String>, consistency: Consistency) -> Result<Option<String>, KvError> {
        let key = key.into();
        self.request(|respond_to| ClientRequest::Read {
            key,
            consistency,
            respond_to,
        })
        .await
    }

    /// Live keys in this replica's local store.
    pub async fn get_all_keys(&self) -> Result<Vec<String>, KvError> {
        self.request(|respond_to| ClientRequest::Keys { respond_to }).await
    }

    pub async fn status(&self) -> Result<NodeStatus, KvError> {
        self.request(|respond_to| ClientRequest::Status { respond_to }).await
    }

    /// Starts an election from this node.
    pub async fn campaign(&self) -> Result<(), KvError> {
        self.request(|respond_to| ClientRequest::Campaign { respond_to }).await
    }

    /// Gossips a free-text note to the cluster.
    pub async fn announce(&self, text: impl Into<String>) -> Result<GossipId, KvError> {
        let text = text.into();
        self.request(|respond_to| ClientRequest::Announce { text, respond_to })
            .await
    }

    /// Fraction of the cluster known to have received gossip `message_id`.
    pub async fn gossip_coverage(&self, message_id: GossipId) -> Result<f64, KvError> {
        self.request(|respond_to| ClientRequest::Coverage {
            message_id,
            respond_to,
        })
        .await
    }

    /// Stops the worker. Pending requests fail with [`KvError::Shutdown`].
    pub fn shutdown(&self) {
        let _ = self.request_tx.send(ClientRequest::Shutdown);
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> ClientRequest) -> Result<T, KvError> {
        let (respond_to, response) = oneshot::channel();
        self.request_tx
            .send(build(respond_to))
            .map_err(|_| KvError::Shutdown)?;
        response.await.map_err(|_| KvError::Shutdown)?
    }
}

enum ClientRequest {
    Write {
        key: String,
        value: Option<String>,
        consistency: Consistency,
        respond_to: Reply<()>,
    },
    Read {
        key: String,
        consistency: Consistency,
        respond_to: Reply<Option<String>>,
    },
    Keys {
        respond_to: Reply<Vec<String>>,
    },
    Status {
        respond_to: Reply<NodeStatus>,
    },
    Campaign {
        respond_to: Reply<()>,
    },
    Announce {
        text: String,
        respond_to: Reply<GossipId>,
    },
    Coverage {
        message_id: GossipId,
        respond_to: Reply<f64>,
    },
    Shutdown,
}

/// Starts a node on `transport` and returns a handle to it.
///
/// Must be called from within a tokio runtime.
pub fn spawn_node<T: Transport>(config: &NodeConfig, transport: T, inbox: Inbox) -> Result<NodeHandle> {
    let cluster = config.cluster_view()?;
    let node = Node::new(cluster, &config.tuning, Instant::now());
    let (request_tx, request_rx) = mpsc::unbounded_channel();

    let worker = Worker {
        node,
        transport,
        inbox,
        requests: request_rx,
        tick_interval: config.tuning.tick_interval,
        pending_writes: HashMap::new(),
        pending_reads: HashMap::new(),
    };
    tokio::spawn(worker.run());
    info!(node = config.id, peers = config.peers.len(), "node started");

    Ok(NodeHandle {
        id: config.id,
        request_tx,
    })
}

struct Worker<T> {
    node: Node,
    transport: T,
    inbox: Inbox,
    requests: mpsc::UnboundedReceiver<ClientRequest>,
    tick_interval: Duration,
    pending_writes: HashMap<TxnId, Reply<()>>,
    pending_reads: HashMap<Uuid, Reply<Option<String>>>,
}

impl<T: Transport> Worker<T> {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if !self.handle_request(request) {
                            break;
                        }
                    }
                    None => break,
                },
                message = self.inbox.recv() => match message {
                    Some(message) => self.node.step(message, Instant::now()),
                    None => {
                        warn!(node = self.node.id(), "inbox closed");
                        break;
                    }
                },
                _ = ticker.tick() => self.node.tick(Instant::now()),
            }
            self.process_ready();
        }
        info!(node = self.node.id(), "node stopped");
    }

    /// Returns `false` once shutdown is requested.
    fn handle_request(&mut self, request: ClientRequest) -> bool {
        let now = Instant::now();
        match request {
            ClientRequest::Write {
                key,
                value,
                consistency,
                respond_to,
            } => match self.node.propose_write(key, value, consistency, now) {
                Ok(Proposal::Applied) => {
                    let _ = respond_to.send(Ok(()));
                }
                Ok(Proposal::Pending(txn_id)) => {
                    self.pending_writes.insert(txn_id, respond_to);
                }
                Err(err) => {
                    debug!(node = self.node.id(), error = %err, "write rejected");
                    let _ = respond_to.send(Err(err));
                }
            },
            ClientRequest::Read {
                key,
                consistency,
                respond_to,
            } => match self.node.start_read(&key, consistency, now) {
                ReadOutcome::Ready(value) => {
                    let _ = respond_to.send(Ok(value));
                }
                ReadOutcome::Pending(request_id) => {
                    self.pending_reads.insert(request_id, respond_to);
                }
            },
            ClientRequest::Keys { respond_to } => {
                let _ = respond_to.send(Ok(self.node.get_all_keys()));
            }
            ClientRequest::Status { respond_to } => {
                let _ = respond_to.send(Ok(self.node.status()));
            }
            ClientRequest::Campaign { respond_to } => {
                self.node.campaign(now);
                let _ = respond_to.send(Ok(()));
            }
            ClientRequest::Announce { text, respond_to } => {
                let _ = respond_to.send(Ok(self.node.announce(text, now)));
            }
            ClientRequest::Coverage {
                message_id,
                respond_to,
            } => {
                let _ = respond_to.send(Ok(self.node.gossip_coverage(message_id)));
            }
            ClientRequest::Shutdown => return false,
        }
        true
    }

    fn process_ready(&mut self) {
        while let Some(bundle) = self.node.poll_ready() {
            for message in bundle.messages {
                let to = message.to;
                if !self.transport.send(message) {
                    debug!(node = self.node.id(), to, "transport refused message");
                }
            }
            for payload in bundle.broadcasts {
                self.transport.broadcast(self.node.id(), payload);
            }
            for event in bundle.events {
                self.handle_event(event);
            }
        }
    }

    fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Decided { txn_id, committed } => {
                if let Some(respond_to) = self.pending_writes.remove(&txn_id) {
                    let result = if committed {
                        Ok(())
                    } else {
                        Err(KvError::Aborted { txn_id })
                    };
                    let _ = respond_to.send(result);
                }
            }
            NodeEvent::ReadCompleted { request_id, value } => {
                if let Some(respond_to) = self.pending_reads.remove(&request_id) {
                    let _ = respond_to.send(Ok(value));
                }
            }
            NodeEvent::LeaderChanged { leader } => {
                debug!(node = self.node.id(), leader = ?leader, "leadership update");
            }
            NodeEvent::PeerSuspected { peer } | NodeEvent::PeerRecovered { peer } => {
                debug!(node = self.node.id(), peer, "membership update");
            }
        }
    }
}
