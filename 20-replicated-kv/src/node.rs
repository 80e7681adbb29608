//! One replica: every protocol component wired to a key-value store.
//!
//! [`Node`] is sans-IO. It never touches a socket or a clock on its own; the
//! caller feeds it inbound messages through [`Node::step`], advances time
//! through [`Node::tick`], and collects what it wants sent through
//! [`Node::poll_ready`]. The runtime drives it from a tokio task and the tests
//! drive it from a hand-cranked simulated network.
//!
//! Messages a node addresses to itself (its own vote as a 2PC participant,
//! its own recovery report) go through an internal loopback queue that is
//! drained iteratively, so no chain of messages ever recurses.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cluster::{ClusterView, Peer, PeerId};
use crate::commit::{Coordinator, Decision, Participant};
use crate::config::Tuning;
use crate::detector::FailureDetector;
use crate::election::{BullyElection, ElectionPhase};
use crate::error::KvError;
use crate::gossip::Gossip;
use crate::message::{
    GossipBody, GossipId, Message, Payload, TxnId, Version, Versioned, WriteOp, now_millis,
};
use crate::store::KvStore;

/// How a read or write is replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consistency {
    /// Writes go through two-phase commit on the leader; reads poll every
    /// reachable replica.
    Strong,
    /// Writes apply locally and spread by gossip; reads are local.
    #[default]
    Eventual,
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Consistency::Strong => write!(f, "strong"),
            Consistency::Eventual => write!(f, "eventual"),
        }
    }
}

impl FromStr for Consistency {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "strong" | "s" => Ok(Consistency::Strong),
            "eventual" | "e" => Ok(Consistency::Eventual),
            other => bail!("unknown consistency '{other}' (expected strong or eventual)"),
        }
    }
}

/// Things the owner of a node may want to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A transaction this node coordinates reached a decision.
    Decided { txn_id: TxnId, committed: bool },
    /// A strong read finished, by full reply set or by timeout.
    ReadCompleted {
        request_id: Uuid,
        value: Option<String>,
    },
    LeaderChanged { leader: Option<PeerId> },
    PeerSuspected { peer: PeerId },
    PeerRecovered { peer: PeerId },
}

/// Outcome of submitting a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proposal {
    /// Applied locally and handed to gossip.
    Applied,
    /// Waiting on a two-phase commit; see [`NodeEvent::Decided`].
    Pending(TxnId),
}

/// Outcome of submitting a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Ready(Option<String>),
    /// Waiting on replicas; see [`NodeEvent::ReadCompleted`].
    Pending(Uuid),
}

/// Work produced by the node since the last poll.
///
/// `broadcasts` go to every other peer; the transport decides how.
#[derive(Debug, Default)]
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub broadcasts: Vec<Payload>,
    pub events: Vec<NodeEvent>,
}

impl ReadyBundle {
    fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.broadcasts.is_empty() && self.events.is_empty()
    }
}

/// Operator view of a node, as printed by the `STATUS` command.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node_id: PeerId,
    pub phase: ElectionPhase,
    pub leader: Option<PeerId>,
    pub peers: Vec<Peer>,
    pub in_flight: Vec<TxnId>,
    pub in_doubt: Vec<TxnId>,
    pub store: BTreeMap<String, String>,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let leader = self
            .leader
            .map_or_else(|| "none".to_string(), |id| id.to_string());
        writeln!(f, "node {} | {} | leader {}", self.node_id, self.phase, leader)?;
        let peers: Vec<String> = self
            .peers
            .iter()
            .map(|peer| format!("{}={}", peer.id, peer.state))
            .collect();
        writeln!(f, "peers: {}", peers.join(" "))?;
        writeln!(
            f,
            "transactions: {} coordinating, {} in doubt",
            self.in_flight.len(),
            self.in_doubt.len()
        )?;
        if self.store.is_empty() {
            write!(f, "store: (empty)")
        } else {
            let entries: Vec<String> = self
                .store
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
            write!(f, "store: {}", entries.join(", "))
        }
    }
}

struct PendingRead {
    awaiting: BTreeSet<PeerId>,
    newest: Option<Versioned>,
    deadline: Instant,
}

/// A replica with failure detection, election, gossip and two-phase commit.
pub struct Node {
    id: PeerId,
    cluster: ClusterView,
    read_timeout: Duration,
    detector: FailureDetector,
    gossip: Gossip,
    election: BullyElection,
    coordinator: Coordinator,
    participant: Participant,
    store: KvStore,
    /// Highest timestamp issued or observed; local versions stay above it.
    clock: u64,
    reads: HashMap<Uuid, PendingRead>,
    unreachable: BTreeSet<PeerId>,
    last_leader: Option<PeerId>,
    loopback: VecDeque<Message>,
    ready: ReadyBundle,
}

impl Node {
    pub fn new(cluster: ClusterView, tuning: &Tuning, now: Instant) -> Self {
        let id = cluster.local();
        Self {
            id,
            read_timeout: tuning.read_timeout,
            detector: FailureDetector::new(cluster.clone(), tuning, now),
            gossip: Gossip::new(cluster.clone(), tuning),
            election: BullyElection::new(cluster.clone(), tuning),
            coordinator: Coordinator::new(id, tuning),
            participant: Participant::new(id, tuning),
            store: KvStore::new(),
            clock: 0,
            reads: HashMap::new(),
            unreachable: BTreeSet::new(),
            last_leader: None,
            loopback: VecDeque::new(),
            ready: ReadyBundle::default(),
            cluster,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn cluster(&self) -> &ClusterView {
        &self.cluster
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn phase(&self) -> ElectionPhase {
        self.election.phase()
    }

    pub fn leader(&self) -> Option<PeerId> {
        self.election.leader()
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    /// Handles one inbound message.
    pub fn step(&mut self, message: Message, now: Instant) {
        if message.to != self.id {
            debug!(node = self.id, to = message.to, "dropping misaddressed message");
            return;
        }
        self.handle(message, now);
        self.settle(now);
    }

    /// Advances timers: heartbeats, failure checks, election and commit
    /// deadlines, gossip retransmission, and strong-read timeouts.
    pub fn tick(&mut self, now: Instant) {
        if self.detector.poll_heartbeats(now) {
            self.ready.broadcasts.push(Payload::Heartbeat);
        }

        let unreachable = self.detector.check_failures(now);
        let newly: BTreeSet<PeerId> = unreachable.difference(&self.unreachable).copied().collect();
        for peer in &newly {
            self.ready.events.push(NodeEvent::PeerSuspected { peer: *peer });
        }
        self.unreachable = unreachable;
        if !newly.is_empty() && self.election.is_leader() {
            self.start_recovery(now);
        }

        let messages = self.election.tick(now);
        self.route(messages);
        let messages = self.gossip.tick(now);
        self.route(messages);
        let messages = self.coordinator.tick(now);
        self.route(messages);
        let messages = self.participant.tick(now);
        self.route(messages);

        let expired: Vec<Uuid> = self
            .reads
            .iter()
            .filter(|(_, read)| now >= read.deadline)
            .map(|(id, _)| *id)
            .collect();
        for request_id in expired {
            debug!(node = self.id, request = %request_id, "strong read timed out");
            self.finish_read(request_id);
        }

        self.settle(now);
    }

    /// Forces an election from this node.
    pub fn campaign(&mut self, now: Instant) {
        let messages = self.election.start_election(now);
        self.route(messages);
        self.settle(now);
    }

    /// Writes `value` (or deletes, for `None`) under `key`.
    pub fn propose_write(
        &mut self,
        key: String,
        value: Option<String>,
        consistency: Consistency,
        now: Instant,
    ) -> Result<Proposal, KvError> {
        match consistency {
            Consistency::Eventual => {
                let write = WriteOp {
                    key,
                    value,
                    version: self.next_version(),
                };
                self.store.apply(&write);
                let (message_id, messages) = self.gossip.gossip(GossipBody::Write(write), now);
                debug!(node = self.id, message = %message_id, "eventual write gossiped");
                self.route(messages);
                self.settle(now);
                Ok(Proposal::Applied)
            }
            Consistency::Strong => {
                let live = self.cluster.live_others();
                let size = self.cluster.size();
                if live.len() + 1 < self.cluster.quorum() {
                    return Err(KvError::NoQuorum {
                        live: live.len() + 1,
                        size,
                    });
                }
                if !self.election.is_leader() {
                    return Err(KvError::NotLeader {
                        leader: self.election.leader(),
                    });
                }
                let participants: BTreeSet<PeerId> =
                    live.into_iter().chain(std::iter::once(self.id)).collect();
                let write = WriteOp {
                    key,
                    value,
                    version: self.next_version(),
                };
                let (txn_id, messages) = self.coordinator.begin(participants, write, now);
                self.route(messages);
                self.settle(now);
                Ok(Proposal::Pending(txn_id))
            }
        }
    }

    /// Reads `key`. Strong reads ask every reachable replica and keep the
    /// newest version; a tombstone reads as absent.
    pub fn start_read(&mut self, key: &str, consistency: Consistency, now: Instant) -> ReadOutcome {
        let local = self.store.entry(key).cloned();
        let live = self.cluster.live_others();
        if consistency == Consistency::Eventual || live.is_empty() {
            return ReadOutcome::Ready(local.and_then(|entry| entry.value));
        }

        let request_id = Uuid::new_v4();
        let messages: Vec<Message> = live
            .iter()
            .map(|peer| {
                Message::new(
                    self.id,
                    *peer,
                    Payload::ReadRequest {
                        request_id,
                        key: key.to_string(),
                    },
                )
            })
            .collect();
        self.reads.insert(
            request_id,
            PendingRead {
                awaiting: live.into_iter().collect(),
                newest: local,
                deadline: now + self.read_timeout,
            },
        );
        self.route(messages);
        self.settle(now);
        ReadOutcome::Pending(request_id)
    }

    /// Gossips an opaque note to the cluster.
    pub fn announce(&mut self, text: String, now: Instant) -> GossipId {
        let (message_id, messages) = self.gossip.gossip(GossipBody::Note { text }, now);
        self.route(messages);
        self.settle(now);
        message_id
    }

    pub fn gossip_coverage(&self, message_id: GossipId) -> f64 {
        self.gossip.get_message_coverage(message_id)
    }

    pub fn get_all_keys(&self) -> Vec<String> {
        self.store.keys()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.id,
            phase: self.election.phase(),
            leader: self.election.leader(),
            peers: self.cluster.snapshot(),
            in_flight: self.coordinator.in_flight(),
            in_doubt: self.participant.in_doubt(),
            store: self.store.snapshot(),
        }
    }

    /// Takes everything produced since the last call, or `None` if idle.
    pub fn poll_ready(&mut self) -> Option<ReadyBundle> {
        if self.ready.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.ready))
    }

    fn handle(&mut self, message: Message, now: Instant) {
        let from = message.from;
        match message.payload {
            Payload::Heartbeat => {
                if self.detector.record_heartbeat(from, now) {
                    self.unreachable.remove(&from);
                    self.ready.events.push(NodeEvent::PeerRecovered { peer: from });
                    let messages = self.election.on_peer_recovered(from);
                    self.route(messages);
                }
            }
            Payload::Election => {
                let messages = self.election.on_election(from, now);
                self.route(messages);
            }
            Payload::Vote => self.election.on_vote(from),
            Payload::Victory => {
                let messages = self.election.on_victory(from, now);
                self.route(messages);
            }
            Payload::Prepare {
                txn_id,
                participants,
                write,
            } => {
                self.observe(write.version);
                let vote = self.participant.on_prepare(from, txn_id, participants, write);
                self.route(vec![vote]);
            }
            Payload::PrepareVote { txn_id, vote } => {
                let messages = self.coordinator.on_vote(from, txn_id, vote, now);
                self.route(messages);
            }
            Payload::Commit { txn_id } => {
                if let Some(ack) = self.participant.on_commit(from, txn_id, &mut self.store) {
                    self.route(vec![ack]);
                }
            }
            Payload::Abort { txn_id } => self.participant.on_abort(from, txn_id),
            Payload::CommitAck { txn_id } => self.coordinator.on_ack(from, txn_id),
            Payload::RecoveryQuery { suspects } => {
                let records = self.participant.report(&suspects);
                self.route(vec![Message::new(
                    self.id,
                    from,
                    Payload::RecoveryReport { records },
                )]);
            }
            Payload::RecoveryReport { records } => {
                let messages = self.coordinator.on_recovery_report(from, records, now);
                self.route(messages);
            }
            Payload::Gossip {
                message_id,
                origin,
                seen_by,
                body,
            } => {
                if let Some(delivery) =
                    self.gossip
                        .receive_gossip(from, message_id, origin, seen_by, body, now)
                {
                    self.apply_gossip(origin, delivery.body);
                    self.route(delivery.messages);
                }
            }
            Payload::GossipAck { message_id } => self.gossip.on_ack(from, message_id),
            Payload::ReadRequest { request_id, key } => {
                let entry = self.store.entry(&key).cloned();
                self.route(vec![Message::new(
                    self.id,
                    from,
                    Payload::ReadReply { request_id, entry },
                )]);
            }
            Payload::ReadReply { request_id, entry } => {
                if let Some(entry) = &entry {
                    self.observe(entry.version);
                }
                let Some(read) = self.reads.get_mut(&request_id) else {
                    return;
                };
                read.awaiting.remove(&from);
                if let Some(entry) = entry {
                    if read
                        .newest
                        .as_ref()
                        .map_or(true, |newest| entry.version > newest.version)
                    {
                        read.newest = Some(entry);
                    }
                }
                if read.awaiting.is_empty() {
                    self.finish_read(request_id);
                }
            }
        }
    }

    fn apply_gossip(&mut self, origin: PeerId, body: GossipBody) {
        match body {
            GossipBody::Write(write) => {
                self.observe(write.version);
                if self.store.apply(&write) {
                    debug!(node = self.id, key = %write.key, version = %write.version, "applied gossiped write");
                }
            }
            GossipBody::Note { text } => {
                info!(node = self.id, origin, note = %text, "gossip note");
            }
        }
    }

    fn finish_read(&mut self, request_id: Uuid) {
        if let Some(read) = self.reads.remove(&request_id) {
            self.ready.events.push(NodeEvent::ReadCompleted {
                request_id,
                value: read.newest.and_then(|entry| entry.value),
            });
        }
    }

    fn start_recovery(&mut self, now: Instant) {
        let suspects: BTreeSet<PeerId> = self.cluster.unreachable().into_iter().collect();
        let live: BTreeSet<PeerId> = self
            .cluster
            .live_others()
            .into_iter()
            .chain(std::iter::once(self.id))
            .collect();
        let messages = self.coordinator.start_recovery(suspects, live, now);
        self.route(messages);
    }

    /// Queues self-addressed messages for local delivery, the rest for the transport.
    fn route(&mut self, messages: Vec<Message>) {
        for message in messages {
            if message.to == self.id {
                self.loopback.push_back(message);
            } else {
                self.ready.messages.push(message);
            }
        }
    }

    /// Drains the loopback queue and reacts to leadership changes until quiet.
    fn settle(&mut self, now: Instant) {
        loop {
            while let Some(message) = self.loopback.pop_front() {
                self.handle(message, now);
            }

            let leader = self.election.leader();
            if leader != self.last_leader {
                info!(node = self.id, leader = ?leader, "leader changed");
                self.last_leader = leader;
                self.ready.events.push(NodeEvent::LeaderChanged { leader });
                if leader == Some(self.id) {
                    self.start_recovery(now);
                }
            }

            for Decision { txn_id, committed } in self.coordinator.take_decisions() {
                self.ready.events.push(NodeEvent::Decided { txn_id, committed });
            }

            if self.loopback.is_empty() {
                break;
            }
        }
    }

    fn next_version(&mut self) -> Version {
        self.clock = now_millis().max(self.clock + 1);
        Version {
            timestamp: self.clock,
            origin: self.id,
        }
    }

    fn observe(&mut self, version: Version) {
        self.clock = self.clock.max(version.timestamp);
    }
}
