//! Epidemic dissemination with bounded fanout.
//!
//! A node forwards a message the first time it sees it, to `fanout` random
//! live peers that are not already known to have it. Every copy carries the
//! sender's set of informed peers, so forwarding spreads outward instead of
//! bouncing between the same few nodes. Duplicates are dropped, which also
//! bounds propagation.
//!
//! Delivery to any single node is not guaranteed. The origin narrows the gap
//! by re-pushing to peers that have not acknowledged for a short window.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tracing::debug;
use uuid::Uuid;

use crate::cluster::{ClusterView, PeerId};
use crate::config::Tuning;
use crate::message::{GossipBody, GossipId, Message, Payload};

#[derive(Debug, Clone)]
pub struct GossipMessageRecord {
    pub message_id: GossipId,
    pub origin: PeerId,
    pub body: GossipBody,
    /// Peers confirmed to hold the message. Only grows.
    pub received_by: BTreeSet<PeerId>,
    /// Peers that hold it or were already sent a copy; never targeted again.
    informed: BTreeSet<PeerId>,
    created: Instant,
    next_retransmit: Instant,
}

/// Result of receiving a message for the first time.
#[derive(Debug)]
pub struct Delivery {
    /// Payload for the application side effect. Produced once per message id.
    pub body: GossipBody,
    pub messages: Vec<Message>,
}

pub struct Gossip {
    cluster: ClusterView,
    fanout: usize,
    interval: Duration,
    window: Duration,
    ttl: Duration,
    records: HashMap<GossipId, GossipMessageRecord>,
}

impl Gossip {
    pub fn new(cluster: ClusterView, tuning: &Tuning) -> Self {
        Self {
            cluster,
            fanout: tuning.gossip_fanout,
            interval: tuning.gossip_interval,
            window: tuning.gossip_retransmit_window,
            ttl: tuning.gossip_record_ttl,
            records: HashMap::new(),
        }
    }

    /// Starts disseminating `body` from this node.
    pub fn gossip(&mut self, body: GossipBody, now: Instant) -> (GossipId, Vec<Message>) {
        let local = self.cluster.local();
        let message_id = Uuid::new_v4();
        let mut record = GossipMessageRecord {
            message_id,
            origin: local,
            body,
            received_by: BTreeSet::from([local]),
            informed: BTreeSet::from([local]),
            created: now,
            next_retransmit: now + self.interval,
        };
        let messages = self.spread(&mut record);
        debug!(message = %message_id, targets = messages.len(), "gossip originated");
        self.records.insert(message_id, record);
        (message_id, messages)
    }

    /// Handles an incoming copy.
    ///
    /// Returns `None` for a message already seen: the copy only teaches us
    /// who else holds it.
    pub fn receive_gossip(
        &mut self,
        from: PeerId,
        message_id: GossipId,
        origin: PeerId,
        seen_by: BTreeSet<PeerId>,
        body: GossipBody,
        now: Instant,
    ) -> Option<Delivery> {
        if let Some(record) = self.records.get_mut(&message_id) {
            record.received_by.insert(from);
            record.informed.insert(from);
            record.informed.extend(seen_by);
            return None;
        }

        let local = self.cluster.local();
        let mut informed = seen_by;
        informed.extend([local, from, origin]);
        let mut record = GossipMessageRecord {
            message_id,
            origin,
            body: body.clone(),
            received_by: BTreeSet::from([local, from, origin]),
            informed,
            created: now,
            next_retransmit: now + self.interval,
        };
        let mut messages = self.spread(&mut record);
        if origin != local {
            messages.push(Message::new(local, origin, Payload::GossipAck { message_id }));
        }
        self.records.insert(message_id, record);
        Some(Delivery { body, messages })
    }

    pub fn on_ack(&mut self, from: PeerId, message_id: GossipId) {
        if let Some(record) = self.records.get_mut(&message_id) {
            record.received_by.insert(from);
            record.informed.insert(from);
        }
    }

    /// Fraction of the cluster known (locally) to hold the message.
    pub fn get_message_coverage(&self, message_id: GossipId) -> f64 {
        let Some(record) = self.records.get(&message_id) else {
            return 0.0;
        };
        let size = self.cluster.size();
        (record.received_by.len().min(size) as f64) / (size as f64)
    }

    pub fn record(&self, message_id: GossipId) -> Option<&GossipMessageRecord> {
        self.records.get(&message_id)
    }

    /// Re-pushes our own unacknowledged messages and forgets expired ones.
    pub fn tick(&mut self, now: Instant) -> Vec<Message> {
        let ttl = self.ttl;
        self.records
            .retain(|_, record| now.saturating_duration_since(record.created) < ttl);

        let local = self.cluster.local();
        let size = self.cluster.size();
        let live = self.cluster.live_others();
        let mut messages = Vec::new();
        for record in self.records.values_mut() {
            if record.origin != local
                || record.received_by.len() >= size
                || now.saturating_duration_since(record.created) > self.window
                || now < record.next_retransmit
            {
                continue;
            }
            record.next_retransmit = now + self.interval;
            let pending: Vec<PeerId> = live
                .iter()
                .copied()
                .filter(|peer| !record.received_by.contains(peer))
                .collect();
            let targets = pick(&pending, self.fanout);
            if targets.is_empty() {
                continue;
            }
            debug!(message = %record.message_id, targets = ?targets, "gossip retransmit");
            messages.extend(targets.into_iter().map(|target| {
                Message::new(
                    local,
                    target,
                    Payload::Gossip {
                        message_id: record.message_id,
                        origin: record.origin,
                        seen_by: record.received_by.clone(),
                        body: record.body.clone(),
                    },
                )
            }));
        }
        messages
    }

    fn spread(&self, record: &mut GossipMessageRecord) -> Vec<Message> {
        let candidates: Vec<PeerId> = self
            .cluster
            .live_others()
            .into_iter()
            .filter(|peer| !record.informed.contains(peer))
            .collect();
        let targets = pick(&candidates, self.fanout);
        record.informed.extend(targets.iter().copied());

        let local = self.cluster.local();
        targets
            .into_iter()
            .map(|target| {
                Message::new(
                    local,
                    target,
                    Payload::Gossip {
                        message_id: record.message_id,
                        origin: record.origin,
                        seen_by: record.informed.clone(),
                        body: record.body.clone(),
                    },
                )
            })
            .collect()
    }
}

fn pick(candidates: &[PeerId], amount: usize) -> Vec<PeerId> {
    let mut rng = rand::thread_rng();
    candidates.choose_multiple(&mut rng, amount).copied().collect()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    struct Mesh {
        nodes: HashMap<PeerId, Gossip>,
        clusters: HashMap<PeerId, ClusterView>,
        in_flight: VecDeque<Message>,
        side_effects: HashMap<PeerId, usize>,
        now: Instant,
    }

    impl Mesh {
        fn new(n: u64, fanout: usize) -> Self {
            let tuning = Tuning {
                gossip_fanout: fanout,
                ..Tuning::default()
            };
            let mut nodes = HashMap::new();
            let mut clusters = HashMap::new();
            for id in 1..=n {
                let cluster = ClusterView::new(id, (1..=n).map(|p| (p, format!("n{p}"))))
                    .expect("cluster");
                nodes.insert(id, Gossip::new(cluster.clone(), &tuning));
                clusters.insert(id, cluster);
            }
            Self {
                nodes,
                clusters,
                in_flight: VecDeque::new(),
                side_effects: HashMap::new(),
                now: Instant::now(),
            }
        }

        fn originate(&mut self, origin: PeerId, text: &str) -> GossipId {
            let now = self.now;
            let node = self.nodes.get_mut(&origin).expect("origin");
            let (id, messages) = node.gossip(GossipBody::Note { text: text.into() }, now);
            self.in_flight.extend(messages);
            id
        }

        /// Delivers everything currently in flight; replies go out next round.
        fn round(&mut self) {
            let batch: Vec<Message> = self.in_flight.drain(..).collect();
            for message in batch {
                self.deliver(message);
            }
        }

        /// Delivers only pending acknowledgements.
        fn flush_acks(&mut self) {
            let (acks, rest): (Vec<Message>, Vec<Message>) = self
                .in_flight
                .drain(..)
                .partition(|m| matches!(m.payload, Payload::GossipAck { .. }));
            self.in_flight.extend(rest);
            for message in acks {
                self.deliver(message);
            }
        }

        fn deliver(&mut self, message: Message) {
            let now = self.now;
            let node = self.nodes.get_mut(&message.to).expect("target");
            match message.payload {
                Payload::Gossip {
                    message_id,
                    origin,
                    seen_by,
                    body,
                } => {
                    if let Some(delivery) =
                        node.receive_gossip(message.from, message_id, origin, seen_by, body, now)
                    {
                        *self.side_effects.entry(message.to).or_default() += 1;
                        self.in_flight.extend(delivery.messages);
                    }
                }
                Payload::GossipAck { message_id } => node.on_ack(message.from, message_id),
                other => panic!("unexpected payload {other:?}"),
            }
        }
    }

    #[test]
    fn duplicate_receipt_has_one_side_effect() {
        let mut mesh = Mesh::new(3, 2);
        let now = mesh.now;
        let id = Uuid::new_v4();
        let body = GossipBody::Note { text: "X=1".into() };
        let node = mesh.nodes.get_mut(&2).expect("node 2");

        let first = node.receive_gossip(1, id, 1, BTreeSet::from([1]), body.clone(), now);
        let second = node.receive_gossip(1, id, 1, BTreeSet::from([1]), body.clone(), now);
        let third = node.receive_gossip(3, id, 1, BTreeSet::from([1, 3]), body, now);

        assert!(first.is_some());
        assert!(second.is_none());
        assert!(third.is_none());
        let record = node.record(id).expect("recorded");
        assert!(record.received_by.is_superset(&BTreeSet::from([1, 2, 3])));
    }

    #[test]
    fn first_receipt_acks_origin_and_forwards_to_uninformed() {
        let mut mesh = Mesh::new(4, 3);
        let now = mesh.now;
        let id = Uuid::new_v4();
        let node = mesh.nodes.get_mut(&2).expect("node 2");

        let delivery = node
            .receive_gossip(1, id, 1, BTreeSet::from([1, 3]), GossipBody::Note { text: "hi".into() }, now)
            .expect("fresh");

        let acks: Vec<_> = delivery
            .messages
            .iter()
            .filter(|m| matches!(m.payload, Payload::GossipAck { .. }))
            .collect();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].to, 1);

        let forwards: Vec<PeerId> = delivery
            .messages
            .iter()
            .filter(|m| matches!(m.payload, Payload::Gossip { .. }))
            .map(|m| m.to)
            .collect();
        assert_eq!(forwards, vec![4], "peers 1 and 3 are already informed");
    }

    #[test]
    fn seven_node_mesh_reaches_full_coverage_in_log_rounds() {
        let rounds = (7f64).log2().ceil() as usize + 1;
        let trials = 200;
        let mut covered = 0;
        for _ in 0..trials {
            let mut mesh = Mesh::new(7, 2);
            let id = mesh.originate(1, "X=1");
            for _ in 0..rounds {
                mesh.round();
            }
            mesh.flush_acks();
            let coverage = mesh.nodes[&1].get_message_coverage(id);
            assert!((0.0..=1.0).contains(&coverage));
            if coverage == 1.0 {
                covered += 1;
            }
            assert!(mesh.side_effects.values().all(|count| *count == 1));
        }
        assert!(
            covered * 100 >= trials * 95,
            "full coverage in only {covered}/{trials} trials"
        );
    }

    #[test]
    fn suspected_peers_are_not_targeted() {
        let mut mesh = Mesh::new(4, 3);
        mesh.clusters[&1].set_state(3, crate::cluster::PeerState::Suspected);
        mesh.clusters[&1].set_state(4, crate::cluster::PeerState::Failed);
        let now = mesh.now;
        let (_, messages) = mesh
            .nodes
            .get_mut(&1)
            .expect("node 1")
            .gossip(GossipBody::Note { text: "x".into() }, now);
        let targets: Vec<PeerId> = messages.iter().map(|m| m.to).collect();
        assert_eq!(targets, vec![2]);
    }

    #[test]
    fn origin_retransmits_to_unacknowledged_peers() {
        let mut mesh = Mesh::new(3, 1);
        let id = mesh.originate(1, "lost");
        // The first copy is lost on the wire.
        mesh.in_flight.clear();
        assert!(mesh.nodes[&1].get_message_coverage(id) < 1.0);

        let mut now = mesh.now;
        for _ in 0..20 {
            now += Duration::from_millis(300);
            mesh.now = now;
            let resend = mesh.nodes.get_mut(&1).expect("origin").tick(now);
            mesh.in_flight.extend(resend);
            mesh.round();
            mesh.round();
            mesh.flush_acks();
        }
        assert_eq!(mesh.nodes[&1].get_message_coverage(id), 1.0);
    }

    #[test]
    fn expired_records_are_forgotten() {
        let mut mesh = Mesh::new(2, 1);
        let id = mesh.originate(1, "old");
        let later = mesh.now + Tuning::default().gossip_record_ttl + Duration::from_secs(1);
        mesh.nodes.get_mut(&1).expect("origin").tick(later);
        assert!(mesh.nodes[&1].record(id).is_none());
        assert_eq!(mesh.nodes[&1].get_message_coverage(id), 0.0);
    }
}
