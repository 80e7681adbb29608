//! Bully leader election with a majority requirement.
//!
//! Rank is the peer id. A candidate broadcasts `Election`; higher-ranked
//! peers object by running their own election, lower-ranked peers answer with
//! a `Vote`. A candidate that heard no objection and collected a strict
//! majority of votes by its deadline declares `Victory`. Requiring a majority
//! keeps a partitioned minority from electing a second leader.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterView, PeerId};
use crate::config::Tuning;
use crate::message::{Message, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionPhase {
    Idle,
    Electing,
    Leader,
    Follower,
}

impl fmt::Display for ElectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElectionPhase::Idle => write!(f, "idle"),
            ElectionPhase::Electing => write!(f, "electing"),
            ElectionPhase::Leader => write!(f, "leader"),
            ElectionPhase::Follower => write!(f, "follower"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionState {
    pub phase: ElectionPhase,
    /// Votes collected in the current round, our own included.
    pub votes_received: usize,
    pub current_leader: Option<PeerId>,
}

pub struct BullyElection {
    cluster: ClusterView,
    timeout: Duration,
    backoff: Duration,
    state: ElectionState,
    voters: BTreeSet<PeerId>,
    /// Highest peer that objected this round. We wait for its victory.
    deferred_to: Option<PeerId>,
    extended: bool,
    deadline: Option<Instant>,
    retry_at: Option<Instant>,
}

impl BullyElection {
    pub fn new(cluster: ClusterView, tuning: &Tuning) -> Self {
        Self {
            cluster,
            timeout: tuning.election_timeout,
            backoff: tuning.election_backoff,
            state: ElectionState {
                phase: ElectionPhase::Idle,
                votes_received: 0,
                current_leader: None,
            },
            voters: BTreeSet::new(),
            deferred_to: None,
            extended: false,
            deadline: None,
            retry_at: None,
        }
    }

    pub fn state(&self) -> &ElectionState {
        &self.state
    }

    pub fn phase(&self) -> ElectionPhase {
        self.state.phase
    }

    pub fn leader(&self) -> Option<PeerId> {
        self.state.current_leader
    }

    pub fn is_leader(&self) -> bool {
        self.state.phase == ElectionPhase::Leader
    }

    /// Enters `Electing`, votes for ourselves and challenges every other peer.
    pub fn start_election(&mut self, now: Instant) -> Vec<Message> {
        let local = self.cluster.local();
        info!(node = local, "starting election");
        self.state.phase = ElectionPhase::Electing;
        self.state.current_leader = None;
        self.voters = BTreeSet::from([local]);
        self.state.votes_received = 1;
        self.deferred_to = None;
        self.extended = false;
        self.deadline = Some(now + self.timeout);
        self.retry_at = None;
        self.to_all(Payload::Election)
    }

    pub fn on_election(&mut self, from: PeerId, now: Instant) -> Vec<Message> {
        let local = self.cluster.local();
        if from == local {
            return Vec::new();
        }

        if from > local {
            let vote = vec![Message::new(local, from, Payload::Vote)];
            match self.state.phase {
                ElectionPhase::Electing => {
                    self.deferred_to = self.deferred_to.max(Some(from));
                }
                ElectionPhase::Follower
                    if self
                        .state
                        .current_leader
                        .is_some_and(|leader| leader > from && self.cluster.is_live(leader)) =>
                {
                    // Our leader outranks the candidate and will answer it.
                }
                ElectionPhase::Leader => {
                    info!(node = local, challenger = from, "stepping down for higher peer");
                    self.await_victory(from, now);
                }
                ElectionPhase::Idle | ElectionPhase::Follower => self.await_victory(from, now),
            }
            return vote;
        }

        match self.state.phase {
            ElectionPhase::Idle | ElectionPhase::Follower => self.start_election(now),
            ElectionPhase::Electing => vec![Message::new(local, from, Payload::Election)],
            ElectionPhase::Leader => vec![Message::new(local, from, Payload::Victory)],
        }
    }

    pub fn on_vote(&mut self, from: PeerId) {
        if self.state.phase != ElectionPhase::Electing || from == self.cluster.local() {
            return;
        }
        if self.voters.insert(from) {
            self.state.votes_received = self.voters.len();
            debug!(voter = from, votes = self.state.votes_received, "vote received");
        }
    }

    pub fn on_victory(&mut self, from: PeerId, now: Instant) -> Vec<Message> {
        let local = self.cluster.local();
        if from > local {
            if self.state.current_leader != Some(from) {
                info!(node = local, leader = from, "following new leader");
            }
            self.state.phase = ElectionPhase::Follower;
            self.state.current_leader = Some(from);
            self.state.votes_received = 0;
            self.voters.clear();
            self.deferred_to = None;
            self.deadline = None;
            self.retry_at = None;
            return Vec::new();
        }
        if from == local {
            return Vec::new();
        }
        match self.state.phase {
            ElectionPhase::Leader => vec![Message::new(local, from, Payload::Victory)],
            ElectionPhase::Electing => Vec::new(),
            ElectionPhase::Idle | ElectionPhase::Follower => {
                warn!(node = local, claimant = from, "victory from lower-ranked peer");
                self.start_election(now)
            }
        }
    }

    /// A leader re-announces itself to peers that come back.
    pub fn on_peer_recovered(&mut self, peer: PeerId) -> Vec<Message> {
        if self.is_leader() {
            vec![Message::new(self.cluster.local(), peer, Payload::Victory)]
        } else {
            Vec::new()
        }
    }

    /// Drives deadlines, retries, and reaction to an unreachable leader.
    pub fn tick(&mut self, now: Instant) -> Vec<Message> {
        match self.state.phase {
            ElectionPhase::Idle => match self.retry_at {
                Some(at) if now < at => Vec::new(),
                _ => self.start_election(now),
            },
            ElectionPhase::Follower => match self.state.current_leader {
                Some(leader) if self.cluster.is_live(leader) => Vec::new(),
                leader => {
                    warn!(node = self.cluster.local(), leader = ?leader, "leader unreachable");
                    self.start_election(now)
                }
            },
            ElectionPhase::Leader => {
                let live = self.cluster.live_others().len() + 1;
                if live < self.cluster.quorum() {
                    warn!(node = self.cluster.local(), live, "lost majority, stepping down");
                    self.state.current_leader = None;
                    self.schedule_retry(now);
                }
                Vec::new()
            }
            ElectionPhase::Electing => {
                let Some(deadline) = self.deadline else {
                    return self.start_election(now);
                };
                if now < deadline {
                    return Vec::new();
                }
                self.on_deadline(now)
            }
        }
    }

    fn on_deadline(&mut self, now: Instant) -> Vec<Message> {
        let local = self.cluster.local();
        if let Some(objector) = self.deferred_to {
            if !self.extended && self.cluster.is_live(objector) {
                self.extended = true;
                self.deadline = Some(now + self.timeout);
                return Vec::new();
            }
            debug!(node = local, objector, "no victory from objector, restarting");
            return self.start_election(now);
        }

        let size = self.cluster.size();
        if self.state.votes_received * 2 > size {
            info!(node = local, votes = self.state.votes_received, size, "elected leader");
            self.state.phase = ElectionPhase::Leader;
            self.state.current_leader = Some(local);
            self.deadline = None;
            return self.to_all(Payload::Victory);
        }

        warn!(
            node = local,
            votes = self.state.votes_received,
            size,
            "no majority, backing off"
        );
        self.schedule_retry(now);
        Vec::new()
    }

    fn await_victory(&mut self, from: PeerId, now: Instant) {
        self.state.phase = ElectionPhase::Electing;
        self.state.current_leader = None;
        self.voters = BTreeSet::from([self.cluster.local()]);
        self.state.votes_received = 1;
        self.deferred_to = Some(from);
        self.extended = false;
        self.deadline = Some(now + self.timeout);
        self.retry_at = None;
    }

    fn schedule_retry(&mut self, now: Instant) {
        let max = self.backoff.as_millis() as u64;
        let delay = if max == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..max))
        };
        self.state.phase = ElectionPhase::Idle;
        self.state.votes_received = 0;
        self.voters.clear();
        self.deadline = None;
        self.retry_at = Some(now + delay);
    }

    fn to_all(&self, payload: Payload) -> Vec<Message> {
        let local = self.cluster.local();
        self.cluster
            .others()
            .into_iter()
            .map(|peer| Message::new(local, peer, payload.clone()))
            .collect()
    }
}
