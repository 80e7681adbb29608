use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::cluster::PeerId;
use crate::config::Tuning;
use crate::message::{Message, Payload, TxnId, Vote, WriteOp};
use crate::store::KvStore;

use super::RETAINED_FINISHED;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantState {
    Init,
    Prepared,
    Committed,
    Aborted,
    /// Told to commit something we had voted against or already aborted.
    Failed,
}

/// What one participant knows about one transaction. Also the unit a
/// recovering leader collects from every live peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub txn_id: TxnId,
    pub coordinator: PeerId,
    pub participants: BTreeSet<PeerId>,
    pub state: ParticipantState,
    /// Tentative write held between `Yes` and the decision.
    pub write: Option<WriteOp>,
}

impl ParticipantRecord {
    fn vote(&self) -> Vote {
        match self.state {
            ParticipantState::Prepared | ParticipantState::Committed => Vote::Yes,
            _ => Vote::No,
        }
    }

    fn is_finished(&self) -> bool {
        !matches!(self.state, ParticipantState::Init | ParticipantState::Prepared)
    }
}

/// Participant side of two-phase commit.
///
/// A `Yes` vote locks the key until a decision arrives. The lock never times
/// out on its own: only the coordinator, or a leader re-driving for it, may
/// release it. While waiting, the participant repeats its vote to the
/// coordinator every `commit_timeout`, which the coordinator answers with the
/// decision if one was made and lost on the way.
pub struct Participant {
    local: PeerId,
    query_interval: Duration,
    records: HashMap<TxnId, ParticipantRecord>,
    locks: HashMap<String, TxnId>,
    /// Next time an in-doubt transaction asks its coordinator again.
    next_query: HashMap<TxnId, Instant>,
    finished: VecDeque<TxnId>,
}

impl Participant {
    pub fn new(local: PeerId, tuning: &Tuning) -> Self {
        Self {
            local,
            query_interval: tuning.commit_timeout,
            records: HashMap::new(),
            locks: HashMap::new(),
            next_query: HashMap::new(),
            finished: VecDeque::new(),
        }
    }

    /// Casts (or repeats) our vote for `txn_id`.
    pub fn on_prepare(
        &mut self,
        from: PeerId,
        txn_id: TxnId,
        participants: BTreeSet<PeerId>,
        write: WriteOp,
    ) -> Message {
        if let Some(record) = self.records.get(&txn_id) {
            debug!(txn = %txn_id, state = ?record.state, "duplicate prepare");
            return self.vote_message(from, txn_id, record.vote());
        }

        let mut record = ParticipantRecord {
            txn_id,
            coordinator: from,
            participants,
            state: ParticipantState::Init,
            write: None,
        };
        match self.locks.get(&write.key) {
            Some(holder) if *holder != txn_id => {
                warn!(txn = %txn_id, key = %write.key, holder = %holder, "key locked, voting no");
                record.state = ParticipantState::Aborted;
                self.finish(txn_id);
            }
            _ => {
                self.locks.insert(write.key.clone(), txn_id);
                record.state = ParticipantState::Prepared;
                record.write = Some(write);
            }
        }
        let vote = record.vote();
        self.records.insert(txn_id, record);
        self.vote_message(from, txn_id, vote)
    }

    /// Makes the tentative write permanent. Returns the ack for the sender.
    pub fn on_commit(&mut self, from: PeerId, txn_id: TxnId, store: &mut KvStore) -> Option<Message> {
        let Some(record) = self.records.get_mut(&txn_id) else {
            warn!(txn = %txn_id, coordinator = from, "commit for unknown transaction");
            return None;
        };
        match record.state {
            ParticipantState::Prepared => {
                if let Some(write) = record.write.take() {
                    store.apply(&write);
                    if self.locks.get(&write.key) == Some(&txn_id) {
                        self.locks.remove(&write.key);
                    }
                }
                record.state = ParticipantState::Committed;
                debug!(txn = %txn_id, "committed");
                self.finish(txn_id);
            }
            ParticipantState::Committed => {}
            ParticipantState::Init | ParticipantState::Aborted | ParticipantState::Failed => {
                error!(txn = %txn_id, state = ?record.state, "commit received for a transaction we did not prepare");
                record.state = ParticipantState::Failed;
                return None;
            }
        }
        Some(Message::new(self.local, from, Payload::CommitAck { txn_id }))
    }

    /// Discards tentative state. An abort for an unknown transaction leaves a
    /// tombstone so that a delayed `Prepare` votes `No`.
    pub fn on_abort(&mut self, from: PeerId, txn_id: TxnId) {
        if !self.records.contains_key(&txn_id) {
            debug!(txn = %txn_id, "abort before prepare");
            self.records.insert(
                txn_id,
                ParticipantRecord {
                    txn_id,
                    coordinator: from,
                    participants: BTreeSet::new(),
                    state: ParticipantState::Aborted,
                    write: None,
                },
            );
            self.finish(txn_id);
            return;
        }
        let Some(record) = self.records.get_mut(&txn_id) else {
            return;
        };
        match record.state {
            ParticipantState::Init | ParticipantState::Prepared => {
                if let Some(write) = record.write.take() {
                    if self.locks.get(&write.key) == Some(&txn_id) {
                        self.locks.remove(&write.key);
                    }
                }
                record.state = ParticipantState::Aborted;
                debug!(txn = %txn_id, "aborted");
                self.finish(txn_id);
            }
            ParticipantState::Committed => {
                error!(txn = %txn_id, "abort received after commit, ignoring");
            }
            ParticipantState::Aborted | ParticipantState::Failed => {}
        }
    }

    /// Re-sends `Yes` to the coordinator of every transaction that has been
    /// in doubt for longer than `commit_timeout`.
    pub fn tick(&mut self, now: Instant) -> Vec<Message> {
        let mut messages = Vec::new();
        for record in self.records.values() {
            if record.state != ParticipantState::Prepared {
                continue;
            }
            let due = self
                .next_query
                .entry(record.txn_id)
                .or_insert(now + self.query_interval);
            if now < *due {
                continue;
            }
            *due = now + self.query_interval;
            debug!(txn = %record.txn_id, coordinator = record.coordinator, "still in doubt, asking coordinator");
            messages.push(Message::new(
                self.local,
                record.coordinator,
                Payload::PrepareVote {
                    txn_id: record.txn_id,
                    vote: Vote::Yes,
                },
            ));
        }
        messages
    }

    /// Records for transactions coordinated by one of `suspects`.
    pub fn report(&self, suspects: &BTreeSet<PeerId>) -> Vec<ParticipantRecord> {
        let mut records: Vec<ParticipantRecord> = self
            .records
            .values()
            .filter(|record| suspects.contains(&record.coordinator))
            .cloned()
            .collect();
        records.sort_by_key(|record| record.txn_id);
        records
    }

    /// Transactions we voted `Yes` on that are still waiting for a decision.
    pub fn in_doubt(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self
            .records
            .values()
            .filter(|record| record.state == ParticipantState::Prepared)
            .map(|record| record.txn_id)
            .collect();
        ids.sort();
        ids
    }

    pub fn state(&self, txn_id: TxnId) -> Option<ParticipantState> {
        self.records.get(&txn_id).map(|record| record.state)
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.locks.contains_key(key)
    }

    fn vote_message(&self, to: PeerId, txn_id: TxnId, vote: Vote) -> Message {
        Message::new(self.local, to, Payload::PrepareVote { txn_id, vote })
    }

    fn finish(&mut self, txn_id: TxnId) {
        self.next_query.remove(&txn_id);
        self.finished.push_back(txn_id);
        while self.finished.len() > RETAINED_FINISHED {
            if let Some(old) = self.finished.pop_front() {
                if self.records.get(&old).is_some_and(ParticipantRecord::is_finished) {
                    self.records.remove(&old);
                }
            }
        }
    }
}
