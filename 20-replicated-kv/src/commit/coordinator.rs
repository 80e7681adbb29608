use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cluster::PeerId;
use crate::config::Tuning;
use crate::message::{Message, Payload, TxnId, Vote, WriteOp};

use super::participant::{ParticipantRecord, ParticipantState};
use super::RETAINED_FINISHED;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnPhase {
    Init,
    Preparing,
    Prepared,
    Committing,
    Committed,
    Aborted,
    /// Commit was decided but some participant never acknowledged it.
    Failed,
}

#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub txn_id: TxnId,
    pub participants: BTreeSet<PeerId>,
    pub phase: TxnPhase,
    pub votes: BTreeMap<PeerId, Vote>,
    pub write: WriteOp,
    pub acks: BTreeSet<PeerId>,
    /// Decided by a leader on behalf of a suspected coordinator.
    pub recovered: bool,
    deadline: Instant,
    retries: u32,
}

impl TransactionRecord {
    /// `Some(true)` once commit is decided, `Some(false)` once aborted.
    pub fn outcome(&self) -> Option<bool> {
        match self.phase {
            TxnPhase::Committing | TxnPhase::Committed | TxnPhase::Failed => Some(true),
            TxnPhase::Aborted => Some(false),
            TxnPhase::Init | TxnPhase::Preparing | TxnPhase::Prepared => None,
        }
    }
}

/// A commit or abort decision, reported once per transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub txn_id: TxnId,
    pub committed: bool,
}

/// Collected state of one re-drive round.
struct RecoveryRound {
    suspects: BTreeSet<PeerId>,
    awaiting: BTreeSet<PeerId>,
    reports: BTreeMap<TxnId, InDoubt>,
    deadline: Instant,
}

struct InDoubt {
    participants: BTreeSet<PeerId>,
    write: Option<WriteOp>,
    states: BTreeMap<PeerId, ParticipantState>,
}

/// Coordinator side of two-phase commit.
///
/// Active transactions live in `active` until they reach a terminal phase,
/// then move to a bounded archive so duplicate votes and acks can still be
/// answered with the decision.
pub struct Coordinator {
    local: PeerId,
    timeout: Duration,
    max_retries: u32,
    active: BTreeMap<TxnId, TransactionRecord>,
    archive: HashMap<TxnId, TransactionRecord>,
    archive_order: VecDeque<TxnId>,
    decisions: Vec<Decision>,
    recovery: Option<RecoveryRound>,
}

impl Coordinator {
    pub fn new(local: PeerId, tuning: &Tuning) -> Self {
        Self {
            local,
            timeout: tuning.commit_timeout,
            max_retries: tuning.commit_retries,
            active: BTreeMap::new(),
            archive: HashMap::new(),
            archive_order: VecDeque::new(),
            decisions: Vec::new(),
            recovery: None,
        }
    }

    /// Opens a transaction and asks every participant to prepare.
    pub fn begin(
        &mut self,
        participants: BTreeSet<PeerId>,
        write: WriteOp,
        now: Instant,
    ) -> (TxnId, Vec<Message>) {
        let txn_id = Uuid::new_v4();
        let mut record = TransactionRecord {
            txn_id,
            participants,
            phase: TxnPhase::Init,
            votes: BTreeMap::new(),
            write,
            acks: BTreeSet::new(),
            recovered: false,
            deadline: now + self.timeout,
            retries: 0,
        };
        info!(txn = %txn_id, key = %record.write.key, participants = ?record.participants, "prepare");
        let messages = record
            .participants
            .iter()
            .map(|peer| {
                Message::new(
                    self.local,
                    *peer,
                    Payload::Prepare {
                        txn_id,
                        participants: record.participants.clone(),
                        write: record.write.clone(),
                    },
                )
            })
            .collect();
        record.phase = TxnPhase::Preparing;
        self.active.insert(txn_id, record);
        (txn_id, messages)
    }

    pub fn on_vote(&mut self, from: PeerId, txn_id: TxnId, vote: Vote, now: Instant) -> Vec<Message> {
        if let Some(record) = self.archive.get(&txn_id) {
            // Late or duplicate vote: repeat the decision to that voter.
            return match (record.outcome(), vote) {
                (Some(true), _) if !record.acks.contains(&from) => {
                    vec![Message::new(self.local, from, Payload::Commit { txn_id })]
                }
                (Some(false), Vote::Yes) => {
                    vec![Message::new(self.local, from, Payload::Abort { txn_id })]
                }
                _ => Vec::new(),
            };
        }

        let Some(record) = self.active.get_mut(&txn_id) else {
            warn!(txn = %txn_id, peer = from, "vote for unknown transaction");
            return Vec::new();
        };
        if !record.participants.contains(&from) {
            warn!(txn = %txn_id, peer = from, "vote from non-participant");
            return Vec::new();
        }
        if record.phase != TxnPhase::Preparing {
            if record.phase == TxnPhase::Committing && !record.acks.contains(&from) {
                return vec![Message::new(self.local, from, Payload::Commit { txn_id })];
            }
            return Vec::new();
        }

        record.votes.insert(from, vote);
        debug!(txn = %txn_id, peer = from, vote = ?vote, "vote");
        if vote == Vote::No {
            info!(txn = %txn_id, peer = from, "participant voted no");
            return self.abort(txn_id);
        }
        if record.votes.len() == record.participants.len() {
            record.phase = TxnPhase::Prepared;
            return self.commit(txn_id, now);
        }
        Vec::new()
    }

    pub fn on_ack(&mut self, from: PeerId, txn_id: TxnId) {
        if let Some(record) = self.archive.get_mut(&txn_id) {
            // A straggler caught up after commit retries ran out.
            if record.phase == TxnPhase::Failed && record.participants.contains(&from) {
                record.acks.insert(from);
                if record.acks.len() == record.participants.len() {
                    record.phase = TxnPhase::Committed;
                    info!(txn = %txn_id, "late acks completed a failed commit");
                }
            }
            return;
        }
        let Some(record) = self.active.get_mut(&txn_id) else {
            return;
        };
        if record.phase != TxnPhase::Committing || !record.participants.contains(&from) {
            return;
        }
        record.acks.insert(from);
        if record.acks.len() == record.participants.len() {
            record.phase = TxnPhase::Committed;
            info!(txn = %txn_id, "committed on all participants");
            self.archive(txn_id);
        }
    }

    /// Drives vote timeouts, commit retransmission, and the recovery deadline.
    pub fn tick(&mut self, now: Instant) -> Vec<Message> {
        let mut messages = Vec::new();
        let due: Vec<TxnId> = self
            .active
            .values()
            .filter(|record| now >= record.deadline)
            .map(|record| record.txn_id)
            .collect();

        for txn_id in due {
            let Some(record) = self.active.get_mut(&txn_id) else {
                continue;
            };
            match record.phase {
                TxnPhase::Init | TxnPhase::Preparing | TxnPhase::Prepared => {
                    let missing: Vec<PeerId> = record
                        .participants
                        .iter()
                        .copied()
                        .filter(|peer| !record.votes.contains_key(peer))
                        .collect();
                    warn!(txn = %txn_id, missing = ?missing, "vote timeout, aborting");
                    messages.extend(self.abort(txn_id));
                }
                TxnPhase::Committing if record.retries < self.max_retries => {
                    record.retries += 1;
                    record.deadline = now + self.timeout;
                    let unacked: Vec<PeerId> = record
                        .participants
                        .iter()
                        .copied()
                        .filter(|peer| !record.acks.contains(peer))
                        .collect();
                    warn!(txn = %txn_id, attempt = record.retries, unacked = ?unacked, "resending commit");
                    messages.extend(
                        unacked
                            .into_iter()
                            .map(|peer| Message::new(self.local, peer, Payload::Commit { txn_id })),
                    );
                }
                TxnPhase::Committing => {
                    record.phase = TxnPhase::Failed;
                    error!(txn = %txn_id, acks = ?record.acks, "commit never acknowledged by all participants");
                    self.archive(txn_id);
                }
                TxnPhase::Committed | TxnPhase::Aborted | TxnPhase::Failed => {
                    self.archive(txn_id);
                }
            }
        }

        if self
            .recovery
            .as_ref()
            .is_some_and(|round| now >= round.deadline)
        {
            messages.extend(self.resolve_recovery(now));
        }
        messages
    }

    /// Asks `live` peers (ourselves included) what they know about
    /// transactions coordinated by `suspects`.
    pub fn start_recovery(
        &mut self,
        suspects: BTreeSet<PeerId>,
        live: BTreeSet<PeerId>,
        now: Instant,
    ) -> Vec<Message> {
        if suspects.is_empty() {
            return Vec::new();
        }
        info!(suspects = ?suspects, "re-driving transactions of unreachable coordinators");
        let messages = live
            .iter()
            .map(|peer| {
                Message::new(
                    self.local,
                    *peer,
                    Payload::RecoveryQuery {
                        suspects: suspects.clone(),
                    },
                )
            })
            .collect();
        self.recovery = Some(RecoveryRound {
            suspects,
            awaiting: live,
            reports: BTreeMap::new(),
            deadline: now + self.timeout,
        });
        messages
    }

    pub fn on_recovery_report(
        &mut self,
        from: PeerId,
        records: Vec<ParticipantRecord>,
        now: Instant,
    ) -> Vec<Message> {
        let Some(round) = self.recovery.as_mut() else {
            debug!(peer = from, "recovery report outside a round");
            return Vec::new();
        };
        round.awaiting.remove(&from);
        for record in records {
            if !round.suspects.contains(&record.coordinator) {
                continue;
            }
            let entry = round.reports.entry(record.txn_id).or_insert_with(|| InDoubt {
                participants: BTreeSet::new(),
                write: None,
                states: BTreeMap::new(),
            });
            entry.participants.extend(record.participants.iter().copied());
            if entry.write.is_none() {
                entry.write = record.write.clone();
            }
            entry.states.insert(from, record.state);
        }
        if round.awaiting.is_empty() {
            return self.resolve_recovery(now);
        }
        Vec::new()
    }

    pub fn take_decisions(&mut self) -> Vec<Decision> {
        std::mem::take(&mut self.decisions)
    }

    pub fn record(&self, txn_id: TxnId) -> Option<&TransactionRecord> {
        self.active.get(&txn_id).or_else(|| self.archive.get(&txn_id))
    }

    /// Transactions not yet in a terminal phase.
    pub fn in_flight(&self) -> Vec<TxnId> {
        self.active.keys().copied().collect()
    }

    pub fn is_recovering(&self) -> bool {
        self.recovery.is_some()
    }

    fn resolve_recovery(&mut self, now: Instant) -> Vec<Message> {
        let Some(round) = self.recovery.take() else {
            return Vec::new();
        };
        if !round.awaiting.is_empty() {
            warn!(missing = ?round.awaiting, "recovery deadline passed without every report");
        }

        let mut messages = Vec::new();
        for (txn_id, doubt) in round.reports {
            if self.record(txn_id).is_some() {
                continue;
            }
            let any_prepared = doubt
                .states
                .values()
                .any(|state| *state == ParticipantState::Prepared);
            if !any_prepared {
                continue;
            }
            let any_committed = doubt
                .states
                .values()
                .any(|state| *state == ParticipantState::Committed);
            let any_refused = doubt.states.values().any(|state| {
                matches!(
                    state,
                    ParticipantState::Aborted | ParticipantState::Failed | ParticipantState::Init
                )
            });
            let all_prepared = !doubt.participants.is_empty()
                && doubt.participants.iter().all(|peer| {
                    doubt.states.get(peer) == Some(&ParticipantState::Prepared)
                });
            let commit = any_committed || (!any_refused && all_prepared);

            let Some(write) = doubt.write else {
                // Only reachable when every reporter already discarded the write.
                continue;
            };
            info!(txn = %txn_id, commit, states = ?doubt.states, "re-driving in-doubt transaction");
            let votes = doubt
                .states
                .iter()
                .map(|(peer, state)| {
                    let vote = match state {
                        ParticipantState::Prepared | ParticipantState::Committed => Vote::Yes,
                        _ => Vote::No,
                    };
                    (*peer, vote)
                })
                .collect();
            let acks = doubt
                .states
                .iter()
                .filter(|(_, state)| **state == ParticipantState::Committed)
                .map(|(peer, _)| *peer)
                .collect();
            self.active.insert(
                txn_id,
                TransactionRecord {
                    txn_id,
                    participants: doubt.participants,
                    phase: TxnPhase::Prepared,
                    votes,
                    write,
                    acks,
                    recovered: true,
                    deadline: now + self.timeout,
                    retries: 0,
                },
            );
            messages.extend(if commit {
                self.commit(txn_id, now)
            } else {
                self.abort(txn_id)
            });
        }
        messages
    }

    fn commit(&mut self, txn_id: TxnId, now: Instant) -> Vec<Message> {
        let Some(record) = self.active.get_mut(&txn_id) else {
            return Vec::new();
        };
        record.phase = TxnPhase::Committing;
        record.deadline = now + self.timeout;
        info!(txn = %txn_id, "decided commit");
        let messages = record
            .participants
            .iter()
            .filter(|peer| !record.acks.contains(*peer))
            .map(|peer| Message::new(self.local, *peer, Payload::Commit { txn_id }))
            .collect();
        self.decisions.push(Decision {
            txn_id,
            committed: true,
        });
        messages
    }

    /// Sends `Abort` to every participant that did not vote `No`.
    fn abort(&mut self, txn_id: TxnId) -> Vec<Message> {
        let Some(record) = self.active.get_mut(&txn_id) else {
            return Vec::new();
        };
        record.phase = TxnPhase::Aborted;
        info!(txn = %txn_id, "decided abort");
        let messages = record
            .participants
            .iter()
            .filter(|peer| record.votes.get(*peer) != Some(&Vote::No))
            .map(|peer| Message::new(self.local, *peer, Payload::Abort { txn_id }))
            .collect();
        self.decisions.push(Decision {
            txn_id,
            committed: false,
        });
        self.archive(txn_id);
        messages
    }

    fn archive(&mut self, txn_id: TxnId) {
        let Some(record) = self.active.remove(&txn_id) else {
            return;
        };
        self.archive.insert(txn_id, record);
        self.archive_order.push_back(txn_id);
        while self.archive_order.len() > RETAINED_FINISHED {
            if let Some(old) = self.archive_order.pop_front() {
                self.archive.remove(&old);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Version;

    fn write() -> WriteOp {
        WriteOp {
            key: "k".into(),
            value: Some("v".into()),
            version: Version {
                timestamp: 1,
                origin: 1,
            },
        }
    }

    fn kinds(messages: &[Message]) -> Vec<(PeerId, &'static str)> {
        messages.iter().map(|m| (m.to, m.payload.kind())).collect()
    }

    #[test]
    fn all_yes_commits_and_acks_complete() {
        let mut coordinator = Coordinator::new(1, &Tuning::default());
        let now = Instant::now();
        let (txn, prepares) = coordinator.begin(BTreeSet::from([1, 2, 3]), write(), now);
        assert_eq!(kinds(&prepares), vec![(1, "prepare"), (2, "prepare"), (3, "prepare")]);

        assert!(coordinator.on_vote(1, txn, Vote::Yes, now).is_empty());
        assert!(coordinator.on_vote(2, txn, Vote::Yes, now).is_empty());
        let commits = coordinator.on_vote(3, txn, Vote::Yes, now);
        assert_eq!(kinds(&commits), vec![(1, "commit"), (2, "commit"), (3, "commit")]);
        assert_eq!(
            coordinator.take_decisions(),
            vec![Decision {
                txn_id: txn,
                committed: true
            }]
        );

        for peer in 1..=3 {
            coordinator.on_ack(peer, txn);
        }
        let record = coordinator.record(txn).expect("archived");
        assert_eq!(record.phase, TxnPhase::Committed);
        assert!(coordinator.in_flight().is_empty());
    }

    #[test]
    fn missing_vote_times_out_to_abort() {
        let mut coordinator = Coordinator::new(1, &Tuning::default());
        let now = Instant::now();
        let (txn, _) = coordinator.begin(BTreeSet::from([1, 2, 3]), write(), now);
        coordinator.on_vote(1, txn, Vote::Yes, now);
        coordinator.on_vote(2, txn, Vote::Yes, now);

        let aborts = coordinator.tick(now + Tuning::default().commit_timeout);
        assert_eq!(kinds(&aborts), vec![(1, "abort"), (2, "abort"), (3, "abort")]);
        assert_eq!(coordinator.record(txn).map(|r| r.phase), Some(TxnPhase::Aborted));
        assert!(!coordinator.take_decisions()[0].committed);

        // A vote that shows up late is answered with the decision.
        let late = coordinator.on_vote(3, txn, Vote::Yes, now);
        assert_eq!(kinds(&late), vec![(3, "abort")]);
    }

    #[test]
    fn unacked_commit_is_retried_then_failed() {
        let tuning = Tuning::default();
        let mut coordinator = Coordinator::new(1, &tuning);
        let mut now = Instant::now();
        let (txn, _) = coordinator.begin(BTreeSet::from([1, 2]), write(), now);
        coordinator.on_vote(1, txn, Vote::Yes, now);
        coordinator.on_vote(2, txn, Vote::Yes, now);
        coordinator.on_ack(1, txn);

        for _ in 0..tuning.commit_retries {
            now += tuning.commit_timeout;
            let resent = coordinator.tick(now);
            assert_eq!(kinds(&resent), vec![(2, "commit")]);
        }
        now += tuning.commit_timeout;
        assert!(coordinator.tick(now).is_empty());
        let record = coordinator.record(txn).expect("archived");
        assert_eq!(record.phase, TxnPhase::Failed);
        assert_eq!(record.outcome(), Some(true));

        // The straggler asks again once reachable and still gets the commit.
        let answer = coordinator.on_vote(2, txn, Vote::Yes, now);
        assert_eq!(kinds(&answer), vec![(2, "commit")]);
        coordinator.on_ack(2, txn);
        assert_eq!(coordinator.record(txn).map(|r| r.phase), Some(TxnPhase::Committed));
        assert!(coordinator.on_vote(2, txn, Vote::Yes, now).is_empty());
    }

    #[test]
    fn no_vote_aborts_only_the_yes_voters() {
        let mut coordinator = Coordinator::new(1, &Tuning::default());
        let now = Instant::now();
        let (txn, _) = coordinator.begin(BTreeSet::from([1, 2, 3]), write(), now);

        assert!(coordinator.on_vote(1, txn, Vote::Yes, now).is_empty());
        assert!(coordinator.on_vote(2, txn, Vote::Yes, now).is_empty());
        let aborts = coordinator.on_vote(3, txn, Vote::No, now);

        assert_eq!(kinds(&aborts), vec![(1, "abort"), (2, "abort")]);
        assert_eq!(coordinator.record(txn).map(|r| r.phase), Some(TxnPhase::Aborted));
        assert_eq!(
            coordinator.take_decisions(),
            vec![Decision {
                txn_id: txn,
                committed: false
            }]
        );
        assert!(coordinator.in_flight().is_empty());

        // A repeated No gets nothing back; the No voter already discarded its state.
        assert!(coordinator.on_vote(3, txn, Vote::No, now).is_empty());
    }

    fn report(
        txn_id: TxnId,
        coordinator: PeerId,
        state: ParticipantState,
    ) -> ParticipantRecord {
        ParticipantRecord {
            txn_id,
            coordinator,
            participants: BTreeSet::from([1, 2, 3]),
            state,
            write: Some(write()),
        }
    }

    #[test]
    fn recovery_commits_when_anyone_committed() {
        let mut coordinator = Coordinator::new(2, &Tuning::default());
        let now = Instant::now();
        let txn = Uuid::new_v4();
        let queries = coordinator.start_recovery(BTreeSet::from([3]), BTreeSet::from([1, 2]), now);
        assert_eq!(kinds(&queries), vec![(1, "recovery_query"), (2, "recovery_query")]);

        assert!(coordinator
            .on_recovery_report(1, vec![report(txn, 3, ParticipantState::Prepared)], now)
            .is_empty());
        let decided =
            coordinator.on_recovery_report(2, vec![report(txn, 3, ParticipantState::Committed)], now);
        // Peer 2 already committed, so it is not asked again.
        assert_eq!(kinds(&decided), vec![(1, "commit"), (3, "commit")]);
        assert!(coordinator.record(txn).is_some_and(|r| r.recovered));
        assert!(!coordinator.is_recovering());
    }

    #[test]
    fn recovery_aborts_when_a_participant_is_silent() {
        let mut coordinator = Coordinator::new(2, &Tuning::default());
        let now = Instant::now();
        let txn = Uuid::new_v4();
        coordinator.start_recovery(BTreeSet::from([3]), BTreeSet::from([1, 2]), now);
        coordinator.on_recovery_report(1, vec![report(txn, 3, ParticipantState::Prepared)], now);
        let decided =
            coordinator.on_recovery_report(2, vec![report(txn, 3, ParticipantState::Prepared)], now);
        assert_eq!(kinds(&decided), vec![(1, "abort"), (2, "abort"), (3, "abort")]);
        assert_eq!(coordinator.record(txn).map(|r| r.phase), Some(TxnPhase::Aborted));
    }

    #[test]
    fn recovery_resolves_at_deadline_with_partial_reports() {
        let mut coordinator = Coordinator::new(2, &Tuning::default());
        let now = Instant::now();
        let txn = Uuid::new_v4();
        coordinator.start_recovery(BTreeSet::from([3]), BTreeSet::from([1, 2]), now);
        coordinator.on_recovery_report(2, vec![report(txn, 3, ParticipantState::Committed)], now);
        coordinator.on_recovery_report(2, vec![report(txn, 3, ParticipantState::Committed)], now);
        assert!(coordinator.is_recovering());

        // Peer 2 committed but reported nothing prepared; nothing left to decide.
        let late = coordinator.tick(now + Tuning::default().commit_timeout);
        assert!(late.is_empty());
        assert!(!coordinator.is_recovering());
        assert!(coordinator.record(txn).is_none());
    }
}
