use thiserror::Error;

use crate::cluster::PeerId;
use crate::message::TxnId;

/// Errors returned to key-value clients.
///
/// Setup and I/O failures use `anyhow` instead; these are the outcomes a
/// caller is expected to handle, usually by retrying elsewhere or later.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvError {
    /// Strong writes must be coordinated by the leader.
    #[error("not the leader (current leader: {leader:?})")]
    NotLeader { leader: Option<PeerId> },
    #[error("no quorum: {live} of {size} peers reachable")]
    NoQuorum { live: usize, size: usize },
    #[error("transaction {txn_id} aborted")]
    Aborted { txn_id: TxnId },
    #[error("node is shut down")]
    Shutdown,
}
