//! Two-phase commit.
//!
//! The coordinator collects binding votes and decides; participants hold a
//! locked tentative write between voting `Yes` and hearing the decision. When
//! a coordinator becomes unreachable mid-transaction, the current leader
//! gathers participant records and re-drives the decision.

mod coordinator;
mod participant;

pub use coordinator::{Coordinator, Decision, TransactionRecord, TxnPhase};
pub use participant::{Participant, ParticipantRecord, ParticipantState};

/// How many finished transactions each side remembers for late messages.
const RETAINED_FINISHED: usize = 1024;
