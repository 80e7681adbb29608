//! Replicated key-value store with leader election and two-phase commit.
//!
//! Every node keeps a full copy of the store. Writes come in two flavours:
//!
//! - **Strong** writes go through the elected leader, which runs a two-phase
//!   commit across every live replica. A write only succeeds once all of them
//!   vote yes, and only while a majority of the cluster is reachable.
//! - **Eventual** writes are applied locally and spread by gossip. Replicas
//!   converge with last-writer-wins on a per-key version.
//!
//! # Architecture
//!
//! The protocol layer is a set of synchronous state machines that take the
//! current time and return the messages to send:
//!
//! - [`detector`]: heartbeat failure detector, the only writer of peer liveness
//! - [`gossip`]: fanout dissemination with acks and retransmission
//! - [`election`]: bully election gated on a live majority
//! - [`commit`]: two-phase commit coordinator and participant, plus the
//!   recovery round a new leader runs for in-doubt transactions
//!
//! [`node::Node`] ties them together and is the only thing the runtime talks
//! to. [`runtime`] runs one node per tokio task over a [`transport`], either
//! the in-memory network used by tests or TCP with JSON lines.
//!
//! # Modules
//!
//! - [`cluster`]: membership and the shared liveness view
//! - [`config`]: node identity, peer map and timing
//! - [`message`]: wire messages
//! - [`store`]: versioned in-memory key-value map
//! - [`protocol`]: REPL command parsing
//! - [`error`]: errors returned to clients

pub mod cluster;
pub mod commit;
pub mod config;
pub mod detector;
pub mod election;
pub mod error;
pub mod gossip;
pub mod message;
pub mod node;
pub mod protocol;
pub mod runtime;
pub mod store;
pub mod transport;
