//! Messages exchanged between peers, and the newline-delimited JSON framing
//! used when they cross a socket.

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::cluster::PeerId;
use crate::commit::ParticipantRecord;

/// Longest frame accepted from a peer, newline included.
pub const MAX_FRAME_BYTES: u64 = 1 << 20;

pub type TxnId = Uuid;
pub type GossipId = Uuid;

/// A single addressed message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub from: PeerId,
    pub to: PeerId,
    pub payload: Payload,
    /// Milliseconds since the Unix epoch at the sender.
    pub timestamp: u64,
}

impl Message {
    pub fn new(from: PeerId, to: PeerId, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to,
            payload,
            timestamp: now_millis(),
        }
    }
}

/// Every kind of message the core understands.
///
/// Components match on this exhaustively, so a new variant fails to compile
/// until each handler decides what to do with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Heartbeat,
    Election,
    /// Election vote for the addressee.
    Vote,
    Victory,
    Prepare {
        txn_id: TxnId,
        participants: BTreeSet<PeerId>,
        write: WriteOp,
    },
    PrepareVote {
        txn_id: TxnId,
        vote: Vote,
    },
    Commit {
        txn_id: TxnId,
    },
    Abort {
        txn_id: TxnId,
    },
    CommitAck {
        txn_id: TxnId,
    },
    RecoveryQuery {
        suspects: BTreeSet<PeerId>,
    },
    RecoveryReport {
        records: Vec<ParticipantRecord>,
    },
    Gossip {
        message_id: GossipId,
        origin: PeerId,
        seen_by: BTreeSet<PeerId>,
        body: GossipBody,
    },
    GossipAck {
        message_id: GossipId,
    },
    ReadRequest {
        request_id: Uuid,
        key: String,
    },
    ReadReply {
        request_id: Uuid,
        entry: Option<Versioned>,
    },
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Heartbeat => "heartbeat",
            Payload::Election => "election",
            Payload::Vote => "vote",
            Payload::Victory => "victory",
            Payload::Prepare { .. } => "prepare",
            Payload::PrepareVote { .. } => "prepare_vote",
            Payload::Commit { .. } => "commit",
            Payload::Abort { .. } => "abort",
            Payload::CommitAck { .. } => "commit_ack",
            Payload::RecoveryQuery { .. } => "recovery_query",
            Payload::RecoveryReport { .. } => "recovery_report",
            Payload::Gossip { .. } => "gossip",
            Payload::GossipAck { .. } => "gossip_ack",
            Payload::ReadRequest { .. } => "read_request",
            Payload::ReadReply { .. } => "read_reply",
        }
    }
}

/// A participant's binding answer to `Prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    Yes,
    No,
}

/// Orders writes to the same key. Later timestamps win; the origin id breaks ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub timestamp: u64,
    pub origin: PeerId,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.timestamp, self.origin)
    }
}

/// A stored value with its version. `value: None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned {
    pub value: Option<String>,
    pub version: Version,
}

/// A put (`Some`) or delete (`None`) of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOp {
    pub key: String,
    pub value: Option<String>,
    pub version: Version,
}

/// What a gossip message carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GossipBody {
    Write(WriteOp),
    /// Opaque text with no side effect beyond being recorded.
    Note { text: String },
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(u128::from(u64::MAX)) as u64
}

/// Reads the next newline-terminated JSON message, skipping blank lines.
///
/// Returns `Ok(None)` at end of stream. A frame longer than
/// [`MAX_FRAME_BYTES`] is rejected as `InvalidData` so a misbehaving peer
/// cannot grow the buffer without bound.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut frame = Vec::new();
    loop {
        frame.clear();
        let bytes = (&mut *reader)
            .take(MAX_FRAME_BYTES)
            .read_until(b'\n', &mut frame)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }
        if bytes as u64 == MAX_FRAME_BYTES && !frame.ends_with(b"\n") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds {MAX_FRAME_BYTES} bytes"),
            ));
        }

        let end = frame
            .iter()
            .rposition(|byte| !matches!(byte, b'\n' | b'\r'))
            .map_or(0, |last| last + 1);
        if end == 0 {
            continue;
        }

        let parsed = serde_json::from_slice(&frame[..end]).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

/// Writes one message as a JSON line and flushes it.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut frame = serde_json::to_vec(message).map_err(to_io_error)?;
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
