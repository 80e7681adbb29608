//! Node configuration: identity, membership, and protocol timing.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};

use crate::cluster::{ClusterView, PeerId};

/// Longest duration any timing knob may take. Deadlines are computed as
/// `Instant + Duration`, which panics on overflow.
pub const MAX_DURATION: Duration = Duration::from_secs(3600);

/// Timing and sizing knobs shared by every protocol component.
#[derive(Debug, Clone)]
pub struct Tuning {
    /// How often heartbeats are broadcast.
    pub heartbeat_interval: Duration,
    /// Silence after which a peer is suspected. Must be at least twice the
    /// heartbeat interval so a single lost heartbeat never triggers suspicion.
    pub failure_timeout: Duration,
    /// Silence after which a suspected peer is reported as failed.
    pub failed_after: Duration,
    /// How long a candidate collects votes before deciding.
    pub election_timeout: Duration,
    /// Upper bound of the random delay before retrying an election without a majority.
    pub election_backoff: Duration,
    /// How long the coordinator waits for votes, and between commit retransmissions.
    pub commit_timeout: Duration,
    /// Commit retransmissions before a transaction is marked failed.
    pub commit_retries: u32,
    /// How long a strong read waits for replicas.
    pub read_timeout: Duration,
    pub gossip_fanout: usize,
    /// Interval between origin retransmissions to unacknowledged peers.
    pub gossip_interval: Duration,
    /// How long the origin keeps retransmitting.
    pub gossip_retransmit_window: Duration,
    /// How long a gossip record is remembered for duplicate suppression.
    pub gossip_record_ttl: Duration,
    /// Granularity of the runtime's timer.
    pub tick_interval: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        let failure_timeout = Duration::from_millis(1000);
        Self {
            heartbeat_interval: failure_timeout / 2,
            failure_timeout,
            failed_after: failure_timeout * 5,
            election_timeout: Duration::from_millis(1000),
            election_backoff: Duration::from_millis(500),
            commit_timeout: Duration::from_millis(1000),
            commit_retries: 3,
            read_timeout: Duration::from_millis(500),
            gossip_fanout: 3,
            gossip_interval: Duration::from_millis(250),
            gossip_retransmit_window: Duration::from_secs(5),
            gossip_record_ttl: Duration::from_secs(60),
            tick_interval: Duration::from_millis(50),
        }
    }
}

impl Tuning {
    /// Short timeouts for in-process clusters in tests.
    pub fn fast() -> Self {
        let failure_timeout = Duration::from_millis(150);
        Self {
            heartbeat_interval: failure_timeout / 2,
            failure_timeout,
            failed_after: failure_timeout * 4,
            election_timeout: Duration::from_millis(150),
            election_backoff: Duration::from_millis(100),
            commit_timeout: Duration::from_millis(200),
            commit_retries: 3,
            read_timeout: Duration::from_millis(150),
            gossip_fanout: 3,
            gossip_interval: Duration::from_millis(40),
            gossip_retransmit_window: Duration::from_secs(2),
            gossip_record_ttl: Duration::from_secs(30),
            tick_interval: Duration::from_millis(10),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in self.durations() {
            ensure!(
                value <= MAX_DURATION,
                "{name} ({value:?}) exceeds the maximum of {MAX_DURATION:?}"
            );
        }
        ensure!(
            !self.heartbeat_interval.is_zero(),
            "heartbeat interval must be positive"
        );
        ensure!(
            self.failure_timeout >= self.heartbeat_interval * 2,
            "failure timeout ({:?}) must be at least twice the heartbeat interval ({:?})",
            self.failure_timeout,
            self.heartbeat_interval
        );
        ensure!(
            self.failed_after >= self.failure_timeout,
            "failed-after must not be shorter than the failure timeout"
        );
        ensure!(
            !self.election_timeout.is_zero(),
            "election timeout must be positive"
        );
        ensure!(
            !self.commit_timeout.is_zero(),
            "commit timeout must be positive"
        );
        ensure!(self.gossip_fanout >= 1, "gossip fanout must be at least 1");
        ensure!(
            !self.tick_interval.is_zero(),
            "tick interval must be positive"
        );
        Ok(())
    }

    fn durations(&self) -> [(&'static str, Duration); 11] {
        [
            ("heartbeat interval", self.heartbeat_interval),
            ("failure timeout", self.failure_timeout),
            ("failed-after", self.failed_after),
            ("election timeout", self.election_timeout),
            ("election backoff", self.election_backoff),
            ("commit timeout", self.commit_timeout),
            ("read timeout", self.read_timeout),
            ("gossip interval", self.gossip_interval),
            ("gossip retransmit window", self.gossip_retransmit_window),
            ("gossip record ttl", self.gossip_record_ttl),
            ("tick interval", self.tick_interval),
        ]
    }
}

/// Everything needed to start one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's id (must appear in `peers`).
    pub id: PeerId,
    /// Address to bind for incoming peer messages, e.g. "127.0.0.1:7101".
    pub listen_addr: String,
    /// Map of peer id to address for all cluster members, including self.
    pub peers: BTreeMap<PeerId, String>,
    pub tuning: Tuning,
}

impl NodeConfig {
    pub fn new(id: PeerId, listen_addr: impl Into<String>, peers: BTreeMap<PeerId, String>) -> Self {
        Self {
            id,
            listen_addr: listen_addr.into(),
            peers,
            tuning: Tuning::default(),
        }
    }

    pub fn with_tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.peers.is_empty(), "peer map must not be empty");
        ensure!(
            self.peers.contains_key(&self.id),
            "node id {} missing from peer map",
            self.id
        );
        self.tuning.validate()
    }

    pub fn cluster_view(&self) -> Result<ClusterView> {
        self.validate()?;
        ClusterView::new(
            self.id,
            self.peers.iter().map(|(id, addr)| (*id, addr.clone())),
        )
    }
}

/// Parses `id=addr` peer specs as given on the command line.
pub fn parse_peers<S: AsRef<str>>(specs: &[S]) -> Result<BTreeMap<PeerId, String>> {
    let mut peers = BTreeMap::new();
    for spec in specs {
        let spec = spec.as_ref().trim();
        let (id, addr) = spec
            .split_once('=')
            .ok_or_else(|| anyhow!("peer spec '{spec}' must look like id=addr"))?;
        let id: PeerId = id
            .trim()
            .parse()
            .with_context(|| format!("invalid peer id in '{spec}'"))?;
        let addr = addr.trim();
        ensure!(!addr.is_empty(), "peer {id} has an empty address");
        ensure!(
            peers.insert(id, addr.to_string()).is_none(),
            "peer {id} listed twice"
        );
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_heartbeat_is_half_the_timeout() {
        let tuning = Tuning::default();
        assert_eq!(tuning.heartbeat_interval * 2, tuning.failure_timeout);
        assert_eq!(tuning.gossip_fanout, 3);
        assert!(tuning.validate().is_ok());
        assert!(Tuning::fast().validate().is_ok());
    }

    #[test]
    fn rejects_timeout_shorter_than_two_heartbeats() {
        let tuning = Tuning {
            heartbeat_interval: Duration::from_millis(400),
            failure_timeout: Duration::from_millis(700),
            ..Tuning::default()
        };
        assert!(tuning.validate().is_err());
    }

    #[test]
    fn rejects_durations_that_would_overflow_deadlines() {
        let tuning = Tuning {
            commit_timeout: Duration::from_millis(u64::MAX),
            ..Tuning::default()
        };
        assert!(tuning.validate().is_err());

        let tuning = Tuning {
            election_timeout: MAX_DURATION,
            ..Tuning::default()
        };
        assert!(tuning.validate().is_ok());
    }

    #[test]
    fn rejects_zero_fanout() {
        let tuning = Tuning {
            gossip_fanout: 0,
            ..Tuning::default()
        };
        assert!(tuning.validate().is_err());
    }

    #[test]
    fn parses_peer_specs() {
        let peers = parse_peers(&["1=127.0.0.1:7101", " 2 = 127.0.0.1:7102"]).expect("valid");
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[&2], "127.0.0.1:7102");

        assert!(parse_peers(&["1:127.0.0.1"]).is_err());
        assert!(parse_peers(&["x=127.0.0.1:1"]).is_err());
        assert!(parse_peers(&["1=a", "1=b"]).is_err());
        assert!(parse_peers(&["1="]).is_err());
    }

    #[test]
    fn node_must_be_a_member() {
        let peers = parse_peers(&["1=a", "2=b"]).expect("valid");
        assert!(NodeConfig::new(3, "c", peers.clone()).validate().is_err());
        let view = NodeConfig::new(2, "b", peers).cluster_view().expect("valid");
        assert_eq!(view.local(), 2);
        assert_eq!(view.size(), 2);
    }
}
