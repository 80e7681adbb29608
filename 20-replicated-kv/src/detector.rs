//! Heartbeat-based failure detection.
//!
//! The detector cannot tell a crashed peer from a partitioned one, so its
//! verdicts mean "unreachable right now". A suspected peer is re-admitted as
//! soon as one of its heartbeats arrives.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::cluster::{ClusterView, PeerId, PeerState};
use crate::config::Tuning;

pub struct FailureDetector {
    cluster: ClusterView,
    timeout: Duration,
    failed_after: Duration,
    interval: Duration,
    /// Last heartbeat seen per peer.
    last_seen: HashMap<PeerId, Instant>,
    next_heartbeat: Instant,
}

impl FailureDetector {
    /// Every peer starts with a full timeout of grace from `now`.
    pub fn new(cluster: ClusterView, tuning: &Tuning, now: Instant) -> Self {
        let last_seen = cluster.others().into_iter().map(|id| (id, now)).collect();
        Self {
            cluster,
            timeout: tuning.failure_timeout,
            failed_after: tuning.failed_after,
            interval: tuning.heartbeat_interval,
            last_seen,
            next_heartbeat: now,
        }
    }

    /// Records a heartbeat from `peer`.
    ///
    /// Returns `true` if the peer was suspected or failed and is now alive again.
    pub fn record_heartbeat(&mut self, peer: PeerId, now: Instant) -> bool {
        if peer == self.cluster.local() || !self.cluster.contains(peer) {
            return false;
        }
        self.last_seen.insert(peer, now);
        match self.cluster.set_state(peer, PeerState::Alive) {
            Some(PeerState::Suspected | PeerState::Failed) => {
                info!(peer = %peer, "peer is reachable again");
                true
            }
            _ => false,
        }
    }

    /// Returns every peer whose last heartbeat is older than the timeout,
    /// updating the shared peer table on the way.
    pub fn check_failures(&mut self, now: Instant) -> BTreeSet<PeerId> {
        let mut unreachable = BTreeSet::new();
        for (&peer, &seen) in &self.last_seen {
            let silence = now.saturating_duration_since(seen);
            if silence <= self.timeout {
                continue;
            }
            unreachable.insert(peer);
            let verdict = if silence > self.failed_after {
                PeerState::Failed
            } else {
                PeerState::Suspected
            };
            let previous = self.cluster.set_state(peer, verdict);
            if previous != Some(verdict) {
                let silence_ms = silence.as_millis() as u64;
                warn!(peer = %peer, silence_ms, state = %verdict, "peer unreachable");
            }
        }
        unreachable
    }

    pub fn is_suspected(&self, peer: PeerId) -> bool {
        !self.cluster.is_live(peer)
    }

    /// Returns `true` when it is time to broadcast a heartbeat, and schedules the next one.
    pub fn poll_heartbeats(&mut self, now: Instant) -> bool {
        if now < self.next_heartbeat {
            return false;
        }
        self.next_heartbeat = now + self.interval;
        true
    }

    pub fn last_seen(&self, peer: PeerId) -> Option<Instant> {
        self.last_seen.get(&peer).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(timeout_ms: u64, interval_ms: u64) -> (FailureDetector, ClusterView, Instant) {
        let cluster = ClusterView::new(1, (1..=3).map(|id| (id, format!("n{id}")))).expect("cluster");
        let tuning = Tuning {
            failure_timeout: Duration::from_millis(timeout_ms),
            heartbeat_interval: Duration::from_millis(interval_ms),
            failed_after: Duration::from_millis(timeout_ms * 3),
            ..Tuning::default()
        };
        let start = Instant::now();
        (FailureDetector::new(cluster.clone(), &tuning, start), cluster, start)
    }

    #[test]
    fn silent_peer_is_suspected_then_failed() {
        let (mut detector, cluster, start) = setup(300, 100);
        let ms = Duration::from_millis;

        for step in 1..=9 {
            let now = start + ms(step * 100);
            detector.record_heartbeat(2, now);
            let failures = detector.check_failures(now);
            if step * 100 <= 300 {
                assert!(failures.is_empty(), "no suspicion inside the grace period");
            }
        }

        let failures = detector.check_failures(start + ms(901));
        assert_eq!(failures, BTreeSet::from([3]));
        assert_eq!(cluster.state(3), Some(PeerState::Failed));
        assert_eq!(cluster.state(2), Some(PeerState::Alive));
        assert!(detector.is_suspected(3));
        assert!(!detector.is_suspected(2));
    }

    #[test]
    fn suspicion_lifts_on_next_heartbeat() {
        let (mut detector, cluster, start) = setup(300, 100);
        let later = start + Duration::from_millis(400);

        assert_eq!(detector.check_failures(later), BTreeSet::from([2, 3]));
        assert_eq!(cluster.state(2), Some(PeerState::Suspected));

        assert!(detector.record_heartbeat(2, later));
        assert!(!detector.record_heartbeat(2, later), "already alive");
        assert_eq!(cluster.state(2), Some(PeerState::Alive));
        assert_eq!(detector.check_failures(later), BTreeSet::from([3]));
    }

    #[test]
    fn one_lost_heartbeat_never_causes_suspicion() {
        // Heartbeats every h = 100ms, timeout 250ms > 2h, every third heartbeat lost.
        let (mut detector, _cluster, start) = setup(250, 100);
        for beat in 1..=60u64 {
            let now = start + Duration::from_millis(beat * 100);
            if beat % 3 != 0 {
                detector.record_heartbeat(2, now);
                detector.record_heartbeat(3, now);
            }
            // Check just before the next heartbeat is due, the worst moment.
            let probe = now + Duration::from_millis(99);
            assert!(
                detector.check_failures(probe).is_empty(),
                "peer suspected at beat {beat}"
            );
        }
    }

    #[test]
    fn heartbeats_are_paced_by_interval() {
        let (mut detector, _cluster, start) = setup(300, 100);
        assert!(detector.poll_heartbeats(start));
        assert!(!detector.poll_heartbeats(start + Duration::from_millis(50)));
        assert!(detector.poll_heartbeats(start + Duration::from_millis(100)));
        assert!(!detector.poll_heartbeats(start + Duration::from_millis(150)));
    }

    #[test]
    fn ignores_self_and_strangers() {
        let (mut detector, _cluster, start) = setup(300, 100);
        assert!(!detector.record_heartbeat(1, start));
        assert!(!detector.record_heartbeat(42, start));
        assert!(detector.last_seen(42).is_none());
    }
}
