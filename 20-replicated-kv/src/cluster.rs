//! Shared view of cluster membership and peer liveness.
//!
//! Membership is fixed at startup. Every component receives a clone of the
//! same [`ClusterView`] handle; only the failure detector changes peer states.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

/// Stable peer identity. The id doubles as the election rank.
pub type PeerId = u64;

/// Liveness verdict for a peer, as seen by the local failure detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    Alive,
    /// Currently unreachable. May come back at any time.
    Suspected,
    /// Suspected for long enough that we stopped expecting it soon.
    Failed,
}

impl PeerState {
    pub fn is_live(self) -> bool {
        self == PeerState::Alive
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Alive => write!(f, "alive"),
            PeerState::Suspected => write!(f, "suspected"),
            PeerState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: PeerId,
    pub address: String,
    pub state: PeerState,
}

/// Handle to the local peer table.
///
/// Cloning is cheap and every clone observes the same table.
#[derive(Debug, Clone)]
pub struct ClusterView {
    local: PeerId,
    peers: Arc<RwLock<BTreeMap<PeerId, Peer>>>,
}

impl ClusterView {
    /// Builds the table from `(id, address)` pairs. The local node must be a member.
    pub fn new<I>(local: PeerId, members: I) -> Result<Self>
    where
        I: IntoIterator<Item = (PeerId, String)>,
    {
        let peers: BTreeMap<PeerId, Peer> = members
            .into_iter()
            .map(|(id, address)| {
                (
                    id,
                    Peer {
                        id,
                        address,
                        state: PeerState::Alive,
                    },
                )
            })
            .collect();
        ensure!(!peers.is_empty(), "cluster requires at least one peer");
        ensure!(
            peers.contains_key(&local),
            "local peer {local} missing from membership"
        );
        Ok(Self {
            local,
            peers: Arc::new(RwLock::new(peers)),
        })
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Number of configured peers, including the local one.
    pub fn size(&self) -> usize {
        self.read().len()
    }

    /// Smallest number of peers that forms a majority.
    pub fn quorum(&self) -> usize {
        self.size() / 2 + 1
    }

    /// All configured peer ids in rank order, including the local one.
    pub fn ids(&self) -> Vec<PeerId> {
        self.read().keys().copied().collect()
    }

    /// Configured peers other than the local one.
    pub fn others(&self) -> Vec<PeerId> {
        self.read()
            .keys()
            .copied()
            .filter(|id| *id != self.local)
            .collect()
    }

    /// Peers other than the local one that are currently believed reachable.
    pub fn live_others(&self) -> Vec<PeerId> {
        self.read()
            .values()
            .filter(|peer| peer.id != self.local && peer.state.is_live())
            .map(|peer| peer.id)
            .collect()
    }

    /// Peers currently suspected or failed.
    pub fn unreachable(&self) -> Vec<PeerId> {
        self.read()
            .values()
            .filter(|peer| !peer.state.is_live())
            .map(|peer| peer.id)
            .collect()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn state(&self, id: PeerId) -> Option<PeerState> {
        self.read().get(&id).map(|peer| peer.state)
    }

    /// The local peer is always considered live.
    pub fn is_live(&self, id: PeerId) -> bool {
        id == self.local || self.state(id).is_some_and(PeerState::is_live)
    }

    pub fn address(&self, id: PeerId) -> Option<String> {
        self.read().get(&id).map(|peer| peer.address.clone())
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        self.read().values().cloned().collect()
    }

    /// Updates a peer's state and returns the previous one.
    ///
    /// Restricted to the crate so that only the failure detector drives it.
    pub(crate) fn set_state(&self, id: PeerId, state: PeerState) -> Option<PeerState> {
        let mut peers = self.write();
        let peer = peers.get_mut(&id)?;
        let previous = peer.state;
        peer.state = state;
        Some(previous)
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<PeerId, Peer>> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<PeerId, Peer>> {
        self.peers.write().unwrap_or_else(PoisonError::into_inner)
    }
}
