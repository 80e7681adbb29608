//! In-process cluster harness shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use futures_util::future::join_all;
use replicated_kv::cluster::PeerId;
use replicated_kv::config::{NodeConfig, Tuning};
use replicated_kv::election::ElectionPhase;
use replicated_kv::runtime::{NodeHandle, spawn_node};
use replicated_kv::transport::MemoryNetwork;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A cluster of real node workers talking over a [`MemoryNetwork`].
pub struct TestCluster {
    pub network: MemoryNetwork,
    handles: BTreeMap<PeerId, NodeHandle>,
}

impl TestCluster {
    /// Spawns nodes `1..=n` with short test timeouts.
    pub fn spawn(n: u64) -> Result<Self> {
        let network = MemoryNetwork::new();
        let peers: BTreeMap<PeerId, String> = (1..=n).map(|id| (id, format!("mem:{id}"))).collect();

        // Join everyone before any worker starts sending.
        let joined: Vec<_> = (1..=n).map(|id| (id, network.join(id))).collect();

        let mut handles = BTreeMap::new();
        for (id, (transport, inbox)) in joined {
            let config = NodeConfig::new(id, format!("mem:{id}"), peers.clone()).with_tuning(Tuning::fast());
            handles.insert(id, spawn_node(&config, transport, inbox)?);
        }
        Ok(Self { network, handles })
    }

    pub fn node(&self, id: PeerId) -> &NodeHandle {
        &self.handles[&id]
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.handles.keys().copied().collect()
    }

    /// Cuts `id` off the network and stops its worker.
    pub fn crash(&mut self, id: PeerId) {
        self.network.crash(id);
        if let Some(handle) = self.handles.remove(&id) {
            handle.shutdown();
        }
    }

    /// Waits until exactly one running node is leader and every other running
    /// node among `among` follows it.
    pub async fn wait_for_leader_among(&self, among: &[PeerId], timeout: Duration) -> Result<PeerId> {
        let start = Instant::now();
        loop {
            if start.elapsed() > timeout {
                bail!("timeout waiting for leader election");
            }

            let statuses = join_all(among.iter().map(|id| self.node(*id).status())).await;
            let mut leaders = Vec::new();
            let mut followed = Vec::new();
            for (id, status) in among.iter().zip(statuses) {
                let status = status?;
                if status.phase == ElectionPhase::Leader {
                    leaders.push(*id);
                }
                followed.push(status.leader);
            }

            if let [leader] = leaders[..] {
                if followed.iter().all(|seen| *seen == Some(leader)) {
                    return Ok(leader);
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<PeerId> {
        self.wait_for_leader_among(&self.ids(), timeout).await
    }

    /// Waits until every running node sees all of `suspects` as unreachable.
    pub async fn wait_for_suspicion(&self, observers: &[PeerId], suspects: &[PeerId]) -> Result<()> {
        wait_until(TIMEOUT, move || async move {
            for id in observers {
                let status = self.node(*id).status().await?;
                let unreachable = status
                    .peers
                    .iter()
                    .filter(|peer| suspects.contains(&peer.id))
                    .all(|peer| !peer.state.is_live());
                if !unreachable {
                    return Ok(false);
                }
            }
            Ok(true)
        })
        .await
    }

    pub fn shutdown(&self) {
        for handle in self.handles.values() {
            handle.shutdown();
        }
    }
}

/// Polls `check` until it returns `true` or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    loop {
        if check().await? {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
