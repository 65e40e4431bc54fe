//! Fixtures for testing Raft.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use bytes::Bytes;
use groupraft::async_trait::async_trait;
use groupraft::membership::Configuration;
use groupraft::membership::Group;
use groupraft::membership::Role;
use groupraft::raft::AppendEntriesRequest;
use groupraft::raft::AppendEntriesResponse;
use groupraft::raft::ClientWriteResponse;
use groupraft::raft::InstallSnapshotRequest;
use groupraft::raft::TimeoutNowRequest;
use groupraft::raft::VoteRequest;
use groupraft::raft::VoteResponse;
use groupraft::Config;
use groupraft::Raft;
use groupraft::RaftError;
use groupraft::RaftMetrics;
use groupraft::RaftNetwork;
use groupraft::ServerId;
use groupraft::State;
use memstore::MemStateMachine;
use memstore::MemStore;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// A concrete Raft type used during testing.
pub type MemRaft = Raft<RaftRouter, MemStore, MemStateMachine>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default().with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Build a test config with timeouts suited to an in-process cluster.
pub fn test_config() -> Config {
    Config::build("test".into())
        .election_timeout_min(150)
        .election_timeout_max(300)
        .heartbeat_interval(30)
        .validate()
        .expect("failed to build Raft config")
}

/// Build a Normal-phase configuration with the given voters.
pub fn voters(ids: &[ServerId]) -> Configuration {
    let mut configuration = Configuration::new();
    for id in ids {
        configuration.add(*id, Role::Voter, Role::Voter, Group::OLD).expect("duplicate voter id");
    }
    configuration
}

struct Node {
    raft: MemRaft,
    store: Arc<MemStore>,
    fsm: Arc<MemStateMachine>,
}

/// A type which emulates a network transport and implements the
/// `RaftNetwork` trait.
pub struct RaftRouter {
    /// The runtime config which all nodes are using.
    config: Arc<Config>,
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<ServerId, Node>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<ServerId>>,
}

impl RaftRouter {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
        })
    }

    /// Create and register a new Raft node bearing the given ID, booting
    /// with the given configuration.
    pub async fn new_raft_node(self: &Arc<Self>, id: ServerId, configuration: Configuration) {
        let store = Arc::new(MemStore::new(id, configuration));
        let fsm = Arc::new(MemStateMachine::new());
        let raft = Raft::new(id, self.config.clone(), self.clone(), store.clone(), fsm.clone());
        let mut rt = self.routing_table.write().await;
        rt.insert(id, Node { raft, store, fsm });
    }

    /// Get the Raft handle of the target node.
    pub async fn raft(&self, id: ServerId) -> MemRaft {
        let rt = self.routing_table.read().await;
        rt.get(&id).unwrap_or_else(|| panic!("node {} not found in routing table", id)).raft.clone()
    }

    async fn try_raft(&self, id: ServerId) -> Result<MemRaft> {
        let rt = self.routing_table.read().await;
        rt.get(&id)
            .map(|node| node.raft.clone())
            .ok_or_else(|| anyhow!("node {} not found in routing table", id))
    }

    /// Get the storage handle of the target node.
    pub async fn store(&self, id: ServerId) -> Arc<MemStore> {
        let rt = self.routing_table.read().await;
        rt.get(&id).unwrap_or_else(|| panic!("node {} not found in routing table", id)).store.clone()
    }

    /// Get the state-machine handle of the target node.
    pub async fn fsm(&self, id: ServerId) -> Arc<MemStateMachine> {
        let rt = self.routing_table.read().await;
        rt.get(&id).unwrap_or_else(|| panic!("node {} not found in routing table", id)).fsm.clone()
    }

    /// Isolate the network of the specified node.
    pub async fn isolate_node(&self, id: ServerId) {
        tracing::info!(id, "isolating node");
        self.isolated_nodes.write().await.insert(id);
    }

    /// Restore the network of the specified node.
    pub async fn restore_node(&self, id: ServerId) {
        tracing::info!(id, "restoring node");
        self.isolated_nodes.write().await.remove(&id);
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.read().await;
        rt.values().map(|node| node.raft.metrics().borrow().clone()).collect()
    }

    /// Get the ID of the current non-isolated leader, when one exists.
    pub async fn leader(&self) -> Option<ServerId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics().await.into_iter().find_map(|node| {
            if node.state == State::Leader && !isolated.contains(&node.id) {
                Some(node.id)
            } else {
                None
            }
        })
    }

    /// Wait until a non-isolated leader has been elected.
    pub async fn wait_for_leader(&self, timeout: Duration, msg: &str) -> ServerId {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader().await {
                return leader;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timeout waiting for a cluster leader: {}", msg);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait for the given nodes to reach the given applied index.
    pub async fn wait_for_applied(&self, ids: &[ServerId], want: u64, msg: &str) {
        for id in ids {
            let raft = self.raft(*id).await;
            raft.wait(Some(Duration::from_secs(5)))
                .applied(want, format!("{} (node {})", msg, id))
                .await
                .expect("timeout waiting for applied index");
        }
    }

    /// Wait for the given nodes to reach the given state.
    pub async fn wait_for_state(&self, ids: &[ServerId], want: State, msg: &str) {
        for id in ids {
            let raft = self.raft(*id).await;
            raft.wait(Some(Duration::from_secs(5)))
                .state(want, format!("{} (node {})", msg, id))
                .await
                .expect("timeout waiting for state");
        }
    }

    /// Wait until the metrics of the given node satisfy the predicate.
    pub async fn wait_for_metrics<F>(&self, id: ServerId, func: F, msg: &str) -> RaftMetrics
    where F: Fn(&RaftMetrics) -> bool {
        let raft = self.raft(id).await;
        raft.wait(Some(Duration::from_secs(5)))
            .metrics(func, format!("{} (node {})", msg, id))
            .await
            .expect("timeout waiting for metrics condition")
    }

    /// Send a client write to the target node.
    pub async fn client_write(&self, target: ServerId, data: &[u8]) -> Result<ClientWriteResponse, RaftError> {
        let raft = self.raft(target).await;
        raft.client_write(vec![Bytes::copy_from_slice(data)]).await
    }

    /// Send a batch of client writes to the target node, panicking on error.
    pub async fn client_write_many(&self, target: ServerId, payloads: &[&[u8]]) -> ClientWriteResponse {
        let raft = self.raft(target).await;
        let commands = payloads.iter().map(|data| Bytes::copy_from_slice(data)).collect();
        raft.client_write(commands).await.expect("client write failed")
    }

    /// Assert that exactly one non-isolated leader exists and that all
    /// non-isolated nodes agree on it.
    pub async fn assert_stable_cluster(&self) -> ServerId {
        let isolated = self.isolated_nodes.read().await.clone();
        let nodes: Vec<_> = self
            .latest_metrics()
            .await
            .into_iter()
            .filter(|node| !isolated.contains(&node.id))
            .collect();
        let leaders: Vec<_> = nodes.iter().filter(|node| node.state == State::Leader).collect();
        assert_eq!(leaders.len(), 1, "expected exactly one leader, got {:?}", leaders);
        let leader = leaders[0].id;
        for node in nodes.iter() {
            assert_eq!(
                node.current_leader,
                Some(leader),
                "node {} has leader {:?}, expected {}",
                node.id,
                node.current_leader,
                leader
            );
        }
        leader
    }

    async fn check_isolated(&self, src: ServerId, target: ServerId) -> Result<()> {
        let isolated = self.isolated_nodes.read().await;
        if isolated.contains(&target) || isolated.contains(&src) {
            return Err(anyhow!("target node is isolated"));
        }
        Ok(())
    }
}

#[async_trait]
impl RaftNetwork for RaftRouter {
    async fn append_entries(&self, target: ServerId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.check_isolated(rpc.leader_id, target).await?;
        let raft = self.try_raft(target).await?;
        Ok(raft.append_entries(rpc).await?)
    }

    async fn install_snapshot(&self, target: ServerId, rpc: InstallSnapshotRequest) -> Result<AppendEntriesResponse> {
        self.check_isolated(rpc.leader_id, target).await?;
        let raft = self.try_raft(target).await?;
        Ok(raft.install_snapshot(rpc).await?)
    }

    async fn vote(&self, target: ServerId, rpc: VoteRequest) -> Result<VoteResponse> {
        self.check_isolated(rpc.candidate_id, target).await?;
        let raft = self.try_raft(target).await?;
        Ok(raft.vote(rpc).await?)
    }

    async fn timeout_now(&self, target: ServerId, rpc: TimeoutNowRequest) -> Result<()> {
        self.check_isolated(rpc.leader_id, target).await?;
        let raft = self.try_raft(target).await?;
        raft.timeout_now(rpc);
        Ok(())
    }
}
