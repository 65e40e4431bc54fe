//! Public Raft interface and data types.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::fsm::StateMachine;
use crate::log::Entry;
use crate::membership::Configuration;
use crate::membership::Role;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::network::RaftNetwork;
use crate::pgrep::NoopPgrep;
use crate::pgrep::PgrepHook;
use crate::pgrep::PgrepInfo;
use crate::storage::RaftStorage;
use crate::LogIndex;
use crate::ServerId;
use crate::Term;

struct RaftInner<N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> {
    tx_api: mpsc::UnboundedSender<RaftMsg>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    marker_n: std::marker::PhantomData<N>,
    marker_s: std::marker::PhantomData<S>,
    marker_f: std::marker::PhantomData<F>,
    marker_p: std::marker::PhantomData<P>,
}

/// The Raft API.
///
/// This type is the interface to a running Raft node. Applications spawn the
/// node with `Raft::new` and then interact with it through this handle: RPCs
/// received from peers are submitted with `append_entries` / `vote` /
/// `install_snapshot` / `timeout_now`, and client traffic with
/// `client_write`, `barrier` and the membership-change methods.
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone
/// itself is very cheap and helps to facilitate use with async workflows.
///
/// ### shutting down
/// If any of the interfaces returns `RaftError::Shutdown`, the node has
/// become unavailable (typically due to a storage failure) and `shutdown`
/// should be called to await the teardown of its task.
pub struct Raft<N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook = NoopPgrep> {
    inner: Arc<RaftInner<N, S, F, P>>,
}

impl<N: RaftNetwork, S: RaftStorage, F: StateMachine> Raft<N, S, F, NoopPgrep> {
    /// Create and spawn a new Raft task with the partial-replication hooks
    /// left inert.
    ///
    /// ### `id`
    /// The ID which the spawned Raft task will use to identify itself within
    /// the cluster. Applications must guarantee that the ID is stable across
    /// restarts.
    ///
    /// ### `config`
    /// The runtime config. See the docs on the `Config` object for details.
    ///
    /// ### `network` / `storage` / `fsm`
    /// The node's transport, stable storage and state machine.
    pub fn new(id: ServerId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>, fsm: Arc<F>) -> Self {
        Self::new_with_pgrep(id, config, network, storage, fsm, Arc::new(NoopPgrep))
    }
}

impl<N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> Raft<N, S, F, P> {
    /// Create and spawn a new Raft task wired to an external catch-up
    /// process through the given pgrep hooks.
    pub fn new_with_pgrep(
        id: ServerId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        fsm: Arc<F>,
        pgrep: Arc<P>,
    ) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(id, config, network, storage, fsm, pgrep, rx_api, tx_metrics, rx_shutdown);
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            marker_n: std::marker::PhantomData,
            marker_s: std::marker::PhantomData,
            marker_f: std::marker::PhantomData,
            marker_p: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an AppendEntries RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader to replicate log entries,
    /// and are also used as heartbeats.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::AppendEntries { rpc, tx }, rx).await
    }

    /// Submit a RequestVote RPC to this Raft node.
    ///
    /// These RPCs are sent by cluster peers which are in candidate state
    /// attempting to gather votes, and carry the pre-vote flag during the
    /// non-disruptive probe that precedes a real election.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::RequestVote { rpc, tx }, rx).await
    }

    /// Submit an InstallSnapshot RPC to this Raft node.
    ///
    /// Sent by the cluster leader to bring a severely lagging follower back
    /// up to speed. The acknowledgement carries the restored log boundary in
    /// the same shape as an AppendEntries result.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(snapshot_index=rpc.last_index))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> Result<AppendEntriesResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::InstallSnapshot { rpc, tx }, rx).await
    }

    /// Submit a TimeoutNow RPC to this Raft node, instructing it to start an
    /// election immediately as part of a leadership transfer.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn timeout_now(&self, rpc: TimeoutNowRequest) {
        let _ = self.inner.tx_api.send(RaftMsg::TimeoutNow { rpc });
    }

    /// Get the ID of the current leader from this Raft node.
    ///
    /// This value is based on the node's metrics and may be stale; it is
    /// suitable for routing client requests, not for guarding reads.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn current_leader(&self) -> Option<ServerId> {
        self.metrics().borrow().current_leader
    }

    /// Submit a batch of state-machine commands to the cluster.
    ///
    /// The commands are appended to the log, committed once a quorum has
    /// persisted them, and applied to the state machine. The returned
    /// response carries the log index and the state machine's result for the
    /// last command of the batch. Rejected with `NotLeader` when invoked off
    /// the leader or during a leadership transfer.
    #[tracing::instrument(level = "debug", skip(self, commands))]
    pub async fn client_write(&self, commands: Vec<Bytes>) -> Result<ClientWriteResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::ClientWrite { commands, tx }, rx).await
    }

    /// Append a barrier entry, resolving with its index once every entry
    /// before it has been applied to the state machine.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn barrier(&self) -> Result<LogIndex, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Barrier { tx }, rx).await
    }

    /// Add a new server to the cluster as an inert spare.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn add(&self, id: ServerId) -> Result<(), RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Add { id, tx }, rx).await
    }

    /// Assign a new role to a server.
    ///
    /// Promotion to a quorum-relevant role first brings the server's log up
    /// to date through bounded catch-up rounds; the configuration change is
    /// appended once it has caught up.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn assign(&self, id: ServerId, role: Role) -> Result<(), RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Assign { id, role, tx }, rx).await
    }

    /// Atomically promote one server and remove another through joint
    /// consensus.
    ///
    /// A Joint-phase configuration containing both the old and the new
    /// member sets is committed first; once it applies, the final uniform
    /// configuration follows automatically.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn joint_promote(&self, id: ServerId, role: Role, remove_id: ServerId) -> Result<(), RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::JointPromote { id, role, remove_id, tx }, rx).await
    }

    /// Remove a server from the cluster.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn remove(&self, id: ServerId) -> Result<(), RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Remove { id, tx }, rx).await
    }

    /// Transfer leadership to the given server, or to the most up-to-date
    /// voter when `id` is `None`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn transfer(&self, id: Option<ServerId>) -> Result<(), RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Transfer { id, tx }, rx).await
    }

    /// Invoke RaftCore by sending a RaftMsg and blocking on its response.
    #[tracing::instrument(level = "debug", skip(self, mes, rx))]
    pub(crate) async fn call_core<T>(&self, mes: RaftMsg, rx: RaftRespRx<T, RaftError>) -> Result<T, RaftError> {
        if self.inner.tx_api.send(mes).is_err() {
            return Err(RaftError::Shutdown);
        }
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(RaftError::Shutdown),
        }
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// // wait for the node to apply log 3:
    /// r.wait(None).applied(3, "log 3").await?;
    /// // wait for the node to become a follower:
    /// r.wait(None).state(State::Follower, "follower").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait {
            timeout: timeout.unwrap_or_else(|| Duration::from_millis(500)),
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown this Raft node.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> Clone for Raft<N, S, F, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type RaftRespTx<T, E> = oneshot::Sender<Result<T, E>>;
pub(crate) type RaftRespRx<T, E> = oneshot::Receiver<Result<T, E>>;

/// A message coming from the Raft API.
pub(crate) enum RaftMsg {
    AppendEntries {
        rpc: AppendEntriesRequest,
        tx: RaftRespTx<AppendEntriesResponse, RaftError>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: RaftRespTx<VoteResponse, RaftError>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: RaftRespTx<AppendEntriesResponse, RaftError>,
    },
    TimeoutNow {
        rpc: TimeoutNowRequest,
    },
    ClientWrite {
        commands: Vec<Bytes>,
        tx: RaftRespTx<ClientWriteResponse, RaftError>,
    },
    Barrier {
        tx: RaftRespTx<LogIndex, RaftError>,
    },
    Add {
        id: ServerId,
        tx: RaftRespTx<(), RaftError>,
    },
    Assign {
        id: ServerId,
        role: Role,
        tx: RaftRespTx<(), RaftError>,
    },
    JointPromote {
        id: ServerId,
        role: Role,
        remove_id: ServerId,
        tx: RaftRespTx<(), RaftError>,
    },
    Remove {
        id: ServerId,
        tx: RaftRespTx<(), RaftError>,
    },
    Transfer {
        id: Option<ServerId>,
        tx: RaftRespTx<(), RaftError>,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by the cluster leader to replicate log entries, and as a
/// heartbeat.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader's current term.
    pub term: Term,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: ServerId,
    /// The index of the entry immediately preceding `entries`.
    pub prev_log_index: LogIndex,
    /// The term of that entry.
    pub prev_log_term: Term,
    /// The new log entries to store.
    ///
    /// This may be empty when the leader is sending heartbeats. Entries are
    /// batched for efficiency.
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub leader_commit: LogIndex,
    /// Partial-replication permit and round state.
    pub pgrep: PgrepInfo,
}

/// The response to an `AppendEntriesRequest`, also used to acknowledge an
/// `InstallSnapshotRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding server's current term, for the leader to update itself.
    pub term: Term,
    /// Zero on acceptance; on rejection, the `prev_log_index` the request
    /// failed the log-matching check at.
    pub rejected: LogIndex,
    /// The responder's last stored index, letting the leader converge
    /// quickly on the match point.
    pub last_log_index: LogIndex,
    /// Partial-replication permit and round state, echoed back.
    pub pgrep: PgrepInfo,
}

impl AppendEntriesResponse {
    /// Whether the request passed the log-matching check.
    pub fn is_accepted(&self) -> bool {
        self.rejected == 0
    }
}

/// An RPC sent by candidates to gather votes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's term; during pre-vote, the term it would campaign at.
    pub term: Term,
    /// The candidate's ID.
    pub candidate_id: ServerId,
    /// The index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// The term of the candidate's last log entry.
    pub last_log_term: Term,
    /// Whether this is a non-binding pre-vote probe. Pre-vote requests never
    /// bump terms on receivers.
    pub pre_vote: bool,
    /// Set during leadership transfer, allowing the election to proceed even
    /// on servers that recently heard from a live leader.
    pub disrupt_leader: bool,
}

/// The response to a `VoteRequest`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding server.
    pub term: Term,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
    /// Echoes the request's pre-vote flag, so stale grants from the other
    /// phase are never counted.
    pub pre_vote: bool,
}

/// An RPC sent by the leader to install a state-machine snapshot on a
/// severely lagging follower.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's current term.
    pub term: Term,
    /// The leader's ID.
    pub leader_id: ServerId,
    /// The index of the last entry covered by the snapshot.
    pub last_index: LogIndex,
    /// The term of that entry.
    pub last_term: Term,
    /// The configuration as of the snapshot.
    pub configuration: Configuration,
    /// The index at which that configuration was committed.
    pub configuration_index: LogIndex,
    /// The opaque state-machine payload.
    pub data: Vec<Bytes>,
}

/// An RPC sent by a transferring leader, telling the target to start an
/// election immediately.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutNowRequest {
    /// The sending leader's current term.
    pub term: Term,
    /// The sending leader's ID.
    pub leader_id: ServerId,
}

/// The response to a client write request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientWriteResponse {
    /// The log index of the last command of the batch.
    pub index: LogIndex,
    /// The state machine's result for that command.
    pub data: Bytes,
}
