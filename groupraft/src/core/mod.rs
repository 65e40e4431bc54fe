//! The core logic of a Raft node.
//!
//! All of a node's state lives in `RaftCore`, which runs as a single task:
//! every input — peer RPCs, client requests, IO completions, timer ticks —
//! re-enters that task through channels or awaited futures, so state
//! transitions never race and at most one metadata write is ever in flight.

mod admin;
mod append_entries;
mod apply;
mod client;
mod install_snapshot;
pub(crate) mod replication;
mod vote;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::sleep_until;
use tokio::time::Instant;

use crate::config::Config;
use crate::core::replication::ReplicaEvent;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::fsm::StateMachine;
use crate::log::EntryPayload;
use crate::log::Log;
use crate::membership::Configuration;
use crate::membership::Group;
use crate::membership::Role;
use crate::metrics::RaftMetrics;
use crate::network::RaftNetwork;
use crate::pgrep::PgrepHook;
use crate::progress;
use crate::progress::Progress;
use crate::raft::ClientWriteResponse;
use crate::raft::RaftMsg;
use crate::raft::RaftRespTx;
use crate::storage::HardState;
use crate::storage::RaftStorage;
use crate::LogIndex;
use crate::ServerId;
use crate::Term;

/// The core type implementing the Raft protocol.
pub struct RaftCore<N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> {
    /// This node's ID.
    id: ServerId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The `RaftNetwork` implementation.
    network: Arc<N>,
    /// The `RaftStorage` implementation.
    storage: Arc<S>,
    /// The state machine driven by committed entries.
    fsm: Arc<F>,
    /// The partial-replication catch-up hooks.
    pgrep: Arc<P>,

    /// The target state of the system.
    target_state: State,

    /// The cluster's current membership configuration. Configuration-change
    /// entries take effect here as soon as they are appended, committed or
    /// not.
    configuration: Configuration,
    /// The index at which the committed configuration was applied.
    configuration_index: LogIndex,
    /// The index of an appended but not yet committed configuration change,
    /// or zero.
    configuration_uncommitted_index: LogIndex,
    /// The last committed configuration, kept for rolling back a truncated
    /// uncommitted change.
    committed_configuration: Configuration,

    /// The in-memory log.
    log: Log,

    /// The current term. Increases monotonically; never reflected in an
    /// outgoing RPC before it is durable.
    current_term: Term,
    /// The candidate voted for in `current_term`; zero when none.
    voted_for: ServerId,
    /// The current cluster leader; zero when unknown.
    current_leader: ServerId,

    /// The index of the highest log entry known to be committed cluster-wide.
    commit_index: LogIndex,
    /// The index of the highest entry submitted to the state machine.
    last_applying: LogIndex,
    /// The index of the highest entry the state machine has finished.
    last_applied: LogIndex,
    /// The index of the highest entry known durable in local storage.
    last_stored: LogIndex,

    /// Set once this server observes its own removal from the cluster.
    removed: bool,

    /// Whether a snapshot-put is currently in flight.
    snapshot_in_progress: bool,
    /// The server currently being caught up through partial replication;
    /// zero when none.
    pgrep_id: ServerId,
    /// Monotonic stamp carried on outgoing AppendEntries frames.
    io_tick: u64,
    /// The stamp of the latest accepted frame, for dropping stale catch-up
    /// traffic.
    last_append_time: u64,
    /// The term that stamp was accepted under.
    last_append_term: Term,

    /// An in-flight leadership transfer.
    transfer: Option<Transfer>,
    /// Leader-only volatile state; populated while this node leads.
    leader: Option<LeaderVolatile>,
    /// A role change the replication path wants appended once the
    /// configuration is free to change.
    pending_role_change: Option<(ServerId, Role)>,
    /// Set by TimeoutNow: the next election starts immediately, skipping the
    /// pre-vote phase and overriding leader stickiness on peers.
    start_election_now: bool,

    /// The last time an AppendEntries or InstallSnapshot was received.
    last_heartbeat: Option<Instant>,
    /// The deadline of the running election timer.
    next_election_timeout: Option<Instant>,

    tx_snapshot: mpsc::Sender<SnapshotUpdate>,
    rx_snapshot: mpsc::Receiver<SnapshotUpdate>,

    rx_api: mpsc::UnboundedReceiver<RaftMsg>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> RaftCore<N, S, F, P> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: ServerId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        fsm: Arc<F>,
        pgrep: Arc<P>,
        rx_api: mpsc::UnboundedReceiver<RaftMsg>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let (tx_snapshot, rx_snapshot) = mpsc::channel(1);
        let this = Self {
            id,
            config,
            network,
            storage,
            fsm,
            pgrep,
            target_state: State::Follower,
            configuration: Configuration::new(),
            configuration_index: 0,
            configuration_uncommitted_index: 0,
            committed_configuration: Configuration::new(),
            log: Log::new(),
            current_term: 0,
            voted_for: 0,
            current_leader: 0,
            commit_index: 0,
            last_applying: 0,
            last_applied: 0,
            last_stored: 0,
            removed: false,
            snapshot_in_progress: false,
            pgrep_id: 0,
            io_tick: 0,
            last_append_time: 0,
            last_append_term: 0,
            transfer: None,
            leader: None,
            pending_role_change: None,
            start_election_now: false,
            last_heartbeat: None,
            next_election_timeout: None,
            tx_snapshot,
            rx_snapshot,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main())
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::trace!("raft node is initializing");
        let state = match self.storage.get_initial_state().await {
            Ok(state) => state,
            Err(err) => return Err(self.map_fatal_storage_error(err)),
        };
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;
        self.configuration = state.configuration;
        self.configuration_index = state.configuration_index;

        if let Some(snapshot) = state.snapshot {
            if self.log.restore(snapshot.index, snapshot.term).is_err() {
                return Err(RaftError::Shutdown);
            }
            if let Err(err) = self.fsm.restore(snapshot.bufs).await {
                return Err(self.map_fatal_storage_error(err));
            }
            self.last_applied = snapshot.index;
            self.last_applying = snapshot.index;
            self.configuration = snapshot.configuration;
            self.configuration_index = snapshot.configuration_index;
        }
        for entry in state.entries {
            self.log.append(entry.term, entry.payload);
        }
        self.last_stored = self.log.last_index();

        // A server always uses the most recent configuration in its log,
        // regardless of whether it is committed.
        for index in self.log.first_index()..=self.log.last_index() {
            if let Some(entry) = self.log.get(index) {
                if let EntryPayload::ConfigChange(configuration) = &entry.payload {
                    self.configuration = configuration.clone();
                    self.configuration_index = index;
                }
            }
        }
        self.committed_configuration = self.configuration.clone();

        // NOTE: it is unsafe to initialize the commit index to anything else.
        // It must be re-established from a leader after boot.
        self.commit_index = 0;
        self.report_metrics();

        // This is the central loop of the system. The Raft core assumes a few
        // different roles based on cluster state; control is delegated to the
        // state loops, which return when a state change is required.
        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::Unavailable => UnavailableState::new(&mut self).run().await?,
                State::Shutdown => {
                    tracing::info!("node has shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// Report a metrics payload on the current state of the Raft node.
    fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.log.last_index(),
            last_applied: self.last_applied,
            commit_index: self.commit_index,
            snapshot_index: self.log.snapshot_index(),
            current_leader: self.current_leader_opt(),
            configuration: self.configuration.clone(),
            removed: self.removed,
        });
        if let Err(err) = res {
            tracing::error!({error=%err, id=self.id}, "error reporting metrics");
        }
    }

    /// Save the Raft node's current hard state to disk.
    ///
    /// This is the only path that writes metadata; as it is awaited on the
    /// core task, a second write can never start before the first completes.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        match self.storage.set_meta(&hs).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.map_fatal_storage_error(err)),
        }
    }

    /// Update core's target state.
    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_state(&mut self, target_state: State) {
        if self.target_state == State::Shutdown {
            return;
        }
        self.target_state = target_state;
    }

    /// Transition to the unavailable state; only external teardown recovers.
    fn become_unavailable(&mut self) {
        self.set_target_state(State::Unavailable);
        self.report_metrics();
    }

    /// Get the next election timeout, generating a new value if not set.
    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let inst = Instant::now() + Duration::from_millis(self.config.new_rand_election_timeout());
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Set a value for the next election timeout.
    ///
    /// If `heartbeat=true`, then also update the value of `last_heartbeat`.
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        self.next_election_timeout = Some(now + Duration::from_millis(self.config.new_rand_election_timeout()));
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    /// Encapsulate the process of updating the current term, as `voted_for`
    /// must be updated along with it. Does not persist; callers follow up
    /// with `save_hard_state` before acting on the new term.
    fn update_current_term(&mut self, new_term: Term, voted_for: ServerId) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Trigger the transition to the unavailable state due to a
    /// non-recoverable error from the storage layer.
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!({error=%err, id=self.id}, "fatal storage error, becoming unavailable");
        self.become_unavailable();
        RaftError::Storage(err)
    }

    fn current_leader_opt(&self) -> Option<ServerId> {
        if self.current_leader == 0 {
            None
        } else {
            Some(self.current_leader)
        }
    }

    /// Check whether this server is a voter of the current configuration.
    fn is_voter_member(&self) -> bool {
        self.configuration
            .get(self.id)
            .map(|s| s.is_voter(Group::ANY))
            .unwrap_or(false)
    }

    /// Check whether this node accepts client traffic as the leader.
    fn is_serving_leader(&self) -> bool {
        self.target_state.is_leader()
            && self.transfer.is_none()
            && self.leader.as_ref().map(|l| !l.removed_from_cluster).unwrap_or(false)
    }

    /// Conclude an in-flight leadership transfer once a new leader is
    /// observed.
    fn maybe_complete_transfer(&mut self) {
        if self.current_leader == 0 || self.current_leader == self.id {
            return;
        }
        if let Some(mut transfer) = self.transfer.take() {
            let res = if transfer.id == self.current_leader {
                Ok(())
            } else {
                Err(RaftError::NotLeader {
                    leader: self.current_leader_opt(),
                })
            };
            if let Some(tx) = transfer.tx.take() {
                let _ = tx.send(res);
            }
        }
    }

    /// Handle a TimeoutNow request from a transferring leader.
    fn handle_timeout_now(&mut self, rpc: crate::raft::TimeoutNowRequest) {
        if rpc.term < self.current_term || !self.target_state.is_follower() || !self.is_voter_member() {
            return;
        }
        tracing::info!(leader = rpc.leader_id, "starting an election on leader's request");
        self.start_election_now = true;
        self.set_target_state(State::Candidate);
    }

    /// Process the result of a background snapshot-put.
    fn handle_snapshot_update(&mut self, update: SnapshotUpdate) {
        self.snapshot_in_progress = false;
        if let SnapshotUpdate::SnapshotComplete(index) = update {
            // The boundary may have moved past this snapshot in the meantime,
            // e.g. through a catch-up re-anchor; such a completion is stale.
            if index >= self.log.snapshot_index() {
                self.log.snapshot(index, self.config.snapshot_trailing);
                self.report_metrics();
            }
        }
    }

    /// Dispatch a message coming from the Raft API.
    ///
    /// RPC handlers are state-agnostic: term discipline inside them performs
    /// any needed conversion. Client and membership requests check leadership
    /// themselves and answer `NotLeader` elsewhere.
    pub(self) async fn handle_api_msg(&mut self, msg: RaftMsg) {
        match msg {
            RaftMsg::AppendEntries { rpc, tx } => {
                let _ = tx.send(self.handle_append_entries(rpc).await);
            }
            RaftMsg::RequestVote { rpc, tx } => {
                let _ = tx.send(self.handle_vote_request(rpc).await);
            }
            RaftMsg::InstallSnapshot { rpc, tx } => {
                let _ = tx.send(self.handle_install_snapshot(rpc).await);
            }
            RaftMsg::TimeoutNow { rpc } => self.handle_timeout_now(rpc),
            RaftMsg::ClientWrite { commands, tx } => self.handle_client_write(commands, tx).await,
            RaftMsg::Barrier { tx } => self.handle_barrier(tx).await,
            RaftMsg::Add { id, tx } => self.handle_add(id, tx).await,
            RaftMsg::Assign { id, role, tx } => self.handle_assign(id, role, tx).await,
            RaftMsg::JointPromote { id, role, remove_id, tx } => {
                self.handle_joint_promote(id, role, remove_id, tx).await
            }
            RaftMsg::Remove { id, tx } => self.handle_remove(id, tx).await,
            RaftMsg::Transfer { id, tx } => self.handle_transfer(id, tx).await,
        }
    }

    /// Drop a message received while unavailable, failing any response
    /// channel with `Shutdown`.
    fn reject_api_msg(&mut self, msg: RaftMsg) {
        match msg {
            RaftMsg::AppendEntries { tx, .. } => {
                let _ = tx.send(Err(RaftError::Shutdown));
            }
            RaftMsg::RequestVote { tx, .. } => {
                let _ = tx.send(Err(RaftError::Shutdown));
            }
            RaftMsg::InstallSnapshot { tx, .. } => {
                let _ = tx.send(Err(RaftError::Shutdown));
            }
            RaftMsg::TimeoutNow { .. } => {}
            RaftMsg::ClientWrite { tx, .. } => {
                let _ = tx.send(Err(RaftError::Shutdown));
            }
            RaftMsg::Barrier { tx } => {
                let _ = tx.send(Err(RaftError::Shutdown));
            }
            RaftMsg::Add { tx, .. }
            | RaftMsg::Assign { tx, .. }
            | RaftMsg::JointPromote { tx, .. }
            | RaftMsg::Remove { tx, .. }
            | RaftMsg::Transfer { tx, .. } => {
                let _ = tx.send(Err(RaftError::Shutdown));
            }
        }
    }

    /// Tear down the leader-only volatile state, failing every pending
    /// client callback with `NotLeader`.
    fn leader_step_down(&mut self) {
        let Some(mut leader) = self.leader.take() else { return };
        let leader_hint = self.current_leader_opt();
        for (_, pending) in std::mem::take(&mut leader.requests) {
            match pending {
                Pending::Write(tx) => {
                    let _ = tx.send(Err(RaftError::NotLeader { leader: leader_hint }));
                }
                Pending::Barrier(tx) => {
                    let _ = tx.send(Err(RaftError::NotLeader { leader: leader_hint }));
                }
            }
        }
        if let Some(tx) = leader.change.take() {
            let _ = tx.send(Err(RaftError::NotLeader { leader: leader_hint }));
        }
        self.pending_role_change = None;
        self.pgrep_id = 0;
    }
}

/// A pending client request, keyed in the leader's registry by the log index
/// its completion is tied to.
pub(self) enum Pending {
    /// A client write awaiting application of its last command.
    Write(RaftRespTx<ClientWriteResponse, RaftError>),
    /// A barrier awaiting its own application.
    Barrier(RaftRespTx<LogIndex, RaftError>),
}

/// An in-flight leadership transfer.
pub(self) struct Transfer {
    /// The server leadership is being handed to.
    pub id: ServerId,
    /// The response channel of the client that requested the transfer.
    pub tx: Option<RaftRespTx<(), RaftError>>,
    /// Whether TimeoutNow has already been dispatched.
    pub sent_timeout_now: bool,
}

/// Volatile state kept only while this node is the leader.
pub(self) struct LeaderVolatile {
    /// Replication progress keyed by server ID: one entry per configuration
    /// slot, plus entries for departing servers that still need to learn of
    /// their removal.
    pub progress: BTreeMap<ServerId, Progress>,
    /// Pending client callbacks keyed by log index.
    pub requests: BTreeMap<LogIndex, Pending>,
    /// The callback of the in-flight membership change, when one exists.
    pub change: Option<RaftRespTx<(), RaftError>>,
    /// A server being promoted to a quorum-relevant role; zero when none.
    pub promotee_id: ServerId,
    /// The role the promotee is headed for.
    pub promotee_role: Role,
    /// A server to remove together with the promotion, through joint
    /// consensus; zero when none.
    pub remove_id: ServerId,
    /// The 1-based number of the current catch-up round.
    pub round_number: u64,
    /// The log index the promotee must reach to finish the round.
    pub round_index: LogIndex,
    /// When the current round started.
    pub round_start: Instant,
    /// Set when this leader has appended a configuration removing itself.
    pub removed_from_cluster: bool,
    /// Sender cloned into replication send tasks.
    pub tx_replica: mpsc::UnboundedSender<ReplicaEvent>,
}

/// An update on a background snapshot-put.
#[derive(Debug)]
pub(self) enum SnapshotUpdate {
    /// The snapshot covering the given index is durable.
    SnapshotComplete(LogIndex),
    /// Snapshot persistence failed.
    SnapshotFailed,
}

///////////////////////////////////////////////////////////////////////////////////////////////////
///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible states of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the Raft cluster leader.
    Leader,
    /// The node has hit unrecoverable state corruption or IO failure; all
    /// inputs are dropped until external teardown.
    Unavailable,
    /// The Raft node is shutting down.
    Shutdown,
}

impl State {
    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the Raft leader.
struct LeaderState<'a, N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> {
    core: &'a mut RaftCore<N, S, F, P>,
    /// The stream of events coming from replication send tasks.
    rx_replica: mpsc::UnboundedReceiver<ReplicaEvent>,
}

impl<'a, N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> LeaderState<'a, N, S, F, P> {
    /// Create a new instance, installing the leader volatile state.
    pub(self) fn new(core: &'a mut RaftCore<N, S, F, P>) -> Self {
        let (tx_replica, rx_replica) = mpsc::unbounded_channel();
        let now = Instant::now();
        core.leader = Some(LeaderVolatile {
            progress: progress::build_array(&core.configuration, core.id, core.log.last_index(), core.last_stored, now),
            requests: BTreeMap::new(),
            change: None,
            promotee_id: 0,
            promotee_role: Role::Voter,
            remove_id: 0,
            round_number: 0,
            round_index: 0,
            round_start: now,
            removed_from_cluster: false,
            tx_replica,
        });
        Self { core, rx_replica }
    }

    /// Transition to the Raft leader state.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.current_leader = self.core.id;
        self.core.report_metrics();

        if self.core.config.no_op_barrier {
            self.core.append_noop_barrier().await;
        }

        let mut heartbeat = interval(Duration::from_millis(self.core.config.heartbeat_interval));
        loop {
            if !self.core.target_state.is_leader() {
                self.core.leader_step_down();
                return Ok(());
            }
            tokio::select! {
                _ = heartbeat.tick() => self.core.replication_heartbeat(),
                Some(event) = self.rx_replica.recv() => self.core.handle_replica_event(event).await,
                Some(msg) = self.core.rx_api.recv() => self.core.handle_api_msg(msg).await,
                Some(update) = self.core.rx_snapshot.recv() => self.core.handle_snapshot_update(update),
                _ = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
            self.core.process_pending_role_change().await;
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in candidate state.
struct CandidateState<'a, N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> {
    core: &'a mut RaftCore<N, S, F, P>,
    /// The peers which have granted their (pre-)vote this round.
    granted: Vec<ServerId>,
    /// Whether the campaign is still in the non-binding pre-vote phase.
    in_pre_vote: bool,
    /// Whether vote requests may override leader stickiness on receivers.
    disrupt_leader: bool,
}

impl<'a, N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> CandidateState<'a, N, S, F, P> {
    pub(self) fn new(core: &'a mut RaftCore<N, S, F, P>) -> Self {
        Self {
            core,
            granted: Vec::new(),
            in_pre_vote: false,
            disrupt_leader: false,
        }
    }

    /// Run the candidate loop. Each iteration of the outer loop represents a
    /// new campaign.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Leadership-transfer elections skip the pre-vote phase and carry
        // permission to disturb the (old) leader.
        self.disrupt_leader = self.core.start_election_now;
        let use_pre_vote = self.core.config.pre_vote && !self.core.start_election_now;
        self.core.start_election_now = false;

        'campaign: loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }
            self.core.update_next_election_timeout(false);
            self.core.current_leader = 0;

            if use_pre_vote {
                self.in_pre_vote = true;
                self.granted = vec![self.core.id];
                self.core.report_metrics();
                if !self.has_quorum() {
                    let mut pending_votes = self.spawn_parallel_vote_requests(self.core.current_term + 1);
                    loop {
                        if !self.core.target_state.is_candidate() {
                            return Ok(());
                        }
                        if !self.in_pre_vote {
                            break;
                        }
                        let timeout_fut = sleep_until(self.core.get_next_election_timeout());
                        tokio::select! {
                            _ = timeout_fut => continue 'campaign,
                            Some((res, peer)) = pending_votes.recv() => self.handle_vote_response(res, peer).await,
                            Some(msg) = self.core.rx_api.recv() => self.core.handle_api_msg(msg).await,
                            Some(update) = self.core.rx_snapshot.recv() => self.core.handle_snapshot_update(update),
                            _ = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
                        }
                    }
                } else {
                    self.in_pre_vote = false;
                }
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
            }

            // The pre-vote quorum is in; campaign for real.
            self.in_pre_vote = false;
            self.core.current_term += 1;
            self.core.voted_for = self.core.id;
            if self.core.save_hard_state().await.is_err() {
                return Ok(());
            }
            self.core.report_metrics();
            self.granted = vec![self.core.id];
            if self.has_quorum() {
                self.core.set_target_state(State::Leader);
                return Ok(());
            }

            let mut pending_votes = self.spawn_parallel_vote_requests(self.core.current_term);
            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());
                tokio::select! {
                    _ = timeout_fut => continue 'campaign,
                    Some((res, peer)) = pending_votes.recv() => self.handle_vote_response(res, peer).await,
                    Some(msg) = self.core.rx_api.recv() => self.core.handle_api_msg(msg).await,
                    Some(update) = self.core.rx_snapshot.recv() => self.core.handle_snapshot_update(update),
                    _ = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in follower state.
struct FollowerState<'a, N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> {
    core: &'a mut RaftCore<N, S, F, P>,
}

impl<'a, N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> FollowerState<'a, N, S, F, P> {
    pub(self) fn new(core: &'a mut RaftCore<N, S, F, P>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    ///
    /// The election timer is only armed while this server is a voter of its
    /// configuration; standbys, spares and loggers never campaign.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="follower"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }
            let is_voter = self.core.is_voter_member() && !self.core.removed;
            let election_timeout = sleep_until(self.core.get_next_election_timeout());
            tokio::select! {
                // If an election timeout is hit, then we need to transition to candidate.
                _ = election_timeout, if is_voter => self.core.set_target_state(State::Candidate),
                Some(msg) = self.core.rx_api.recv() => self.core.handle_api_msg(msg).await,
                Some(update) = self.core.rx_snapshot.recv() => self.core.handle_snapshot_update(update),
                _ = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node that has become unavailable.
struct UnavailableState<'a, N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> {
    core: &'a mut RaftCore<N, S, F, P>,
}

impl<'a, N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> UnavailableState<'a, N, S, F, P> {
    pub(self) fn new(core: &'a mut RaftCore<N, S, F, P>) -> Self {
        Self { core }
    }

    /// Run the unavailable loop: drop every input until torn down.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="unavailable"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        self.core.report_metrics();
        loop {
            if self.core.target_state != State::Unavailable {
                return Ok(());
            }
            tokio::select! {
                Some(msg) = self.core.rx_api.recv() => self.core.reject_api_msg(msg),
                Some(_) = self.core.rx_snapshot.recv() => {}
                _ = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}
