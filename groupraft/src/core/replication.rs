//! Leader-side replication: AppendEntries dispatch, reply handling and
//! quorum-based commit.
//!
//! Sends are spawned as detached tasks; their outcomes re-enter the core as
//! `ReplicaEvent`s carrying the term they were issued under, so results that
//! no longer apply are silently discarded.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::core::RaftCore;
use crate::core::State;
use crate::error::RaftResult;
use crate::fsm::StateMachine;
use crate::log::EntryPayload;
use crate::membership::Configuration;
use crate::membership::Group;
use crate::membership::Phase;
use crate::membership::Role;
use crate::network::RaftNetwork;
use crate::pgrep::PgrepHook;
use crate::pgrep::PgrepInfo;
use crate::pgrep::PgrepRound;
use crate::pgrep::PgrepTick;
use crate::progress::Progress;
use crate::progress::ProgressState;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::TimeoutNowRequest;
use crate::storage::RaftStorage;
use crate::LogIndex;
use crate::ServerId;
use crate::Term;

/// An event coming from a replication send task.
pub(crate) enum ReplicaEvent {
    /// An AppendEntries send completed.
    AppendEntriesDone {
        target: ServerId,
        term: Term,
        result: anyhow::Result<AppendEntriesResponse>,
    },
    /// An InstallSnapshot send completed; the follower acknowledges with the
    /// same result shape as AppendEntries.
    SnapshotDone {
        target: ServerId,
        term: Term,
        result: anyhow::Result<AppendEntriesResponse>,
    },
    /// A TimeoutNow send completed.
    TimeoutNowDone {
        target: ServerId,
        term: Term,
        result: anyhow::Result<()>,
    },
}

impl<N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> RaftCore<N, S, F, P> {
    /// Durably append all entries from the given index onward, then trigger
    /// replication to every follower.
    pub(super) async fn replication_trigger(&mut self, index: LogIndex) -> RaftResult<()> {
        let entries = self.log.acquire(index)?;
        let n = entries.len();
        let res = self.storage.append(index, &entries).await;
        self.log.release(index, n);
        if let Err(err) = res {
            return Err(self.map_fatal_storage_error(err));
        }
        if n > 0 {
            self.last_stored = std::cmp::max(self.last_stored, index + n as u64 - 1);
        }

        // Only count ourselves while we are part of the configuration: a
        // leader committing its own removal keeps replicating but no longer
        // counts itself in majorities.
        let last_stored = self.last_stored;
        let id = self.id;
        if self.configuration.contains(id) {
            if let Some(progress) = self.leader.as_mut().and_then(|l| l.progress.get_mut(&id)) {
                progress.maybe_update(last_stored);
            }
        }
        self.replication_quorum(self.last_stored);
        self.replication_heartbeat();
        Ok(())
    }

    /// Trigger replication on every follower that is due for traffic,
    /// including departing servers that still must learn of their removal.
    ///
    /// Spare servers are skipped unless they are being promoted.
    pub(super) fn replication_heartbeat(&mut self) {
        if !self.target_state.is_leader() {
            return;
        }
        let targets: Vec<ServerId> = match self.leader.as_ref() {
            Some(leader) => leader.progress.keys().copied().collect(),
            None => return,
        };
        let promotee = self.leader.as_ref().map(|l| l.promotee_id).unwrap_or(0);
        for target in targets {
            if target == self.id {
                continue;
            }
            if let Some(server) = self.configuration.get(target) {
                if server.role == Role::Spare && server.id != promotee {
                    continue;
                }
            }
            self.replication_progress(target);
        }
    }

    /// Drive replication for a single follower.
    pub(super) fn replication_progress(&mut self, target: ServerId) {
        self.replication_progress_pi(target, PgrepInfo::default());
    }

    /// Drive replication for a single follower, possibly holding a catch-up
    /// permit.
    pub(super) fn replication_progress_pi(&mut self, target: ServerId, pi: PgrepInfo) {
        if !self.target_state.is_leader() || target == self.id {
            return;
        }
        let now = Instant::now();
        let last_index = self.log.last_index();
        let heartbeat = Duration::from_millis(self.config.heartbeat_interval);
        let install_timeout = Duration::from_millis(self.config.install_snapshot_timeout);
        let inflight = self.config.inflight_log_threshold;
        let should = match self.leader.as_mut().and_then(|l| l.progress.get_mut(&target)) {
            Some(progress) => progress.should_replicate(now, last_index, heartbeat, install_timeout, inflight),
            None => return,
        };
        if !pi.permit && !should {
            return;
        }

        if self.enter_pgreplicating(target, &pi) {
            self.send_pgrep_tick(target, pi);
            return;
        }

        let (state, next_index) = match self.leader.as_ref().and_then(|l| l.progress.get(&target)) {
            Some(progress) => (progress.state(), progress.next_index),
            None => return,
        };
        if state == ProgressState::Snapshot {
            // An installation is in flight; keep asserting leadership with
            // empty heartbeats until it completes or times out.
            let prev_index = self.log.last_index();
            let prev_term = self.log.last_term();
            self.send_append_entries(target, prev_index, prev_term, PgrepInfo::default());
            return;
        }
        let (prev_index, prev_term) = if next_index == 1 {
            // We would be sending the very first entry; if it is not
            // available anymore, the follower needs a full catch-up.
            if self.log.snapshot_index() > 0 {
                self.full_catch_up(target);
                return;
            }
            (0, 0)
        } else {
            let prev = next_index - 1;
            let term = self.log.term_of(prev);
            if term == 0 {
                self.full_catch_up(target);
                return;
            }
            (prev, term)
        };
        self.send_append_entries(target, prev_index, prev_term, PgrepInfo::default());
    }

    /// Check whether the target server is driven through the partial
    /// replication path.
    fn enter_pgreplicating(&mut self, target: ServerId, pi: &PgrepInfo) -> bool {
        if !self.pgrep.active() {
            return false;
        }
        if pi.permit {
            return true;
        }
        let role = match self.configuration.get(target) {
            Some(server) => server.role,
            None => return false,
        };
        let pgrep_id = self.pgrep_id;
        let Some(progress) = self.leader.as_mut().and_then(|l| l.progress.get_mut(&target)) else {
            return false;
        };
        if progress.pgreplicating {
            return true;
        }
        if role == Role::Standby && pgrep_id == target {
            progress.pgreplicating = true;
            return true;
        }
        false
    }

    /// Tick the external catch-up process for the target, sending a section
    /// of entries or a heartbeat depending on its state.
    fn send_pgrep_tick(&mut self, target: ServerId, mut pi: PgrepInfo) {
        let role = self.configuration.get(target).map(|s| s.role);
        if role != Some(Role::Standby) || self.pgrep_id != target || self.configuration_uncommitted_index != 0 {
            self.send_pgrep_heartbeat(target, pi);
            return;
        }

        let status = self.pgrep.tick(self.id, target, self.current_term, &mut pi);
        let round = match status {
            PgrepTick::Begin => {
                let last_applied = self.last_applied;
                if let Some(progress) = self.leader.as_mut().and_then(|l| l.progress.get_mut(&target)) {
                    progress.prev_applied_index = last_applied;
                }
                PgrepRound::Begin
            }
            PgrepTick::Running => PgrepRound::Ongoing,
            PgrepTick::Finished | PgrepTick::Aborted | PgrepTick::Removed => {
                if let Some(progress) = self.leader.as_mut().and_then(|l| l.progress.get_mut(&target)) {
                    let prev_applied = progress.prev_applied_index;
                    progress.optimistic_next_index(prev_applied + 1);
                    progress.pgreplicating = false;
                    progress.prev_applied_index = 0;
                }
                tracing::info!(target, ?status, "partial replication round is over");
                if status == PgrepTick::Finished {
                    if pi.permit {
                        self.pgrep.unpermit(&mut pi);
                    }
                    self.pgrep_id = 0;
                    // Promote the caught-up standby back to a voter once the
                    // configuration is free to change.
                    self.pending_role_change = Some((target, Role::Voter));
                    return;
                }
                self.send_pgrep_heartbeat(target, pi);
                return;
            }
            PgrepTick::Backoff => {
                self.send_pgrep_heartbeat(target, pi);
                return;
            }
        };

        if !pi.permit {
            self.pgrep.permit(&mut pi);
            if !pi.permit {
                tracing::debug!(target, "catch-up permit not granted");
                self.send_pgrep_heartbeat(target, pi);
                return;
            }
        }
        pi.round = round;
        let prev_index = self
            .leader
            .as_ref()
            .and_then(|l| l.progress.get(&target))
            .map(|p| p.prev_applied_index)
            .unwrap_or(0);
        let prev_term = self.log.term_of(prev_index);
        self.send_append_entries(target, prev_index, prev_term, pi);
    }

    /// Send an empty heartbeat on the catch-up channel, releasing any held
    /// permit first.
    fn send_pgrep_heartbeat(&mut self, target: ServerId, mut pi: PgrepInfo) {
        if pi.permit {
            self.pgrep.unpermit(&mut pi);
        }
        pi.round = PgrepRound::Heartbeat;
        pi.time = 0;
        let prev_index = self.log.last_index();
        let prev_term = self.log.last_term();
        self.send_append_entries(target, prev_index, prev_term, pi);
    }

    /// The follower's log is too far behind to be served from ours.
    ///
    /// With an active catch-up process attached, flip the follower to
    /// standby and hand it over; otherwise stream the latest snapshot.
    fn full_catch_up(&mut self, target: ServerId) {
        if self.pgrep.active() {
            let role = self.configuration.get(target).map(|s| s.role);
            if role.is_some() {
                if role != Some(Role::Standby) {
                    self.pending_role_change = Some((target, Role::Standby));
                }
                self.pgrep_id = target;
            }
            return;
        }
        self.send_snapshot(target);
    }

    /// Fetch the latest snapshot and stream it to the target.
    fn send_snapshot(&mut self, target: ServerId) {
        let snapshot_index = self.log.snapshot_index();
        let now = Instant::now();
        let term = self.current_term;
        let leader_id = self.id;
        let storage = self.storage.clone();
        let network = self.network.clone();
        let tx = match self.leader.as_mut() {
            Some(leader) => {
                match leader.progress.get_mut(&target) {
                    Some(progress) => {
                        progress.to_snapshot(snapshot_index);
                        progress.update_last_send(now);
                        progress.update_snapshot_last_send(now);
                    }
                    None => return,
                }
                leader.tx_replica.clone()
            }
            None => return,
        };
        tracing::debug!(target, snapshot_index, "sending snapshot to lagging follower");
        tokio::spawn(
            async move {
                let result = match storage.snapshot_get().await {
                    Ok(Some(snapshot)) => {
                        let rpc = InstallSnapshotRequest {
                            term,
                            leader_id,
                            last_index: snapshot.index,
                            last_term: snapshot.term,
                            configuration: snapshot.configuration,
                            configuration_index: snapshot.configuration_index,
                            data: snapshot.bufs,
                        };
                        network.install_snapshot(target, rpc).await
                    }
                    Ok(None) => Err(anyhow::anyhow!("no snapshot available to install")),
                    Err(err) => Err(err),
                };
                let _ = tx.send(ReplicaEvent::SnapshotDone { target, term, result });
            }
            .instrument(tracing::debug_span!("install-snapshot", target = target)),
        );
    }

    /// Build and dispatch an AppendEntries message to the target, carrying
    /// all entries from `prev_index + 1` onward.
    fn send_append_entries(&mut self, target: ServerId, prev_index: LogIndex, prev_term: Term, mut pi: PgrepInfo) {
        let next_index = prev_index + 1;
        let to = if pi.permit && pi.round == PgrepRound::Ongoing {
            // Catch-up rounds send the section up to the applied index only.
            self.last_applied
        } else {
            self.log.last_index()
        };
        let entries = if pi.round == PgrepRound::Begin {
            Vec::new()
        } else {
            match self.log.section(next_index, to) {
                Ok(entries) => entries,
                Err(_) => {
                    self.full_catch_up(target);
                    return;
                }
            }
        };
        if pi.time == 0 {
            self.io_tick += 1;
            pi.time = self.io_tick;
        }
        let rpc = AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index: prev_index,
            prev_log_term: prev_term,
            entries,
            leader_commit: self.commit_index,
            pgrep: pi,
        };
        let n = rpc.entries.len() as u64;
        let now = Instant::now();
        let term = self.current_term;
        let network = self.network.clone();
        let Some(leader) = self.leader.as_mut() else { return };
        let Some(progress) = leader.progress.get_mut(&target) else { return };
        if n > 0 && progress.state() == ProgressState::Pipeline {
            progress.optimistic_next_index(next_index + n);
        }
        progress.update_last_send(now);
        let tx = leader.tx_replica.clone();
        tokio::spawn(
            async move {
                let result = network.append_entries(target, rpc).await;
                let _ = tx.send(ReplicaEvent::AppendEntriesDone { target, term, result });
            }
            .instrument(tracing::debug_span!("append-entries", target = target)),
        );
    }

    /// Handle a replication event coming from one of the send tasks.
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent) {
        if !self.target_state.is_leader() {
            return;
        }
        match event {
            ReplicaEvent::AppendEntriesDone { target, term, result } => {
                if term != self.current_term {
                    return;
                }
                match result {
                    Ok(res) => self.handle_append_result(target, res).await,
                    Err(err) => {
                        tracing::warn!({error=%err, target}, "error sending AppendEntries to target");
                        if let Some(progress) = self.leader.as_mut().and_then(|l| l.progress.get_mut(&target)) {
                            if progress.state() != ProgressState::Snapshot {
                                progress.to_probe();
                            }
                        }
                    }
                }
            }
            ReplicaEvent::SnapshotDone { target, term, result } => {
                if term != self.current_term {
                    return;
                }
                match result {
                    Ok(res) => self.handle_append_result(target, res).await,
                    Err(err) => {
                        tracing::warn!({error=%err, target}, "error sending InstallSnapshot to target");
                        if let Some(progress) = self.leader.as_mut().and_then(|l| l.progress.get_mut(&target)) {
                            progress.abort_snapshot();
                        }
                    }
                }
            }
            ReplicaEvent::TimeoutNowDone { target, term, result } => {
                if term != self.current_term {
                    return;
                }
                if let Err(err) = result {
                    tracing::warn!({error=%err, target}, "error sending TimeoutNow to target");
                    if let Some(transfer) = self.transfer.as_mut() {
                        if transfer.id == target {
                            transfer.sent_timeout_now = false;
                        }
                    }
                }
            }
        }
    }

    async fn handle_append_result(&mut self, target: ServerId, res: AppendEntriesResponse) {
        if res.term > self.current_term {
            tracing::debug!(res.term, "reverting to follower, greater term observed in AppendEntries result");
            self.update_current_term(res.term, 0);
            if self.save_hard_state().await.is_err() {
                return;
            }
            self.current_leader = 0;
            self.set_target_state(State::Follower);
            return;
        }
        self.replication_update(target, res).await;
    }

    /// Process a successful AppendEntries (or snapshot acknowledgement)
    /// result: adjust the follower's progress, advance the commit index, run
    /// the apply loop and drive any follow-up traffic.
    async fn replication_update(&mut self, target: ServerId, res: AppendEntriesResponse) {
        let now = Instant::now();
        let log_last_index = self.log.last_index();

        let rejected = {
            let Some(progress) = self.leader.as_mut().and_then(|l| l.progress.get_mut(&target)) else {
                return;
            };
            progress.mark_recent_recv(now);
            if res.rejected > 0 {
                Some(progress.maybe_decrement(res.rejected, res.last_log_index, log_last_index))
            } else {
                None
            }
        };
        if let Some(retry) = rejected {
            if retry {
                tracing::debug!(target, rejected = res.rejected, "log mismatch, sending older entries");
                self.replication_progress(target);
            }
            return;
        }

        // In case of success the remote server reports back its stored
        // index; it may exceed ours when it holds leftovers from previous
        // terms.
        let last_index = std::cmp::min(res.last_log_index, log_last_index);
        let commit_index = self.commit_index;
        let (updated, departed) = {
            let Some(progress) = self.leader.as_mut().and_then(|l| l.progress.get_mut(&target)) else {
                return;
            };
            let updated = progress.maybe_update(last_index);
            if updated {
                match progress.state() {
                    ProgressState::Snapshot => {
                        if progress.snapshot_done() {
                            progress.to_probe();
                        }
                    }
                    ProgressState::Probe => progress.to_pipeline(),
                    ProgressState::Pipeline => {}
                }
            }
            // A departing server is dropped once it has acknowledged a frame
            // that carried the commit of its removal entry.
            let mut departed = false;
            if let Some(after) = progress.remove_after {
                if progress.match_index >= after && commit_index >= after {
                    if progress.removal_notified {
                        departed = true;
                    } else {
                        progress.removal_notified = true;
                    }
                }
            }
            (updated, departed)
        };
        if departed {
            tracing::info!(target, "departing server acknowledged its removal, dropping progress");
            if let Some(leader) = self.leader.as_mut() {
                leader.progress.remove(&target);
            }
            return;
        }
        if !updated {
            return;
        }

        self.replication_quorum(std::cmp::min(self.last_stored, last_index));

        if res.pgrep.permit {
            let _ = self.replication_apply_pi(res.pgrep).await;
        } else {
            let _ = self.replication_apply().await;
        }

        // Applying a configuration change may have removed us or the target.
        if !self.target_state.is_leader() {
            return;
        }

        // If we are transferring leadership to this follower and its log is
        // now up to date, tell it to start an election.
        let last = self.log.last_index();
        let up_to_date = self
            .leader
            .as_ref()
            .and_then(|l| l.progress.get(&target))
            .map(|p| p.is_up_to_date(last))
            .unwrap_or(false);
        if up_to_date {
            if let Some(transfer) = self.transfer.as_mut() {
                if transfer.id == target && !transfer.sent_timeout_now {
                    transfer.sent_timeout_now = true;
                    self.send_timeout_now(target);
                }
            }
        }

        // Promotion-on-catch-up for a pending role change.
        let promotee = self.leader.as_ref().map(|l| l.promotee_id).unwrap_or(0);
        if promotee == target {
            self.update_catch_up_round(target).await;
        }

        if !self.target_state.is_leader() {
            return;
        }
        let pipeline = self
            .leader
            .as_ref()
            .and_then(|l| l.progress.get(&target))
            .map(|p| p.state() == ProgressState::Pipeline)
            .unwrap_or(false);
        if pipeline {
            self.replication_progress(target);
        }
    }

    /// Advance the commit index when a quorum of voters has stored the entry
    /// at the given index.
    ///
    /// Only entries of the current term are committed by counting replicas;
    /// earlier entries are committed transitively once a current-term entry
    /// reaches quorum. In joint phase, a strict majority is required in both
    /// the old and the new view.
    pub(super) fn replication_quorum(&mut self, index: LogIndex) {
        if !self.target_state.is_leader() {
            return;
        }
        if index <= self.commit_index {
            return;
        }
        let term = self.log.term_of(index);
        if term == 0 || term != self.current_term {
            return;
        }
        let Some(leader) = self.leader.as_ref() else { return };
        let old = view_has_index_quorum(&self.configuration, &leader.progress, Group::OLD, index);
        let reached = match self.configuration.phase {
            Phase::Normal => old,
            Phase::Joint => old && view_has_index_quorum(&self.configuration, &leader.progress, Group::NEW, index),
        };
        if reached {
            self.commit_index = std::cmp::min(index, self.last_stored);
            tracing::debug!(commit_index = self.commit_index, "new commit index");
        }
    }

    /// Dispatch a TimeoutNow message to the transfer target.
    pub(super) fn send_timeout_now(&mut self, target: ServerId) {
        let rpc = TimeoutNowRequest {
            term: self.current_term,
            leader_id: self.id,
        };
        let term = self.current_term;
        let network = self.network.clone();
        let Some(leader) = self.leader.as_ref() else { return };
        let tx = leader.tx_replica.clone();
        tracing::info!(target, "transferring leadership, telling target to campaign");
        tokio::spawn(
            async move {
                let result = network.timeout_now(target, rpc).await;
                let _ = tx.send(ReplicaEvent::TimeoutNowDone { target, term, result });
            }
            .instrument(tracing::debug_span!("timeout-now", target = target)),
        );
    }

    /// Append a barrier entry without registering a client callback; used
    /// when a new leader takes office.
    pub(super) async fn append_noop_barrier(&mut self) {
        let index = self.log.append(self.current_term, EntryPayload::Barrier);
        if let Err(err) = self.replication_trigger(index).await {
            tracing::error!(error=%err, "error appending initial barrier");
        }
    }
}

/// Check whether a strict majority of the voters of the given view have
/// stored the entry at `index`.
fn view_has_index_quorum(
    configuration: &Configuration,
    progress: &BTreeMap<ServerId, Progress>,
    view: Group,
    index: LogIndex,
) -> bool {
    let total = configuration.voter_count(view);
    if total == 0 {
        return false;
    }
    let count = configuration
        .servers
        .iter()
        .filter(|s| s.is_voter(view))
        .filter(|s| progress.get(&s.id).map(|p| p.match_index >= index).unwrap_or(false))
        .count();
    count > total / 2
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::build_array;

    fn config(ids: &[ServerId]) -> Configuration {
        let mut configuration = Configuration::new();
        for id in ids {
            configuration.add(*id, Role::Voter, Role::Voter, Group::OLD).unwrap();
        }
        configuration
    }

    fn progress_with_matches(configuration: &Configuration, matches: &[LogIndex]) -> BTreeMap<ServerId, Progress> {
        let mut progress = build_array(configuration, 0, 0, 0, Instant::now());
        for (server, m) in configuration.servers.iter().zip(matches) {
            if let Some(p) = progress.get_mut(&server.id) {
                p.maybe_update(*m);
            }
        }
        progress
    }

    #[test]
    fn quorum_requires_strict_majority() {
        let configuration = config(&[1, 2, 3]);
        let progress = progress_with_matches(&configuration, &[5, 5, 0]);
        assert!(view_has_index_quorum(&configuration, &progress, Group::OLD, 5));
        let progress = progress_with_matches(&configuration, &[5, 0, 0]);
        assert!(!view_has_index_quorum(&configuration, &progress, Group::OLD, 5));
    }

    #[test]
    fn quorum_ignores_non_voters() {
        let mut configuration = config(&[1, 2, 3]);
        configuration.add(4, Role::Standby, Role::Standby, Group::OLD).unwrap();
        configuration.add(5, Role::Logger, Role::Logger, Group::OLD).unwrap();
        // Two non-voters at the index contribute nothing.
        let progress = progress_with_matches(&configuration, &[5, 0, 0, 5, 5]);
        assert!(!view_has_index_quorum(&configuration, &progress, Group::OLD, 5));
    }

    #[test]
    fn joint_views_count_separately() {
        let mut configuration = config(&[1, 2, 3]);
        configuration.joint_enter(3);
        configuration.add(4, Role::Spare, Role::Voter, Group::OLD | Group::NEW).unwrap();
        // Old view voters: 1, 2, 3. New view voters: 1, 2, 4.
        let progress = progress_with_matches(&configuration, &[7, 0, 7, 0]);
        assert!(view_has_index_quorum(&configuration, &progress, Group::OLD, 7));
        assert!(!view_has_index_quorum(&configuration, &progress, Group::NEW, 7));
        let progress = progress_with_matches(&configuration, &[7, 0, 7, 7]);
        assert!(view_has_index_quorum(&configuration, &progress, Group::NEW, 7));
    }

    #[test]
    fn single_voter_commits_alone() {
        let configuration = config(&[1]);
        let progress = progress_with_matches(&configuration, &[3]);
        assert!(view_has_index_quorum(&configuration, &progress, Group::OLD, 3));
        assert!(!view_has_index_quorum(&configuration, &progress, Group::OLD, 4));
    }
}
