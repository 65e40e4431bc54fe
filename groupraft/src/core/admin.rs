//! Membership changes and leadership transfer.

use tokio::time::Instant;

use crate::core::RaftCore;
use crate::core::Transfer;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::fsm::StateMachine;
use crate::membership::Configuration;
use crate::membership::Group;
use crate::membership::Phase;
use crate::membership::Role;
use crate::network::RaftNetwork;
use crate::pgrep::PgrepHook;
use crate::progress;
use crate::raft::RaftRespTx;
use crate::storage::RaftStorage;
use crate::LogIndex;
use crate::ServerId;

impl<N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> RaftCore<N, S, F, P> {
    /// Check that a configuration change may start now.
    ///
    /// Only one change may be in flight at a time: a pending change entry, a
    /// pending change callback or an open catch-up round all answer `Busy`.
    fn can_change_configuration(&self) -> Result<(), RaftError> {
        if !self.is_serving_leader() {
            return Err(RaftError::NotLeader {
                leader: self.current_leader_opt(),
            });
        }
        let busy = self.configuration_uncommitted_index != 0
            || self
                .leader
                .as_ref()
                .map(|l| l.change.is_some() || l.promotee_id != 0)
                .unwrap_or(true);
        if busy {
            return Err(RaftError::Busy);
        }
        Ok(())
    }

    /// Append a configuration-change entry, adopt the new configuration and
    /// trigger its replication.
    pub(super) async fn change_configuration(&mut self, configuration: Configuration) -> RaftResult<LogIndex> {
        let index = self.log.append_configuration(self.current_term, configuration.clone());
        let last_index = self.log.last_index();
        let now = Instant::now();
        if let Some(leader) = self.leader.as_mut() {
            let rebuilt = progress::rebuild_array(&leader.progress, &configuration, last_index, now);
            leader.progress = rebuilt;
            // Servers leaving the configuration keep receiving entries until
            // they acknowledge their removal.
            for (id, progress) in leader.progress.iter_mut() {
                if configuration.contains(*id) {
                    progress.remove_after = None;
                    progress.removal_notified = false;
                } else if progress.remove_after.is_none() {
                    progress.remove_after = Some(index);
                }
            }
            if !configuration.contains(self.id) {
                leader.removed_from_cluster = true;
            }
        }
        self.configuration = configuration;
        self.configuration_uncommitted_index = index;
        self.report_metrics();
        tracing::info!(index, "appended configuration change");

        if let Err(err) = self.replication_trigger(index).await {
            let _ = self.log.discard(index);
            return Err(err);
        }
        Ok(index)
    }

    /// Add a new server to the cluster as an inert spare.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_add(&mut self, id: ServerId, tx: RaftRespTx<(), RaftError>) {
        if let Err(err) = self.can_change_configuration() {
            let _ = tx.send(Err(err));
            return;
        }
        let mut configuration = self.configuration.clone();
        if let Err(err) = configuration.add(id, Role::Spare, Role::Spare, Group::OLD) {
            let _ = tx.send(Err(err));
            return;
        }
        if let Some(leader) = self.leader.as_mut() {
            leader.change = Some(tx);
        }
        if let Err(err) = self.change_configuration(configuration).await {
            self.fail_change(err);
            return;
        }
        let _ = self.replication_apply().await;
    }

    /// Assign a new role to a server.
    ///
    /// Promotions to a quorum-relevant role go through catch-up rounds when
    /// the target's log is behind; everything else is applied immediately.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_assign(&mut self, id: ServerId, role: Role, tx: RaftRespTx<(), RaftError>) {
        if let Err(err) = self.can_change_configuration() {
            let _ = tx.send(Err(err));
            return;
        }
        let Some(i) = self.configuration.index_of(id) else {
            let _ = tx.send(Err(RaftError::NotFound));
            return;
        };
        if self.configuration.servers[i].role == role {
            let _ = tx.send(Err(RaftError::BadRole));
            return;
        }
        let last_index = self.log.last_index();
        let promote = matches!(role, Role::Voter | Role::Logger);
        let up_to_date = self
            .leader
            .as_ref()
            .and_then(|l| l.progress.get(&id))
            .map(|p| p.match_index == last_index)
            .unwrap_or(false);
        if !promote || up_to_date {
            let mut configuration = self.configuration.clone();
            configuration.servers[i].role = role;
            configuration.servers[i].role_new = role;
            if let Some(leader) = self.leader.as_mut() {
                leader.change = Some(tx);
            }
            if let Err(err) = self.change_configuration(configuration).await {
                self.fail_change(err);
                return;
            }
            let _ = self.replication_apply().await;
            return;
        }

        // The promotee must catch up first.
        if let Some(leader) = self.leader.as_mut() {
            leader.change = Some(tx);
            leader.promotee_id = id;
            leader.promotee_role = role;
            leader.remove_id = 0;
            leader.round_number = 1;
            leader.round_index = last_index;
            leader.round_start = Instant::now();
        }
        tracing::info!(promotee = id, round_index = last_index, "starting promotion catch-up round 1");
        self.replication_progress(id);
    }

    /// Atomically promote one server and remove another through joint
    /// consensus.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_joint_promote(
        &mut self,
        id: ServerId,
        role: Role,
        remove_id: ServerId,
        tx: RaftRespTx<(), RaftError>,
    ) {
        if !matches!(role, Role::Voter | Role::Logger) {
            let _ = tx.send(Err(RaftError::BadRole));
            return;
        }
        if !self.configuration.contains(remove_id) {
            let _ = tx.send(Err(RaftError::NotFound));
            return;
        }
        if let Err(err) = self.can_change_configuration() {
            let _ = tx.send(Err(err));
            return;
        }
        let Some(i) = self.configuration.index_of(id) else {
            let _ = tx.send(Err(RaftError::NotFound));
            return;
        };
        if self.configuration.servers[i].role == role {
            let _ = tx.send(Err(RaftError::BadRole));
            return;
        }

        let last_index = self.log.last_index();
        let up_to_date = self
            .leader
            .as_ref()
            .and_then(|l| l.progress.get(&id))
            .map(|p| p.match_index == last_index)
            .unwrap_or(false);
        if up_to_date {
            let mut configuration = self.configuration.clone();
            configuration.joint_enter(remove_id);
            configuration.servers[i].role_new = role;
            if let Some(leader) = self.leader.as_mut() {
                leader.change = Some(tx);
            }
            if let Err(err) = self.change_configuration(configuration).await {
                self.fail_change(err);
                return;
            }
            let _ = self.replication_apply().await;
            return;
        }

        if let Some(leader) = self.leader.as_mut() {
            leader.change = Some(tx);
            leader.promotee_id = id;
            leader.promotee_role = role;
            leader.remove_id = remove_id;
            leader.round_number = 1;
            leader.round_index = last_index;
            leader.round_start = Instant::now();
        }
        tracing::info!(promotee = id, remove = remove_id, "starting joint-promotion catch-up round 1");
        self.replication_progress(id);
    }

    /// Remove a server from the cluster.
    ///
    /// In joint phase the removal also resolves the transition: the
    /// configuration first collapses to the view that does not carry the
    /// target, then the target is dropped from the result.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_remove(&mut self, id: ServerId, tx: RaftRespTx<(), RaftError>) {
        if let Err(err) = self.can_change_configuration() {
            let _ = tx.send(Err(err));
            return;
        }
        let Some(server) = self.configuration.get(id).copied() else {
            let _ = tx.send(Err(RaftError::BadId));
            return;
        };
        let configuration = if self.configuration.phase == Phase::Joint {
            let keep = if server.group.contains(Group::NEW) {
                Group::OLD
            } else {
                Group::NEW
            };
            let mut configuration = self.configuration.joint_to_normal(keep);
            // The target may already be absent from the surviving view.
            let _ = configuration.remove(id);
            configuration
        } else {
            let mut configuration = self.configuration.clone();
            let _ = configuration.remove(id);
            configuration
        };
        if let Some(leader) = self.leader.as_mut() {
            leader.change = Some(tx);
        }
        if let Err(err) = self.change_configuration(configuration).await {
            self.fail_change(err);
            return;
        }
        let _ = self.replication_apply().await;
    }

    /// Transfer leadership to the given server, or to the most up-to-date
    /// voter when none is named.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_transfer(&mut self, id: Option<ServerId>, tx: RaftRespTx<(), RaftError>) {
        if !self.target_state.is_leader() || self.transfer.is_some() {
            let _ = tx.send(Err(RaftError::NotLeader {
                leader: self.current_leader_opt(),
            }));
            return;
        }
        let target = match id {
            Some(id) => id,
            None => {
                let selected = self.select_transferee();
                if selected == 0 {
                    let _ = tx.send(Err(RaftError::NotFound));
                    return;
                }
                selected
            }
        };
        let valid = target != self.id
            && self
                .configuration
                .get(target)
                .map(|s| s.is_voter(Group::ANY))
                .unwrap_or(false);
        if !valid {
            let _ = tx.send(Err(RaftError::BadId));
            return;
        }
        tracing::info!(target, "initiating leadership transfer");
        self.transfer = Some(Transfer {
            id: target,
            tx: Some(tx),
            sent_timeout_now: false,
        });
        let last_index = self.log.last_index();
        let up_to_date = self
            .leader
            .as_ref()
            .and_then(|l| l.progress.get(&target))
            .map(|p| p.is_up_to_date(last_index))
            .unwrap_or(false);
        if up_to_date {
            if let Some(transfer) = self.transfer.as_mut() {
                transfer.sent_timeout_now = true;
            }
            self.send_timeout_now(target);
        }
    }

    /// Find a suitable voting follower to hand leadership to, preferring an
    /// up-to-date one.
    fn select_transferee(&self) -> ServerId {
        let last_index = self.log.last_index();
        let mut transferee = 0;
        for server in self.configuration.servers.iter() {
            if server.id == self.id || !server.is_voter(Group::ANY) {
                continue;
            }
            transferee = server.id;
            let up_to_date = self
                .leader
                .as_ref()
                .and_then(|l| l.progress.get(&server.id))
                .map(|p| p.is_up_to_date(last_index))
                .unwrap_or(false);
            if up_to_date {
                break;
            }
        }
        transferee
    }

    /// Advance the promotion catch-up state after a successful reply from
    /// the promotee.
    ///
    /// When the promotee reaches the round's last index within an election
    /// timeout, the actual configuration change is appended; otherwise a new
    /// round opens, bounded by `max_catch_up_rounds`.
    pub(super) async fn update_catch_up_round(&mut self, target: ServerId) {
        let Some(leader) = self.leader.as_mut() else { return };
        if leader.promotee_id == 0 || leader.promotee_id != target {
            return;
        }
        let matched = match leader.progress.get(&target) {
            Some(progress) => progress.match_index,
            None => return,
        };
        if matched < leader.round_index {
            return;
        }
        let elapsed = Instant::now().saturating_duration_since(leader.round_start);
        if elapsed < std::time::Duration::from_millis(self.config.election_timeout_min) {
            tracing::info!(
                promotee = leader.promotee_id,
                round = leader.round_number,
                "promotee has caught up"
            );
            self.trigger_actual_promotion().await;
            return;
        }
        // The round took too long; open the next one from the current end of
        // the log.
        leader.round_number += 1;
        if leader.round_number > self.config.max_catch_up_rounds {
            tracing::warn!(
                promotee = leader.promotee_id,
                rounds = leader.round_number - 1,
                "promotee could not catch up, abandoning promotion"
            );
            leader.promotee_id = 0;
            leader.remove_id = 0;
            self.fail_change(RaftError::NoConnection);
            return;
        }
        leader.round_index = self.log.last_index();
        leader.round_start = Instant::now();
    }

    /// Append the configuration change a caught-up promotee was waiting for.
    async fn trigger_actual_promotion(&mut self) {
        let (promotee_id, promotee_role, remove_id) = match self.leader.as_mut() {
            Some(leader) => {
                let state = (leader.promotee_id, leader.promotee_role, leader.remove_id);
                leader.promotee_id = 0;
                leader.remove_id = 0;
                state
            }
            None => return,
        };
        let Some(i) = self.configuration.index_of(promotee_id) else {
            self.fail_change(RaftError::NotFound);
            return;
        };
        let mut configuration = self.configuration.clone();
        if remove_id != 0 {
            configuration.joint_enter(remove_id);
            configuration.servers[i].role_new = promotee_role;
        } else {
            configuration.servers[i].role = promotee_role;
            configuration.servers[i].role_new = promotee_role;
        }
        if let Err(err) = self.change_configuration(configuration).await {
            self.fail_change(err);
        }
    }

    /// Append a role change queued by the replication path, once the
    /// configuration is free to change.
    pub(super) async fn process_pending_role_change(&mut self) {
        let Some((id, role)) = self.pending_role_change.take() else { return };
        if !self.target_state.is_leader() || self.configuration_uncommitted_index != 0 {
            // Not possible right now; keep it queued.
            self.pending_role_change = Some((id, role));
            return;
        }
        let Some(i) = self.configuration.index_of(id) else { return };
        if self.configuration.servers[i].role == role {
            return;
        }
        let mut configuration = self.configuration.clone();
        configuration.servers[i].role = role;
        configuration.servers[i].role_new = role;
        tracing::info!(server = id, ?role, "appending role change for catch-up");
        if let Err(err) = self.change_configuration(configuration).await {
            tracing::error!(error=%err, "error appending role change");
            return;
        }
        let _ = self.replication_apply().await;
    }
}
