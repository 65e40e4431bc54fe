//! The apply loop: feeding committed entries to the state machine.

use crate::core::Pending;
use crate::core::RaftCore;
use crate::core::State;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::fsm::StateMachine;
use crate::log::EntryPayload;
use crate::membership::Group;
use crate::membership::Phase;
use crate::network::RaftNetwork;
use crate::pgrep::PgrepHook;
use crate::pgrep::PgrepInfo;
use crate::raft::ClientWriteResponse;
use crate::storage::RaftStorage;
use crate::LogIndex;

impl<N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> RaftCore<N, S, F, P> {
    /// Apply committed entries to the state machine.
    pub(super) async fn replication_apply(&mut self) -> RaftResult<()> {
        self.replication_apply_pi(PgrepInfo::default()).await
    }

    /// Apply committed entries to the state machine, possibly holding an
    /// already-granted catch-up permit.
    ///
    /// Commands call into the state machine and fire their registered client
    /// callbacks; barriers and configuration changes only fire callbacks.
    /// While a catch-up target exists, the loop advances in bounded chunks
    /// so control returns to other events between them.
    pub(super) async fn replication_apply_pi(&mut self, mut pi: PgrepInfo) -> RaftResult<()> {
        if !matches!(self.target_state, State::Leader | State::Follower) {
            return Ok(());
        }
        // The apply loop is fenced behind the catch-up permit on the leader,
        // so the external copy process can serialize against it.
        if self.target_state.is_leader() && !pi.permit {
            self.pgrep.permit(&mut pi);
            if !pi.permit {
                tracing::debug!("catch-up permit not granted, apply deferred");
                return Ok(());
            }
        }

        'outer: loop {
            if self.last_applying >= self.commit_index {
                break;
            }
            let to_commit = if self.pgrep_id != 0 {
                std::cmp::min(self.commit_index, self.last_applying + self.config.apply_batch)
            } else {
                self.commit_index
            };
            for index in (self.last_applying + 1)..=to_commit {
                let entry = match self.log.get(index) {
                    Some(entry) => entry.clone(),
                    None => {
                        tracing::error!(index, "committed entry is missing from the log");
                        self.become_unavailable();
                        return Err(RaftError::Shutdown);
                    }
                };
                match entry.payload {
                    EntryPayload::Command(command) => {
                        self.last_applying = index;
                        let _ = self.pgrep.boundary();
                        let result = self.fsm.apply(index, &command).await;
                        self.last_applied = index;
                        self.fire_applied_command(index, result);
                    }
                    EntryPayload::Barrier => {
                        // A barrier fences causally-dependent callbacks: it
                        // must not overtake a command still applying.
                        if self.last_applying > self.last_applied {
                            break 'outer;
                        }
                        self.last_applying = index;
                        self.last_applied = index;
                        self.fire_applied_barrier(index);
                    }
                    EntryPayload::ConfigChange(_) => {
                        if self.last_applying > self.last_applied {
                            break 'outer;
                        }
                        self.last_applying = index;
                        self.last_applied = index;
                        self.apply_change(index).await?;
                        if !matches!(self.target_state, State::Leader | State::Follower) {
                            break 'outer;
                        }
                    }
                }
            }
        }

        if pi.permit {
            self.pgrep_apply_continue(pi);
        }
        if self.last_applying == self.last_applied && self.should_take_snapshot() {
            self.take_snapshot().await?;
        }
        self.report_metrics();
        Ok(())
    }

    /// After a fenced apply pass: keep driving the catch-up target while a
    /// gap remains, else give the permit back.
    fn pgrep_apply_continue(&mut self, mut pi: PgrepInfo) {
        if self.target_state.is_leader() && self.pgrep_id != 0 {
            let target = self.pgrep_id;
            let behind = self
                .leader
                .as_ref()
                .and_then(|l| l.progress.get(&target))
                .map(|p| p.prev_applied_index != self.last_applied)
                .unwrap_or(false);
            if behind {
                self.replication_progress_pi(target, pi);
                return;
            }
        }
        self.pgrep.unpermit(&mut pi);
    }

    /// Install the configuration change at `index` as committed.
    ///
    /// On the leader this also drives the second phase of a joint change,
    /// fires the pending change callback, and steps down when the committed
    /// configuration no longer contains this server.
    async fn apply_change(&mut self, index: LogIndex) -> RaftResult<()> {
        if self.configuration_uncommitted_index == index {
            self.configuration_uncommitted_index = 0;
        }
        self.configuration_index = index;
        self.committed_configuration = self.configuration.clone();
        tracing::debug!(index, phase = ?self.configuration.phase, "configuration change committed");

        if self.target_state.is_leader() {
            if self.configuration.phase == Phase::Joint {
                // The joint configuration is committed; immediately propose
                // the final uniform configuration of the new view.
                let normal = self.configuration.joint_to_normal(Group::NEW);
                if let Err(err) = self.change_configuration(normal).await {
                    self.fail_change(err);
                }
                return Ok(());
            }
            if !self.configuration.contains(self.id) {
                // A leader that is removed from the configuration steps down
                // once the entry is committed.
                tracing::info!("stepping down, removed from the committed configuration");
                self.removed = true;
                self.complete_change(Ok(()));
                self.current_leader = 0;
                self.set_target_state(State::Follower);
                return Ok(());
            }
            self.complete_change(Ok(()));
        } else if !self.configuration.contains(self.id) {
            self.removed = true;
        }
        self.report_metrics();
        Ok(())
    }

    /// Fire the pending change callback with the given result.
    pub(super) fn complete_change(&mut self, res: Result<(), RaftError>) {
        if let Some(leader) = self.leader.as_mut() {
            if let Some(tx) = leader.change.take() {
                let _ = tx.send(res);
            }
        }
    }

    /// Fire the pending change callback with an error.
    pub(super) fn fail_change(&mut self, err: RaftError) {
        self.complete_change(Err(err));
    }

    /// Fire the client callback registered for an applied command.
    fn fire_applied_command(&mut self, index: LogIndex, result: anyhow::Result<bytes::Bytes>) {
        let Some(leader) = self.leader.as_mut() else { return };
        match leader.requests.remove(&index) {
            Some(Pending::Write(tx)) => {
                let res = match result {
                    Ok(data) => Ok(ClientWriteResponse { index, data }),
                    Err(err) => Err(RaftError::Storage(err)),
                };
                let _ = tx.send(res);
            }
            Some(Pending::Barrier(tx)) => {
                // A barrier registered at a command index is a bug.
                tracing::error!(index, "barrier callback registered at a command index");
                let _ = tx.send(Err(RaftError::Shutdown));
            }
            None => {}
        }
    }

    /// Fire the client callback registered for an applied barrier.
    fn fire_applied_barrier(&mut self, index: LogIndex) {
        let Some(leader) = self.leader.as_mut() else { return };
        if let Some(Pending::Barrier(tx)) = leader.requests.remove(&index) {
            let _ = tx.send(Ok(index));
        }
    }
}
