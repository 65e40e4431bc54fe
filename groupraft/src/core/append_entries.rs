//! The follower-side AppendEntries receive path.

use crate::core::RaftCore;
use crate::core::State;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::fsm::StateMachine;
use crate::log::EntryPayload;
use crate::membership::Configuration;
use crate::network::RaftNetwork;
use crate::pgrep::PgrepHook;
use crate::pgrep::PgrepInfo;
use crate::pgrep::PgrepRound;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::storage::RaftStorage;
use crate::storage::Snapshot;
use crate::LogIndex;

/// The outcome of the partial-replication pre-checks on an incoming frame.
enum PgrepFrame {
    /// Nothing to append; acknowledge right away.
    Reply,
    /// Proceed to append, skipping the first `skip` entries already stored.
    Append { skip: usize },
}

impl<N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> RaftCore<N, S, F, P> {
    /// An RPC invoked by the leader to replicate log entries; also used as a
    /// heartbeat.
    #[tracing::instrument(
        level = "trace",
        skip(self, msg),
        fields(term=msg.term, leader_id=msg.leader_id, prev_log_index=msg.prev_log_index, prev_log_term=msg.prev_log_term, leader_commit=msg.leader_commit),
    )]
    pub(super) async fn handle_append_entries(&mut self, msg: AppendEntriesRequest) -> RaftResult<AppendEntriesResponse> {
        // If the message's term is behind ours, we do not honor the request.
        if msg.term < self.current_term {
            tracing::trace!({self.current_term, rpc_term=msg.term}, "AppendEntries RPC term is behind current term");
            return Ok(self.reject_response(msg.prev_log_index, &msg.pgrep));
        }
        // Two leaders of the same term cannot exist; a same-term AppendEntries
        // on a leader must be stale traffic.
        if msg.term == self.current_term && self.target_state.is_leader() {
            return Ok(self.reject_response(msg.prev_log_index, &msg.pgrep));
        }

        self.update_next_election_timeout(true);

        if msg.term > self.current_term {
            self.update_current_term(msg.term, 0);
            self.save_hard_state().await?;
        }
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
        }
        if self.current_leader != msg.leader_id {
            self.current_leader = msg.leader_id;
            self.report_metrics();
        }
        self.maybe_complete_transfer();

        let mut first_new = 0usize;
        if msg.pgrep.is_replicating() {
            match self.check_pgrep_frame(&msg).await? {
                PgrepFrame::Reply => return Ok(self.accept_response(&msg.pgrep)),
                PgrepFrame::Append { skip } => first_new = skip,
            }
        } else {
            // Ordinary traffic resets any catch-up checkpoint.
            self.pgrep.reset_checkpoint();
            self.last_append_time = msg.pgrep.time;
            self.last_append_term = self.current_term;

            // The log-matching check: the entry at prev_log_index must carry
            // prev_log_term. A term conflict at or below the commit index
            // means local state is corrupt.
            if msg.prev_log_index > 0 {
                let local_term = self.log.term_of(msg.prev_log_index);
                if local_term == 0 {
                    tracing::trace!(index = msg.prev_log_index, "no entry at prev_log_index, rejecting");
                    return Ok(self.reject_response(msg.prev_log_index, &msg.pgrep));
                }
                if local_term != msg.prev_log_term {
                    if msg.prev_log_index <= self.commit_index {
                        tracing::error!(
                            index = msg.prev_log_index,
                            local_term,
                            rpc_term = msg.prev_log_term,
                            "conflicting terms at or below the commit index"
                        );
                        self.become_unavailable();
                        return Err(RaftError::Shutdown);
                    }
                    tracing::trace!("previous term mismatch, rejecting");
                    return Ok(self.reject_response(msg.prev_log_index, &msg.pgrep));
                }
            }
            first_new = self.delete_conflicting_entries(&msg).await?;
        }

        let n = msg.entries.len().saturating_sub(first_new);
        if !msg.pgrep.is_replicating() && n == 0 {
            // Nothing to write; still check whether entries can be committed.
            if msg.leader_commit > self.commit_index {
                self.commit_index = std::cmp::min(msg.leader_commit, self.last_stored);
                self.replication_apply().await?;
            }
            return Ok(self.accept_response(&msg.pgrep));
        }

        if n > 0 {
            let first_index = msg.prev_log_index + 1 + first_new as u64;
            for entry in &msg.entries[first_new..] {
                self.log.append(entry.term, entry.payload.clone());
            }
            let entries = match self.log.acquire_section(first_index, first_index + n as u64 - 1) {
                Ok(entries) => entries,
                Err(err) => return Err(err),
            };
            let res = self.storage.append(first_index, &entries).await;
            self.log.release(first_index, n);
            if let Err(err) = res {
                let _ = self.log.truncate(first_index);
                return Err(self.map_fatal_storage_error(err));
            }
            self.last_stored = std::cmp::max(self.last_stored, first_index + n as u64 - 1);

            // Configuration changes take effect as soon as they are stored,
            // committed or not.
            for (j, entry) in entries.iter().enumerate() {
                if let EntryPayload::ConfigChange(configuration) = &entry.payload {
                    self.membership_uncommitted_change(first_index + j as u64, configuration.clone());
                }
            }
        }

        if msg.leader_commit > self.commit_index {
            self.commit_index = std::cmp::min(msg.leader_commit, self.last_stored);
        }
        self.replication_apply().await?;

        let mut resp = self.accept_response(&msg.pgrep);
        if msg.pgrep.is_replicating() {
            // Catch-up replies are held back until the apply loop drains, so
            // the leader knows this window is consumed.
            resp.last_log_index = self.last_applied;
        }
        self.report_metrics();
        Ok(resp)
    }

    /// Delete from our log all entries that conflict with the ones in the
    /// given request.
    ///
    /// Returns the offset of the first entry of the request that is not
    /// already present in our log.
    async fn delete_conflicting_entries(&mut self, msg: &AppendEntriesRequest) -> RaftResult<usize> {
        for (j, entry) in msg.entries.iter().enumerate() {
            let index = msg.prev_log_index + 1 + j as u64;
            let local_term = self.log.term_of(index);
            if local_term > 0 && local_term != entry.term {
                if index <= self.commit_index {
                    tracing::error!(index, "a new entry conflicts with a committed one");
                    self.become_unavailable();
                    return Err(RaftError::Shutdown);
                }
                tracing::debug!(index, "log mismatch, truncating");
                self.try_truncate(index).await?;
                return Ok(j);
            } else if local_term == 0 {
                return Ok(j);
            }
        }
        Ok(msg.entries.len())
    }

    /// Drop the durable and in-memory log suffix from `index` onward,
    /// rolling back any uncommitted configuration change within it.
    pub(super) async fn try_truncate(&mut self, index: LogIndex) -> RaftResult<()> {
        if self.configuration_uncommitted_index >= index {
            self.membership_rollback();
        }
        if index > self.log.last_index() {
            return Ok(());
        }
        if self.log.is_referenced(index) {
            return Err(RaftError::LogBusy);
        }
        if let Err(err) = self.storage.truncate(index).await {
            return Err(self.map_fatal_storage_error(err));
        }
        self.log.truncate(index)?;
        if self.last_stored >= index {
            self.last_stored = index - 1;
        }
        Ok(())
    }

    /// Adopt an appended-but-uncommitted configuration.
    pub(super) fn membership_uncommitted_change(&mut self, index: LogIndex, configuration: Configuration) {
        tracing::debug!(index, "adopting uncommitted configuration from leader");
        self.configuration = configuration;
        self.configuration_uncommitted_index = index;
        self.report_metrics();
    }

    /// Roll back to the last committed configuration after truncating an
    /// uncommitted change.
    fn membership_rollback(&mut self) {
        tracing::debug!(
            index = self.configuration_uncommitted_index,
            "rolling back uncommitted configuration change"
        );
        self.configuration = self.committed_configuration.clone();
        self.configuration_uncommitted_index = 0;
        self.report_metrics();
    }

    /// Run the partial-replication pre-checks on an incoming catch-up frame.
    async fn check_pgrep_frame(&mut self, msg: &AppendEntriesRequest) -> RaftResult<PgrepFrame> {
        if msg.term > self.last_append_term {
            self.last_append_time = 0;
        }
        if msg.pgrep.time <= self.last_append_time {
            tracing::warn!(
                time = msg.pgrep.time,
                last_append_time = self.last_append_time,
                "stale catch-up frame"
            );
            return Err(RaftError::Discard);
        }
        self.last_append_time = msg.pgrep.time;
        self.last_append_term = self.current_term;

        if msg.pgrep.round == PgrepRound::Begin {
            // The first frame of a round only agrees on the stored index:
            // everything past the applied point is dropped so the next
            // section starts from known state.
            let truncate_index = std::cmp::max(self.last_applied, self.last_applying) + 1;
            self.pgrep.update_catch_up_time(msg.pgrep.time);
            self.try_truncate(truncate_index).await?;
            self.last_stored = truncate_index - 1;
            self.commit_index = truncate_index - 1;
            return Ok(PgrepFrame::Reply);
        }

        if msg.prev_log_index > self.last_stored {
            // We cannot serve the leader's window from our log; re-anchor our
            // snapshot boundary at the leader's previous index. The external
            // copy process has already brought the state machine there.
            if self.last_applying != self.last_applied {
                return Err(RaftError::ApplyBusy);
            }
            let from = std::cmp::max(self.log.first_index(), self.log.snapshot_index() + 1);
            self.try_truncate(from).await?;
            self.resync_catch_up_boundary(msg).await?;
        }

        let skip = self.last_stored.saturating_sub(msg.prev_log_index) as usize;
        if msg.prev_log_index + msg.entries.len() as u64 <= self.last_stored {
            // The window is entirely behind us; just acknowledge.
            return Ok(PgrepFrame::Reply);
        }
        Ok(PgrepFrame::Append { skip })
    }

    /// Re-anchor the snapshot boundary at the leader's previous index,
    /// persisting a snapshot of the externally-synced state machine.
    async fn resync_catch_up_boundary(&mut self, msg: &AppendEntriesRequest) -> RaftResult<()> {
        tracing::info!(
            index = msg.prev_log_index,
            term = msg.prev_log_term,
            "re-anchoring snapshot boundary for catch-up"
        );
        let bufs = match self.fsm.snapshot().await {
            Ok(bufs) => bufs,
            Err(err) => return Err(self.map_fatal_storage_error(err)),
        };
        let snapshot = Snapshot {
            index: msg.prev_log_index,
            term: msg.prev_log_term,
            configuration: self.configuration.clone(),
            configuration_index: self.configuration_index,
            bufs,
        };
        if let Err(err) = self.storage.snapshot_put(0, &snapshot).await {
            return Err(self.map_fatal_storage_error(err));
        }
        self.log.restore(msg.prev_log_index, msg.prev_log_term)?;
        self.last_stored = msg.prev_log_index;
        self.commit_index = msg.prev_log_index;
        self.last_applied = msg.prev_log_index;
        self.last_applying = msg.prev_log_index;
        self.pgrep.reset_checkpoint();
        self.report_metrics();
        Ok(())
    }

    pub(super) fn accept_response(&self, pgrep: &PgrepInfo) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            rejected: 0,
            last_log_index: self.last_stored,
            pgrep: *pgrep,
        }
    }

    pub(super) fn reject_response(&self, rejected: LogIndex, pgrep: &PgrepInfo) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            rejected,
            last_log_index: self.last_stored,
            pgrep: *pgrep,
        }
    }
}
