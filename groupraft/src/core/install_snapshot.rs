//! Snapshot taking and installation.

use tracing_futures::Instrument;

use crate::core::RaftCore;
use crate::core::SnapshotUpdate;
use crate::core::State;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::fsm::StateMachine;
use crate::network::RaftNetwork;
use crate::pgrep::PgrepHook;
use crate::pgrep::PgrepInfo;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::storage::RaftStorage;
use crate::storage::Snapshot;

impl<N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> RaftCore<N, S, F, P> {
    /// Invoked by the leader to install a state-machine snapshot on this
    /// follower.
    ///
    /// The acknowledgement carries the restored boundary in the same shape
    /// as an AppendEntries result, so the leader's progress tracking handles
    /// both uniformly.
    #[tracing::instrument(level = "trace", skip(self, req), fields(term=req.term, last_index=req.last_index, last_term=req.last_term))]
    pub(super) async fn handle_install_snapshot(&mut self, req: InstallSnapshotRequest) -> RaftResult<AppendEntriesResponse> {
        if req.term < self.current_term {
            return Ok(self.reject_response(req.last_index, &PgrepInfo::default()));
        }

        self.update_next_election_timeout(true);

        if req.term > self.current_term {
            self.update_current_term(req.term, 0);
            self.save_hard_state().await?;
        }
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
        }
        if self.current_leader != req.leader_id {
            self.current_leader = req.leader_id;
            self.report_metrics();
        }

        // A snapshot of our own is being persisted; the leader will retry.
        if self.snapshot_in_progress {
            return Err(RaftError::Busy);
        }

        // If our snapshot is more recent, or our log already covers the
        // request at the same or a newer term, acknowledge without work.
        if self.log.snapshot_index() >= req.last_index {
            return Ok(self.accept_response(&PgrepInfo::default()));
        }
        let local_term = self.log.term_of(req.last_index);
        if local_term != 0 && local_term >= req.last_term {
            return Ok(self.accept_response(&PgrepInfo::default()));
        }

        tracing::info!(last_index = req.last_index, "installing snapshot from leader");

        // Adopt the foreign boundary in memory first, then persist. Zero
        // trailing: the snapshot replaces everything.
        self.log.restore(req.last_index, req.last_term)?;
        self.last_stored = 0;
        let snapshot = Snapshot {
            index: req.last_index,
            term: req.last_term,
            configuration: req.configuration.clone(),
            configuration_index: req.configuration_index,
            bufs: req.data.clone(),
        };
        if let Err(err) = self.storage.snapshot_put(0, &snapshot).await {
            return Err(self.map_fatal_storage_error(err));
        }
        if let Err(err) = self.fsm.restore(snapshot.bufs).await {
            return Err(self.map_fatal_storage_error(err));
        }

        self.last_stored = req.last_index;
        self.commit_index = req.last_index;
        self.last_applied = req.last_index;
        self.last_applying = req.last_index;
        self.configuration = req.configuration;
        self.configuration_index = req.configuration_index;
        self.configuration_uncommitted_index = 0;
        self.committed_configuration = self.configuration.clone();
        if !self.configuration.contains(self.id) {
            self.removed = true;
        }
        self.report_metrics();

        Ok(self.accept_response(&PgrepInfo::default()))
    }

    /// Check whether enough entries have been applied since the last
    /// snapshot to take a new one.
    pub(super) fn should_take_snapshot(&self) -> bool {
        if matches!(self.target_state, State::Unavailable | State::Shutdown) {
            return false;
        }
        if self.snapshot_in_progress {
            return false;
        }
        if self.last_applied - self.log.snapshot_index() < self.config.snapshot_threshold {
            return false;
        }
        // Entries the catch-up target has not consumed yet must stay.
        if self.target_state.is_leader() && self.pgrep_id != 0 {
            let prev_applied = self
                .leader
                .as_ref()
                .and_then(|l| l.progress.get(&self.pgrep_id))
                .map(|p| p.prev_applied_index)
                .unwrap_or(0);
            if prev_applied.saturating_sub(self.log.snapshot_index()) < self.config.snapshot_threshold {
                return false;
            }
        }
        true
    }

    /// Capture the state machine at the applied index and persist it in the
    /// background; the log prefix is dropped once the put completes.
    pub(super) async fn take_snapshot(&mut self) -> RaftResult<()> {
        let index = self.last_applied;
        let term = self.log.term_of(index);
        let bufs = match self.fsm.snapshot().await {
            Ok(bufs) => bufs,
            Err(err) => {
                // Transient; retried after the next applied batch.
                tracing::warn!(error=%err, "state machine snapshot not available");
                return Ok(());
            }
        };
        tracing::info!(index, term, "taking snapshot");
        let snapshot = Snapshot {
            index,
            term,
            configuration: self.configuration.clone(),
            configuration_index: self.configuration_index,
            bufs,
        };
        self.snapshot_in_progress = true;
        let storage = self.storage.clone();
        let trailing = self.config.snapshot_trailing;
        let tx = self.tx_snapshot.clone();
        tokio::spawn(
            async move {
                match storage.snapshot_put(trailing, &snapshot).await {
                    Ok(()) => {
                        let _ = tx.try_send(SnapshotUpdate::SnapshotComplete(snapshot.index));
                    }
                    Err(err) => {
                        tracing::error!(error=%err, "error persisting snapshot");
                        let _ = tx.try_send(SnapshotUpdate::SnapshotFailed);
                    }
                }
            }
            .instrument(tracing::debug_span!("snapshot-put", index)),
        );
        Ok(())
    }
}
