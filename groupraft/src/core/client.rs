//! Client write and barrier entrypoints.

use bytes::Bytes;

use crate::core::Pending;
use crate::core::RaftCore;
use crate::error::RaftError;
use crate::fsm::StateMachine;
use crate::network::RaftNetwork;
use crate::pgrep::PgrepHook;
use crate::raft::ClientWriteResponse;
use crate::raft::RaftRespTx;
use crate::storage::RaftStorage;
use crate::LogIndex;

impl<N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> RaftCore<N, S, F, P> {
    /// Append a batch of client commands, register the response callback and
    /// trigger replication.
    ///
    /// Rejected with `NotLeader` off the leader, during a leadership
    /// transfer, and after this leader has appended its own removal.
    #[tracing::instrument(level = "trace", skip(self, commands, tx))]
    pub(super) async fn handle_client_write(&mut self, commands: Vec<Bytes>, tx: RaftRespTx<ClientWriteResponse, RaftError>) {
        if commands.is_empty() {
            let _ = tx.send(Err(RaftError::Malformed));
            return;
        }
        if !self.is_serving_leader() {
            let _ = tx.send(Err(RaftError::NotLeader {
                leader: self.current_leader_opt(),
            }));
            return;
        }
        let first = self.log.append_commands(self.current_term, &commands);
        let last = first + commands.len() as u64 - 1;
        tracing::debug!(first, last, "accepted client commands");
        if let Some(leader) = self.leader.as_mut() {
            leader.requests.insert(last, Pending::Write(tx));
        }
        if let Err(err) = self.replication_trigger(first).await {
            self.unwind_client_request(first, last, err);
            return;
        }
        // A single-voter cluster commits on the local append alone.
        let _ = self.replication_apply().await;
    }

    /// Append a barrier entry and register its callback.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    pub(super) async fn handle_barrier(&mut self, tx: RaftRespTx<LogIndex, RaftError>) {
        if !self.is_serving_leader() {
            let _ = tx.send(Err(RaftError::NotLeader {
                leader: self.current_leader_opt(),
            }));
            return;
        }
        let index = self.log.append(self.current_term, crate::log::EntryPayload::Barrier);
        tracing::debug!(index, "accepted barrier");
        if let Some(leader) = self.leader.as_mut() {
            leader.requests.insert(index, Pending::Barrier(tx));
        }
        if let Err(err) = self.replication_trigger(index).await {
            self.unwind_client_request(index, index, err);
            return;
        }
        let _ = self.replication_apply().await;
    }

    /// Unwind a client request whose local append failed: fire its callback
    /// with the error and drop the in-memory suffix.
    fn unwind_client_request(&mut self, first: LogIndex, last: LogIndex, err: RaftError) {
        if let Some(leader) = self.leader.as_mut() {
            match leader.requests.remove(&last) {
                Some(Pending::Write(tx)) => {
                    let _ = tx.send(Err(err));
                }
                Some(Pending::Barrier(tx)) => {
                    let _ = tx.send(Err(err));
                }
                None => {}
            }
        }
        if self.log.discard(first).is_err() {
            tracing::warn!(first, "could not discard entries of a failed append");
        }
    }
}
