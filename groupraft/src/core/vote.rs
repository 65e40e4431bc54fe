use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::error::RaftResult;
use crate::fsm::StateMachine;
use crate::membership::Group;
use crate::membership::Phase;
use crate::network::RaftNetwork;
use crate::pgrep::PgrepHook;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::storage::RaftStorage;
use crate::ServerId;
use crate::Term;

impl<N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> RaftCore<N, S, F, P> {
    /// An RPC invoked by candidates to gather votes, including the
    /// non-binding pre-vote probes that precede a real election.
    #[tracing::instrument(level = "trace", skip(self, msg), fields(candidate=msg.candidate_id, term=msg.term, pre_vote=msg.pre_vote))]
    pub(super) async fn handle_vote_request(&mut self, msg: VoteRequest) -> RaftResult<VoteResponse> {
        // Servers in contact with a live leader do not update their term or
        // grant their vote, so a partitioned server cannot disturb the
        // cluster when it comes back. Leadership transfer carries explicit
        // permission to disrupt.
        let has_leader = self.target_state.is_leader()
            || (self.target_state.is_follower() && self.current_leader != 0 && self.heard_from_leader_recently());
        if has_leader && !msg.disrupt_leader {
            tracing::trace!("local server has a leader, rejecting vote request");
            return Ok(self.vote_response(false, msg.pre_vote));
        }

        if msg.term < self.current_term {
            tracing::trace!("vote request term is behind, rejecting");
            return Ok(self.vote_response(false, msg.pre_vote));
        }

        // Grant only to candidates whose log is at least as up-to-date.
        let local_last_term = self.log.last_term();
        let up_to_date = msg.last_log_term > local_last_term
            || (msg.last_log_term == local_last_term && msg.last_log_index >= self.log.last_index());

        if msg.pre_vote {
            // Pre-vote never bumps the term and never persists anything.
            return Ok(self.vote_response(up_to_date, true));
        }

        let mut dirty = false;
        if msg.term > self.current_term {
            self.update_current_term(msg.term, 0);
            if !self.target_state.is_follower() {
                self.set_target_state(State::Follower);
                self.current_leader = 0;
            }
            dirty = true;
        }

        let granted = up_to_date && (self.voted_for == 0 || self.voted_for == msg.candidate_id);
        if granted {
            if self.voted_for != msg.candidate_id {
                self.voted_for = msg.candidate_id;
                dirty = true;
            }
            self.update_next_election_timeout(false);
        }

        // The new term and vote must be durable before the response leaves.
        if dirty {
            self.save_hard_state().await?;
            self.report_metrics();
        }
        tracing::trace!(granted, "processed vote request");
        Ok(self.vote_response(granted, false))
    }

    fn vote_response(&self, vote_granted: bool, pre_vote: bool) -> VoteResponse {
        VoteResponse {
            term: self.current_term,
            vote_granted,
            pre_vote,
        }
    }

    /// Check whether an AppendEntries or InstallSnapshot arrived within the
    /// minimum election timeout.
    fn heard_from_leader_recently(&self) -> bool {
        match self.last_heartbeat {
            Some(at) => {
                Instant::now().saturating_duration_since(at)
                    <= std::time::Duration::from_millis(self.config.election_timeout_min)
            }
            None => false,
        }
    }
}

impl<'a, N: RaftNetwork, S: RaftStorage, F: StateMachine, P: PgrepHook> CandidateState<'a, N, S, F, P> {
    /// Handle a response from a vote request sent to a peer.
    #[tracing::instrument(level = "trace", skip(self, res, target))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: ServerId) {
        if self.in_pre_vote {
            // Pre-vote replies may legitimately carry the candidate's
            // would-be term; anything further ahead is a real newer term.
            if res.term > self.core.current_term + 1 {
                self.revert_to_follower(res.term).await;
                return;
            }
            if !res.pre_vote {
                return;
            }
        } else {
            if res.pre_vote {
                // A straggler from the pre-vote phase; it was never persisted
                // by the voter, so it must not count.
                return;
            }
            if res.term > self.core.current_term {
                self.revert_to_follower(res.term).await;
                return;
            }
            if res.term < self.core.current_term {
                return;
            }
        }

        if !res.vote_granted {
            return;
        }
        if !self.granted.contains(&target) {
            self.granted.push(target);
        }
        if !self.has_quorum() {
            return;
        }
        if self.in_pre_vote {
            tracing::trace!("pre-vote quorum reached, starting the real election");
            self.in_pre_vote = false;
        } else {
            tracing::trace!("votes quorum reached, converting to leader");
            self.core.set_target_state(State::Leader);
        }
    }

    async fn revert_to_follower(&mut self, term: Term) {
        self.core.update_current_term(term, 0);
        if self.core.save_hard_state().await.is_err() {
            return;
        }
        self.core.current_leader = 0;
        self.core.set_target_state(State::Follower);
        tracing::trace!("reverting to follower due to greater term observed in vote response");
    }

    /// Check whether the granted set reaches quorum, in both views when the
    /// configuration is in joint phase.
    pub(super) fn has_quorum(&self) -> bool {
        let configuration = &self.core.configuration;
        let old = configuration.has_quorum(Group::OLD, &self.granted);
        match configuration.phase {
            Phase::Normal => old,
            Phase::Joint => old && configuration.has_quorum(Group::NEW, &self.granted),
        }
    }

    /// Spawn parallel vote requests to all voters of the configuration.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&self, term: Term) -> mpsc::Receiver<(VoteResponse, ServerId)> {
        let targets: Vec<ServerId> = self
            .core
            .configuration
            .servers
            .iter()
            .filter(|s| s.id != self.core.id && s.is_voter(Group::ANY))
            .map(|s| s.id)
            .collect();
        let (tx, rx) = mpsc::channel(std::cmp::max(targets.len(), 1));
        for target in targets {
            let rpc = VoteRequest {
                term,
                candidate_id: self.core.id,
                last_log_index: self.core.log.last_index(),
                last_log_term: self.core.log.last_term(),
                pre_vote: self.in_pre_vote,
                disrupt_leader: self.disrupt_leader,
            };
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            let _ = tokio::spawn(
                async move {
                    match network.vote(target, rpc).await {
                        Ok(res) => {
                            let _ = tx_inner.send((res, target)).await;
                        }
                        Err(err) => tracing::warn!({error=%err, peer=target}, "error while requesting vote from peer"),
                    }
                }
                .instrument(tracing::trace_span!("requesting vote from peer", target = target)),
            );
        }
        rx
    }
}
