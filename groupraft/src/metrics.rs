//! Raft metrics for observability.
//!
//! Applications may use this data in whatever way is needed. The obvious use
//! cases are to expose these metrics to a metrics collection system, or to
//! trigger events within higher levels of the parent application.
//!
//! Metrics are observed on a running Raft node via the `Raft::metrics()`
//! method, which returns a watch channel of metrics payloads.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::sleep_until;
use tokio::time::Instant;

use crate::core::State;
use crate::membership::Configuration;
use crate::LogIndex;
use crate::ServerId;
use crate::Term;

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The ID of the Raft node.
    pub id: ServerId,
    /// The state of the Raft node.
    pub state: State,
    /// The current term of the Raft node.
    pub current_term: Term,
    /// The last log index to be appended to this Raft node's log.
    pub last_log_index: LogIndex,
    /// The last log index to be applied to this Raft node's state machine.
    pub last_applied: LogIndex,
    /// The index of the highest log entry known to be committed.
    pub commit_index: LogIndex,
    /// The index of the last entry covered by the most recent snapshot.
    pub snapshot_index: LogIndex,
    /// The current cluster leader, when known.
    pub current_leader: Option<ServerId>,
    /// The current membership config of the cluster.
    pub configuration: Configuration,
    /// Whether this server has observed its own removal from the cluster.
    pub removed: bool,
}

impl RaftMetrics {
    pub(crate) fn new_initial(id: ServerId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            commit_index: 0,
            snapshot_index: 0,
            current_leader: None,
            configuration: Configuration::new(),
            removed: false,
        }
    }
}

/// Error returned when a metrics condition was not satisfied in time.
#[derive(Debug, thiserror::Error)]
#[error("timeout after {timeout:?} waiting for {msg}: latest {latest:?}")]
pub struct WaitError {
    /// How long the waiter was prepared to wait.
    pub timeout: Duration,
    /// A description of the condition.
    pub msg: String,
    /// The last metrics payload observed.
    pub latest: Box<RaftMetrics>,
}

/// A handle for awaiting metrics conditions, for tests and tooling.
pub struct Wait {
    /// How long to wait before giving up.
    pub timeout: Duration,
    /// The metrics channel to watch.
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait until the metrics satisfy the given predicate.
    pub async fn metrics<F>(&self, func: F, msg: impl ToString) -> Result<RaftMetrics, WaitError>
    where F: Fn(&RaftMetrics) -> bool {
        let deadline = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            if func(&latest) {
                return Ok(latest);
            }
            tokio::select! {
                _ = sleep_until(deadline) => {
                    return Err(WaitError {
                        timeout: self.timeout,
                        msg: msg.to_string(),
                        latest: Box::new(latest),
                    });
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(WaitError {
                            timeout: self.timeout,
                            msg: format!("metrics channel closed while waiting for {}", msg.to_string()),
                            latest: Box::new(latest),
                        });
                    }
                }
            }
        }
    }

    /// Wait for the log to reach the given index.
    pub async fn log(&self, want: LogIndex, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index >= want,
            format!("{} last_log_index >= {}", msg.to_string(), want),
        )
        .await
    }

    /// Wait for the applied index to reach the given index.
    pub async fn applied(&self, want: LogIndex, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.last_applied >= want,
            format!("{} last_applied >= {}", msg.to_string(), want),
        )
        .await
    }

    /// Wait for the node to reach the given state.
    pub async fn state(&self, want: State, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(|m| m.state == want, format!("{} state == {:?}", msg.to_string(), want)).await
    }

    /// Wait for the node to observe the given leader.
    pub async fn current_leader(&self, want: ServerId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader == Some(want),
            format!("{} current_leader == {}", msg.to_string(), want),
        )
        .await
    }
}
