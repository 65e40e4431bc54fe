//! Error types exposed by this crate.

use crate::ServerId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants surfaced at the crate boundary.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RaftError {
    /// The operation must be submitted to the cluster leader.
    ///
    /// The ID of the last known leader is included when available, so callers
    /// can redirect their request.
    #[error("this server is not the cluster leader")]
    NotLeader { leader: Option<ServerId> },

    /// No server in the configuration carries the given ID.
    #[error("no server in the configuration has the given ID")]
    BadId,

    /// The given role is not acceptable for the requested operation.
    #[error("the given role is not valid for this operation")]
    BadRole,

    /// A server with the given ID is already part of the configuration.
    #[error("a server with the given ID already exists")]
    DuplicateId,

    /// No matching server or transfer target was found.
    #[error("no matching server was found")]
    NotFound,

    /// An encoded configuration could not be decoded.
    #[error("the encoded configuration is malformed")]
    Malformed,

    /// A conflicting operation is already in progress; retry later.
    #[error("a conflicting operation is in progress")]
    Busy,

    /// The target server could not be reached; retried on the next heartbeat.
    #[error("could not reach the target server")]
    NoConnection,

    /// State corruption or an unrecoverable IO failure was detected and the
    /// server has become unavailable.
    #[error("raft is shutting down")]
    Shutdown,

    /// The affected log range is pinned by in-flight IO.
    #[error("the log range is referenced by in-flight IO")]
    LogBusy,

    /// Entries are still being applied to the state machine; retry later.
    #[error("entries are still being applied to the state machine")]
    ApplyBusy,

    /// The request was superseded by newer traffic and its result discarded.
    #[error("the request was discarded")]
    Discard,

    /// An error which has come from the `RaftStorage` layer.
    #[error("{0}")]
    Storage(anyhow::Error),

    /// An error which has come from the `RaftNetwork` layer.
    #[error("{0}")]
    Network(anyhow::Error),
}

/// Error variants related to building a runtime `Config`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The given values for election timeout min & max are invalid: max must
    /// be greater than min.
    #[error("election timeout max must be greater than min")]
    InvalidElectionTimeoutMinMax,

    /// An election_timeout_min at or below heartbeat_interval would cause
    /// endless elections.
    #[error("election_timeout_min must be greater than heartbeat_interval")]
    ElectionTimeoutLessThanHeartbeatInterval,

    /// The apply batch must make progress.
    #[error("apply_batch must be greater than 0")]
    ApplyBatchTooSmall,
}
