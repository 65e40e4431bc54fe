//! The Raft durability interface and data types.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::log::Entry;
use crate::membership::Configuration;
use crate::LogIndex;
use crate::ServerId;
use crate::Term;

/// A record holding the hard state of a Raft node.
///
/// The current term and vote must be durable before any outgoing RPC
/// reflects them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    /// The last term observed by this server.
    pub current_term: Term,
    /// The ID of the candidate voted for in `current_term`; zero when none.
    pub voted_for: ServerId,
}

/// A state-machine snapshot together with the metadata needed to restart
/// from it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The index of the last entry covered by the snapshot.
    pub index: LogIndex,
    /// The term of that entry.
    pub term: Term,
    /// The configuration as of the snapshot.
    pub configuration: Configuration,
    /// The index at which that configuration was committed.
    pub configuration_index: LogIndex,
    /// The opaque state-machine payload.
    pub bufs: Vec<Bytes>,
}

/// Everything a Raft node needs from stable storage when first starting.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The saved hard state of the node.
    pub hard_state: HardState,
    /// The configuration the node boots with. Superseded by any
    /// configuration found in `snapshot` or `entries`.
    pub configuration: Configuration,
    /// The index at which `configuration` was committed; zero for a
    /// bootstrap configuration.
    pub configuration_index: LogIndex,
    /// The most recent snapshot, when one exists.
    pub snapshot: Option<Snapshot>,
    /// The durable log suffix, starting right after the snapshot boundary
    /// (or at index 1 when there is no snapshot).
    pub entries: Vec<Entry>,
}

impl InitialState {
    /// Create a new instance for a pristine Raft node booting with the given
    /// configuration.
    pub fn new_initial(configuration: Configuration) -> Self {
        Self {
            hard_state: HardState {
                current_term: 0,
                voted_for: 0,
            },
            configuration,
            configuration_index: 0,
            snapshot: None,
            entries: Vec::new(),
        }
    }
}

/// A trait defining the interface to a Raft node's stable storage.
///
/// Errors returned from any of these methods are treated as fatal: the Raft
/// node transitions to the unavailable state to avoid data corruption.
#[async_trait]
pub trait RaftStorage: Send + Sync + 'static {
    /// Get Raft's state information from storage.
    ///
    /// When the Raft node is first started, it will call this interface to
    /// fetch the last known state from stable storage. A pristine node
    /// should respond with `InitialState::new_initial` carrying its boot
    /// configuration.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// Durably store the node's hard state.
    ///
    /// The core never issues a second metadata write before the previous one
    /// has completed.
    async fn set_meta(&self, hard_state: &HardState) -> Result<()>;

    /// Durably append the given entries, the first of which lives at
    /// `first_index`.
    ///
    /// Writes complete in submission order.
    async fn append(&self, first_index: LogIndex, entries: &[Entry]) -> Result<()>;

    /// Drop the durable log suffix from `from_index` onward.
    async fn truncate(&self, from_index: LogIndex) -> Result<()>;

    /// Durably store a snapshot.
    ///
    /// `trailing` is the number of log entries the caller intends to retain
    /// behind the snapshot; zero means the snapshot replaces everything.
    async fn snapshot_put(&self, trailing: u64, snapshot: &Snapshot) -> Result<()>;

    /// Fetch the most recent snapshot, when one exists.
    async fn snapshot_get(&self) -> Result<Option<Snapshot>>;
}
