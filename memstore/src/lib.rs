//! An in-memory storage and state-machine implementation for `groupraft`,
//! for demo and testing purposes.

use std::collections::BTreeMap;

use anyhow::Result;
use bytes::Bytes;
use groupraft::async_trait::async_trait;
use groupraft::fsm::StateMachine;
use groupraft::log::Entry;
use groupraft::membership::Configuration;
use groupraft::storage::HardState;
use groupraft::storage::InitialState;
use groupraft::storage::RaftStorage;
use groupraft::storage::Snapshot;
use groupraft::LogIndex;
use groupraft::ServerId;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

/// The serialized form of the state machine inside a snapshot blob.
#[derive(Serialize, Deserialize)]
struct SnapshotPayload {
    last_applied: LogIndex,
    entries: Vec<(LogIndex, Vec<u8>)>,
}

/// An in-memory `RaftStorage` implementation.
pub struct MemStore {
    /// The ID of the Raft node for which this storage instance is configured.
    id: ServerId,
    /// The boot configuration handed out on first start.
    initial_configuration: Configuration,
    /// The durable log, keyed by index.
    log: RwLock<BTreeMap<LogIndex, Entry>>,
    /// The current hard state.
    hs: RwLock<Option<HardState>>,
    /// The current snapshot.
    current_snapshot: RwLock<Option<Snapshot>>,
}

impl MemStore {
    /// Create a new instance booting with the given configuration.
    pub fn new(id: ServerId, initial_configuration: Configuration) -> Self {
        Self {
            id,
            initial_configuration,
            log: RwLock::new(BTreeMap::new()),
            hs: RwLock::new(None),
            current_snapshot: RwLock::new(None),
        }
    }

    /// The node ID this store was built for.
    pub fn id(&self) -> ServerId {
        self.id
    }

    /// Get a full copy of the current log, for assertions in tests.
    pub async fn get_log(&self) -> BTreeMap<LogIndex, Entry> {
        self.log.read().await.clone()
    }

    /// Read the current hard state, for assertions in tests.
    pub async fn read_hard_state(&self) -> Option<HardState> {
        self.hs.read().await.clone()
    }

    /// Read the current snapshot, for assertions in tests.
    pub async fn read_snapshot(&self) -> Option<Snapshot> {
        self.current_snapshot.read().await.clone()
    }
}

#[async_trait]
impl RaftStorage for MemStore {
    #[tracing::instrument(level = "trace", skip(self))]
    async fn get_initial_state(&self) -> Result<InitialState> {
        let mut hs = self.hs.write().await;
        let log = self.log.read().await;
        let snapshot = self.current_snapshot.read().await;
        match &mut *hs {
            Some(inner) => {
                let first = snapshot.as_ref().map(|s| s.index + 1).unwrap_or(1);
                let entries = log.range(first..).map(|(_, entry)| entry.clone()).collect();
                Ok(InitialState {
                    hard_state: inner.clone(),
                    configuration: self.initial_configuration.clone(),
                    configuration_index: 0,
                    snapshot: snapshot.clone(),
                    entries,
                })
            }
            None => {
                let new = InitialState::new_initial(self.initial_configuration.clone());
                *hs = Some(new.hard_state.clone());
                Ok(new)
            }
        }
    }

    #[tracing::instrument(level = "trace", skip(self, hard_state))]
    async fn set_meta(&self, hard_state: &HardState) -> Result<()> {
        *self.hs.write().await = Some(hard_state.clone());
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, entries))]
    async fn append(&self, first_index: LogIndex, entries: &[Entry]) -> Result<()> {
        let mut log = self.log.write().await;
        for (i, entry) in entries.iter().enumerate() {
            log.insert(first_index + i as u64, entry.clone());
        }
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn truncate(&self, from_index: LogIndex) -> Result<()> {
        let mut log = self.log.write().await;
        log.split_off(&from_index);
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, snapshot), fields(index = snapshot.index))]
    async fn snapshot_put(&self, trailing: u64, snapshot: &Snapshot) -> Result<()> {
        let mut log = self.log.write().await;
        if trailing == 0 {
            log.clear();
        } else {
            let keep_from = snapshot.index.saturating_sub(trailing) + 1;
            *log = log.split_off(&keep_from);
        }
        *self.current_snapshot.write().await = Some(snapshot.clone());
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn snapshot_get(&self) -> Result<Option<Snapshot>> {
        Ok(self.current_snapshot.read().await.clone())
    }
}

/// An in-memory `StateMachine` implementation which records the applied
/// commands in order.
#[derive(Default)]
pub struct MemStateMachine {
    /// The applied commands, in log order.
    applied: RwLock<Vec<(LogIndex, Bytes)>>,
}

impl MemStateMachine {
    /// Create a new, empty state machine.
    pub fn new() -> Self {
        Default::default()
    }

    /// The index of the last applied command.
    pub async fn last_applied(&self) -> LogIndex {
        self.applied.read().await.last().map(|(index, _)| *index).unwrap_or(0)
    }

    /// A copy of the applied commands, for assertions in tests.
    pub async fn applied(&self) -> Vec<(LogIndex, Bytes)> {
        self.applied.read().await.clone()
    }
}

#[async_trait]
impl StateMachine for MemStateMachine {
    #[tracing::instrument(level = "trace", skip(self, command))]
    async fn apply(&self, index: LogIndex, command: &Bytes) -> Result<Bytes> {
        let mut applied = self.applied.write().await;
        applied.push((index, command.clone()));
        Ok(Bytes::from(index.to_string()))
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn snapshot(&self) -> Result<Vec<Bytes>> {
        let applied = self.applied.read().await;
        let payload = SnapshotPayload {
            last_applied: applied.last().map(|(index, _)| *index).unwrap_or(0),
            entries: applied.iter().map(|(index, data)| (*index, data.to_vec())).collect(),
        };
        Ok(vec![Bytes::from(serde_json::to_vec(&payload)?)])
    }

    #[tracing::instrument(level = "trace", skip(self, bufs))]
    async fn restore(&self, bufs: Vec<Bytes>) -> Result<()> {
        let mut applied = self.applied.write().await;
        applied.clear();
        for buf in bufs {
            let payload: SnapshotPayload = serde_json::from_slice(&buf)?;
            applied.extend(payload.entries.into_iter().map(|(index, data)| (index, Bytes::from(data))));
        }
        Ok(())
    }
}
