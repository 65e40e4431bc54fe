//! The finite state machine driven by committed log entries.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::LogIndex;

/// The application state machine that committed commands are applied to.
///
/// The core guarantees that `apply` is invoked exactly once per committed
/// command, in log order, and never before the entry is durable locally.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Apply a committed command, returning an opaque result for the client
    /// that proposed it.
    ///
    /// An error fails the proposing client's request but does not halt the
    /// server; the entry still counts as applied.
    async fn apply(&self, index: LogIndex, command: &Bytes) -> Result<Bytes>;

    /// Capture the current state as a set of opaque buffers.
    async fn snapshot(&self) -> Result<Vec<Bytes>>;

    /// Replace the current state with the contents of a snapshot.
    async fn restore(&self, bufs: Vec<Bytes>) -> Result<()>;
}
