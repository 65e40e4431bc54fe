//! The Raft network interface.

use anyhow::Result;
use async_trait::async_trait;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::TimeoutNowRequest;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::ServerId;

/// A trait defining the interface for the network between cluster members.
///
/// Errors returned from these methods are non-fatal; the affected follower's
/// progress falls back to probing and the send is retried on a later
/// heartbeat.
#[async_trait]
pub trait RaftNetwork: Send + Sync + 'static {
    /// Send an AppendEntries RPC to the target Raft node.
    async fn append_entries(&self, target: ServerId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse>;

    /// Send an InstallSnapshot RPC to the target Raft node.
    ///
    /// The receiver acknowledges with the same result shape as
    /// AppendEntries, reporting the restored log boundary.
    async fn install_snapshot(&self, target: ServerId, rpc: InstallSnapshotRequest) -> Result<AppendEntriesResponse>;

    /// Send a RequestVote RPC to the target Raft node.
    async fn vote(&self, target: ServerId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Tell the target to start an election immediately, as part of a
    /// leadership transfer.
    async fn timeout_now(&self, target: ServerId, rpc: TimeoutNowRequest) -> Result<()>;
}
