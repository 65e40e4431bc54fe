//! Partial-replication (pgrep) catch-up throttling.
//!
//! An external copy process can bring a standby follower's state machine up
//! to date much faster than log replay. While it runs, the leader must fence
//! its own apply loop and catch-up traffic behind permits handed out by the
//! copy process, and the follower must keep its reply back until its apply
//! loop has drained, so the leader knows the previous window is consumed
//! before sending the next one.
//!
//! The hooks are an injected capability. The default `NoopPgrep` keeps the
//! mechanism inert: permits are always granted and no catch-up rounds are
//! ever reported, which preserves plain Raft behavior (lagging followers are
//! then served through snapshot installation instead).

use serde::Deserialize;
use serde::Serialize;

use crate::ServerId;
use crate::Term;

/// The role an AppendEntries message plays in a partial-replication round.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PgrepRound {
    /// Ordinary replication traffic; not part of a catch-up round.
    #[default]
    Normal,
    /// A heartbeat sent while a catch-up round is active.
    Heartbeat,
    /// The first message of a round, carrying no entries, used to agree on
    /// the follower's stored index.
    Begin,
    /// A section of entries within an ongoing round.
    Ongoing,
    /// Marks a reply that was produced before the apply loop drained.
    Error,
}

/// Permit and round state piggybacked on AppendEntries traffic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgrepInfo {
    /// Whether the sender holds a catch-up permit.
    pub permit: bool,
    /// The message's role in the current round.
    pub round: PgrepRound,
    /// A monotonically increasing stamp used to drop stale frames.
    pub time: u64,
}

impl PgrepInfo {
    /// Check whether the message belongs to catch-up traffic.
    pub fn is_replicating(&self) -> bool {
        self.round != PgrepRound::Normal
    }
}

/// The state of the external catch-up process, as reported by its tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PgrepTick {
    /// A new round may start; the follower's state machine is in sync up to
    /// the leader's applied index.
    Begin,
    /// A round is in progress and more sections can be sent.
    Running,
    /// The target has fully caught up and can be promoted back.
    Finished,
    /// The catch-up was aborted; fall back to heartbeats.
    Aborted,
    /// The target was removed; fall back to heartbeats.
    Removed,
    /// The copy process cannot accept traffic right now.
    Backoff,
}

/// The copy checkpoint the state machine must not apply past.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PgrepBoundary {
    /// The object the copy process is currently transferring.
    pub obj_id: u64,
    /// The chunk within that object.
    pub chunk_id: u32,
}

/// Hooks connecting the Raft core to an external catch-up process.
pub trait PgrepHook: Send + Sync + 'static {
    /// Whether a copy process is attached at all. When false, lagging
    /// followers are caught up through snapshot installation instead.
    fn active(&self) -> bool;

    /// Try to acquire the catch-up permit, updating `info.permit`.
    fn permit(&self, info: &mut PgrepInfo);

    /// Release a held permit.
    fn unpermit(&self, info: &mut PgrepInfo);

    /// Drive the copy process and report its state for the given target.
    fn tick(&self, leader: ServerId, target: ServerId, term: Term, info: &mut PgrepInfo) -> PgrepTick;

    /// The checkpoint that currently fences the apply loop.
    fn boundary(&self) -> PgrepBoundary;

    /// Forget the copy checkpoint; called when ordinary replication resumes.
    fn reset_checkpoint(&self);

    /// Record the stamp of the latest accepted catch-up frame.
    fn update_catch_up_time(&self, time: u64);
}

/// An inert `PgrepHook`: permits are always granted, no catch-up is ever
/// reported.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPgrep;

impl PgrepHook for NoopPgrep {
    fn active(&self) -> bool {
        false
    }

    fn permit(&self, info: &mut PgrepInfo) {
        info.permit = true;
    }

    fn unpermit(&self, info: &mut PgrepInfo) {
        info.permit = false;
    }

    fn tick(&self, _leader: ServerId, _target: ServerId, _term: Term, _info: &mut PgrepInfo) -> PgrepTick {
        PgrepTick::Backoff
    }

    fn boundary(&self) -> PgrepBoundary {
        PgrepBoundary::default()
    }

    fn reset_checkpoint(&self) {}

    fn update_catch_up_time(&self, _time: u64) {}
}
