//! Per-follower replication progress tracking.
//!
//! Leaders keep one `Progress` per configuration slot. A follower is driven
//! through three modes: `Probe` conservatively sends one window per heartbeat
//! until a match is found, `Pipeline` streams entries ahead of
//! acknowledgements, and `Snapshot` marks a follower that is being sent a
//! state-machine snapshot. All transition rules live here; callers never
//! poke at the fields directly.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::membership::Configuration;
use crate::LogIndex;
use crate::ServerId;

/// The replication mode of a single follower.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressState {
    /// Conservative one-window-at-a-time matching.
    Probe,
    /// Streaming ahead of acknowledgements.
    Pipeline,
    /// A snapshot is being installed on the follower.
    Snapshot,
}

/// The leader's view of one follower's replication state.
#[derive(Clone, Debug)]
pub struct Progress {
    /// The current replication mode.
    state: ProgressState,
    /// The index of the next entry to send.
    pub next_index: LogIndex,
    /// The highest index known to be replicated on the follower.
    pub match_index: LogIndex,
    /// The snapshot boundary being installed; meaningful only in `Snapshot`.
    pub snapshot_index: LogIndex,
    /// When an AppendEntries was last dispatched to the follower.
    last_send: Option<Instant>,
    /// When an InstallSnapshot was last dispatched to the follower.
    snapshot_last_send: Option<Instant>,
    /// Whether the follower has responded since the last reset.
    pub recent_recv: bool,
    /// When the follower last responded.
    pub recent_recv_time: Instant,
    /// The applied index acknowledged by the catch-up target at the start of
    /// the current partial-replication window.
    pub prev_applied_index: LogIndex,
    /// Whether the follower is being caught up through partial replication.
    pub pgreplicating: bool,
    /// Set when the server has been dropped from the configuration: it keeps
    /// receiving entries until it acknowledges the removal entry at this
    /// index, then its slot is discarded.
    pub remove_after: Option<LogIndex>,
    /// Whether a frame carrying the commit of the removal entry has been
    /// dispatched to a departing server.
    pub removal_notified: bool,
}

impl Progress {
    fn new(last_index: LogIndex, now: Instant) -> Self {
        Self {
            state: ProgressState::Probe,
            next_index: last_index + 1,
            match_index: 0,
            snapshot_index: 0,
            last_send: None,
            snapshot_last_send: None,
            recent_recv: false,
            recent_recv_time: now,
            prev_applied_index: 0,
            pgreplicating: false,
            remove_after: None,
            removal_notified: false,
        }
    }

    /// The current replication mode.
    pub fn state(&self) -> ProgressState {
        self.state
    }

    /// Check whether the follower has acknowledged the whole log.
    pub fn is_up_to_date(&self, last_index: LogIndex) -> bool {
        self.next_index == last_index + 1
    }

    fn should_pipe_more(&self, inflight_log_threshold: u64) -> bool {
        if inflight_log_threshold == 0 {
            return true;
        }
        if self.next_index <= self.match_index {
            return true;
        }
        self.next_index - self.match_index - 1 < inflight_log_threshold
    }

    /// Decide whether the leader should send to this follower now.
    ///
    /// A timed-out snapshot installation is aborted here and falls back to
    /// probing.
    pub fn should_replicate(
        &mut self,
        now: Instant,
        last_index: LogIndex,
        heartbeat_interval: Duration,
        install_snapshot_timeout: Duration,
        inflight_log_threshold: u64,
    ) -> bool {
        let needs_heartbeat = match self.last_send {
            Some(at) => now.saturating_duration_since(at) >= heartbeat_interval,
            None => true,
        };
        match self.state {
            ProgressState::Snapshot => {
                let timed_out = match self.snapshot_last_send {
                    Some(at) => now.saturating_duration_since(at) >= install_snapshot_timeout,
                    None => true,
                };
                if timed_out {
                    self.abort_snapshot();
                    true
                } else {
                    // Keep asserting leadership while the follower installs.
                    needs_heartbeat
                }
            }
            ProgressState::Probe => needs_heartbeat,
            ProgressState::Pipeline => {
                (!self.is_up_to_date(last_index) && self.should_pipe_more(inflight_log_threshold)) || needs_heartbeat
            }
        }
    }

    /// Record the rejection of an AppendEntries and adjust `next_index`.
    ///
    /// Returns true when the leader should immediately retry.
    pub fn maybe_decrement(&mut self, rejected: LogIndex, result_last_index: LogIndex, log_last_index: LogIndex) -> bool {
        match self.state {
            ProgressState::Snapshot => {
                // The rejection is stale or spurious unless it refers to the
                // snapshot being installed.
                if rejected != self.snapshot_index {
                    return false;
                }
                self.abort_snapshot();
                true
            }
            ProgressState::Pipeline => {
                if rejected <= self.match_index {
                    // Stale rejection, except when the follower restarted
                    // from scratch and must be reinitialized.
                    if result_last_index == 1 {
                        *self = Progress::new(log_last_index, Instant::now());
                    }
                    return false;
                }
                self.next_index = std::cmp::min(rejected, self.match_index + 1);
                self.to_probe();
                true
            }
            ProgressState::Probe => {
                if rejected != self.next_index.saturating_sub(1) {
                    return false;
                }
                self.next_index = std::cmp::min(rejected, result_last_index + 1);
                if self.next_index == 0 {
                    self.next_index = 1;
                }
                true
            }
        }
    }

    /// Optimistically advance `next_index` after a pipelined dispatch.
    pub fn optimistic_next_index(&mut self, next_index: LogIndex) {
        self.next_index = next_index;
    }

    /// Record an acknowledged index. Returns true when `match_index` moved.
    pub fn maybe_update(&mut self, last_index: LogIndex) -> bool {
        let mut updated = false;
        if self.match_index < last_index {
            self.match_index = last_index;
            updated = true;
        }
        if self.next_index < last_index + 1 {
            self.next_index = last_index + 1;
        }
        updated
    }

    /// Fall back to probing.
    pub fn to_probe(&mut self) {
        if self.state == ProgressState::Snapshot {
            // The pending snapshot has been installed; probe from its end.
            self.next_index = std::cmp::max(self.match_index + 1, self.snapshot_index);
            self.snapshot_index = 0;
        } else {
            self.next_index = self.match_index + 1;
        }
        self.state = ProgressState::Probe;
    }

    /// Switch to pipelined streaming.
    pub fn to_pipeline(&mut self) {
        self.state = ProgressState::Pipeline;
    }

    /// Mark the follower as receiving the snapshot with the given boundary.
    pub fn to_snapshot(&mut self, snapshot_index: LogIndex) {
        self.state = ProgressState::Snapshot;
        self.snapshot_index = snapshot_index;
    }

    /// Abandon the in-flight snapshot and fall back to probing.
    pub fn abort_snapshot(&mut self) {
        self.snapshot_index = 0;
        self.state = ProgressState::Probe;
    }

    /// Check whether the installed snapshot is fully acknowledged.
    pub fn snapshot_done(&self) -> bool {
        self.match_index >= self.snapshot_index
    }

    /// Record that an AppendEntries was dispatched.
    pub fn update_last_send(&mut self, now: Instant) {
        self.last_send = Some(now);
    }

    /// Record that an InstallSnapshot was dispatched.
    pub fn update_snapshot_last_send(&mut self, now: Instant) {
        self.snapshot_last_send = Some(now);
    }

    /// Record that the follower responded.
    pub fn mark_recent_recv(&mut self, now: Instant) {
        self.recent_recv = true;
        self.recent_recv_time = now;
    }

    /// Clear and return the recent-receive flag.
    pub fn reset_recent_recv(&mut self) -> bool {
        std::mem::replace(&mut self.recent_recv, false)
    }
}

/// Build fresh progress tracking for the given configuration, keyed by
/// server ID.
///
/// The slot of the leader itself starts with `match_index` at its stored
/// index.
pub fn build_array(
    configuration: &Configuration,
    self_id: ServerId,
    last_index: LogIndex,
    last_stored: LogIndex,
    now: Instant,
) -> BTreeMap<ServerId, Progress> {
    configuration
        .servers
        .iter()
        .map(|server| {
            let mut progress = Progress::new(last_index, now);
            if server.id == self_id {
                progress.match_index = last_stored;
            }
            (server.id, progress)
        })
        .collect()
}

/// Rebuild the progress tracking for a new configuration: servers present in
/// both keep their state, new ones are initialized, and servers no longer in
/// the configuration stay behind so the caller can mark them as departing.
pub fn rebuild_array(
    progress: &BTreeMap<ServerId, Progress>,
    new: &Configuration,
    last_index: LogIndex,
    now: Instant,
) -> BTreeMap<ServerId, Progress> {
    let mut rebuilt = progress.clone();
    for server in &new.servers {
        rebuilt.entry(server.id).or_insert_with(|| Progress::new(last_index, now));
    }
    rebuilt
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{Group, Role};

    fn probe(next: LogIndex, matched: LogIndex) -> Progress {
        let mut p = Progress::new(0, Instant::now());
        p.next_index = next;
        p.match_index = matched;
        p
    }

    #[test]
    fn probe_decrement_requires_matching_rejection() {
        let mut p = probe(5, 0);
        assert!(!p.maybe_decrement(2, 7, 10));
        assert_eq!(p.next_index, 5);
        assert!(p.maybe_decrement(4, 7, 10));
        assert_eq!(p.next_index, 4);
    }

    #[test]
    fn probe_decrement_clamps_to_follower_last_index() {
        let mut p = probe(9, 0);
        assert!(p.maybe_decrement(8, 2, 10));
        assert_eq!(p.next_index, 3);
    }

    #[test]
    fn pipeline_decrement_falls_back_to_probe() {
        let mut p = probe(9, 4);
        p.to_pipeline();
        assert!(p.maybe_decrement(7, 7, 10));
        assert_eq!(p.state(), ProgressState::Probe);
        assert_eq!(p.next_index, 5);
    }

    #[test]
    fn pipeline_ignores_stale_rejection() {
        let mut p = probe(9, 4);
        p.to_pipeline();
        assert!(!p.maybe_decrement(3, 7, 10));
        assert_eq!(p.state(), ProgressState::Pipeline);
        assert_eq!(p.next_index, 9);
    }

    #[test]
    fn pipeline_reinitializes_follower_started_over() {
        let mut p = probe(9, 4);
        p.to_pipeline();
        assert!(!p.maybe_decrement(3, 1, 10));
        assert_eq!(p.state(), ProgressState::Probe);
        assert_eq!(p.next_index, 11);
        assert_eq!(p.match_index, 0);
    }

    #[test]
    fn snapshot_decrement_only_accepts_snapshot_index() {
        let mut p = probe(9, 4);
        p.to_snapshot(20);
        assert!(!p.maybe_decrement(9, 9, 30));
        assert_eq!(p.state(), ProgressState::Snapshot);
        assert!(p.maybe_decrement(20, 9, 30));
        assert_eq!(p.state(), ProgressState::Probe);
        assert_eq!(p.snapshot_index, 0);
    }

    #[test]
    fn match_index_is_monotonic() {
        let mut p = probe(5, 3);
        assert!(p.maybe_update(6));
        assert_eq!(p.match_index, 6);
        assert_eq!(p.next_index, 7);
        assert!(!p.maybe_update(2));
        assert_eq!(p.match_index, 6);
    }

    #[test]
    fn to_probe_after_snapshot_probes_from_snapshot_end() {
        let mut p = probe(5, 3);
        p.to_snapshot(20);
        p.to_probe();
        assert_eq!(p.next_index, 20);
        p.maybe_update(25);
        assert_eq!(p.match_index, 25);
    }

    #[test]
    fn pipeline_respects_inflight_window() {
        let mut p = probe(10, 2);
        p.to_pipeline();
        let now = Instant::now();
        p.update_last_send(now);
        // Window of 7 unacknowledged entries against a threshold of 8.
        assert!(p.should_replicate(now, 20, Duration::from_millis(50), Duration::from_secs(1), 8));
        assert!(!p.should_replicate(now, 20, Duration::from_millis(50), Duration::from_secs(1), 7));
        // Unbounded window always streams.
        assert!(p.should_replicate(now, 20, Duration::from_millis(50), Duration::from_secs(1), 0));
    }

    #[test]
    fn rebuild_carries_forward_matching_ids() {
        let now = Instant::now();
        let mut old = Configuration::new();
        old.add(1, Role::Voter, Role::Voter, Group::OLD).unwrap();
        old.add(2, Role::Voter, Role::Voter, Group::OLD).unwrap();
        let mut progress = build_array(&old, 1, 10, 10, now);
        progress.get_mut(&2).unwrap().maybe_update(7);

        let mut new = Configuration::new();
        new.add(2, Role::Voter, Role::Voter, Group::OLD).unwrap();
        new.add(3, Role::Spare, Role::Spare, Group::OLD).unwrap();
        let rebuilt = rebuild_array(&progress, &new, 12, now);
        // Server 1 stays behind for departure handling, 2 carries forward,
        // 3 starts fresh from the current end of the log.
        assert_eq!(rebuilt.len(), 3);
        assert_eq!(rebuilt[&2].match_index, 7);
        assert_eq!(rebuilt[&3].match_index, 0);
        assert_eq!(rebuilt[&3].next_index, 13);
        assert_eq!(rebuilt[&1].match_index, 10);
    }
}
