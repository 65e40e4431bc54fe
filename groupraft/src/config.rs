//! Raft runtime configuration.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Default election timeout minimum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 150;
/// Default election timeout maximum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 300;
/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default timeout for an InstallSnapshot round-trip, in milliseconds.
pub const DEFAULT_INSTALL_SNAPSHOT_TIMEOUT: u64 = 3000;
/// Default number of applied entries after which a snapshot is taken.
pub const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 1024;
/// Default number of entries retained in the log after a snapshot.
pub const DEFAULT_SNAPSHOT_TRAILING: u64 = 2048;
/// Default number of catch-up rounds granted to a promotee.
pub const DEFAULT_MAX_CATCH_UP_ROUNDS: u64 = 10;
/// Default apply-loop chunk while a catch-up target is active.
pub const DEFAULT_APPLY_BATCH: u64 = 8;

/// The runtime configuration for a Raft node.
///
/// When building the configuration for your application, remember this
/// inequality from the Raft spec: `broadcastTime ≪ electionTimeout ≪ MTBF`.
/// Keep the election timeout high enough that network latency will not cause
/// spurious elections, but not so high that a real leader crash causes
/// prolonged downtime.
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    ///
    /// This does not influence the protocol in any way, but is useful for
    /// observability.
    pub cluster_name: String,
    /// The minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout in milliseconds.
    pub election_timeout_max: u64,
    /// The interval in milliseconds at which leaders will send AppendEntries
    /// to followers absent new entries.
    pub heartbeat_interval: u64,
    /// How long a pending InstallSnapshot may go unacknowledged before the
    /// follower's progress falls back to probing.
    pub install_snapshot_timeout: u64,
    /// The number of entries applied since the last snapshot after which a
    /// new snapshot is taken.
    pub snapshot_threshold: u64,
    /// The number of entries kept in the log after taking a snapshot, so that
    /// slightly-lagging followers can still be caught up from the log.
    pub snapshot_trailing: u64,
    /// The maximum number of unacknowledged entries a pipelined follower may
    /// accumulate before the leader stops streaming to it. Zero disables the
    /// window.
    pub inflight_log_threshold: u64,
    /// The number of log catch-up rounds a promotee is granted before the
    /// promotion is abandoned.
    pub max_catch_up_rounds: u64,
    /// The apply-loop chunk size used while a partial-replication catch-up
    /// target exists, so control returns to other events between chunks.
    pub apply_batch: u64,
    /// Whether candidates run a pre-vote phase before a real election.
    pub pre_vote: bool,
    /// Whether a new leader appends a barrier entry when taking office.
    pub no_op_barrier: bool,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    ///
    /// Call `validate` when done to produce the final config.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            install_snapshot_timeout: None,
            snapshot_threshold: None,
            snapshot_trailing: None,
            inflight_log_threshold: None,
            max_catch_up_rounds: None,
            apply_batch: None,
            pre_vote: None,
            no_op_barrier: None,
        }
    }

    /// Generate a new random election timeout within the configured min & max.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A configuration builder to ensure that runtime config is valid.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigBuilder {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The minimum election timeout, in milliseconds.
    pub election_timeout_min: Option<u64>,
    /// The maximum election timeout, in milliseconds.
    pub election_timeout_max: Option<u64>,
    /// The heartbeat interval, in milliseconds.
    pub heartbeat_interval: Option<u64>,
    /// The InstallSnapshot acknowledgement timeout, in milliseconds.
    pub install_snapshot_timeout: Option<u64>,
    /// The snapshot threshold.
    pub snapshot_threshold: Option<u64>,
    /// The number of trailing entries kept after a snapshot.
    pub snapshot_trailing: Option<u64>,
    /// The pipeline inflight window.
    pub inflight_log_threshold: Option<u64>,
    /// The maximum number of promotion catch-up rounds.
    pub max_catch_up_rounds: Option<u64>,
    /// The catch-up apply chunk size.
    pub apply_batch: Option<u64>,
    /// Whether to run the pre-vote phase.
    pub pre_vote: Option<bool>,
    /// Whether a new leader appends a no-op barrier.
    pub no_op_barrier: Option<bool>,
}

impl ConfigBuilder {
    /// Set the desired value for `election_timeout_min`.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the desired value for `election_timeout_max`.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the desired value for `heartbeat_interval`.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the desired value for `install_snapshot_timeout`.
    pub fn install_snapshot_timeout(mut self, val: u64) -> Self {
        self.install_snapshot_timeout = Some(val);
        self
    }

    /// Set the desired value for `snapshot_threshold`.
    pub fn snapshot_threshold(mut self, val: u64) -> Self {
        self.snapshot_threshold = Some(val);
        self
    }

    /// Set the desired value for `snapshot_trailing`.
    pub fn snapshot_trailing(mut self, val: u64) -> Self {
        self.snapshot_trailing = Some(val);
        self
    }

    /// Set the desired value for `inflight_log_threshold`.
    pub fn inflight_log_threshold(mut self, val: u64) -> Self {
        self.inflight_log_threshold = Some(val);
        self
    }

    /// Set the desired value for `max_catch_up_rounds`.
    pub fn max_catch_up_rounds(mut self, val: u64) -> Self {
        self.max_catch_up_rounds = Some(val);
        self
    }

    /// Set the desired value for `apply_batch`.
    pub fn apply_batch(mut self, val: u64) -> Self {
        self.apply_batch = Some(val);
        self
    }

    /// Enable or disable the pre-vote phase.
    pub fn pre_vote(mut self, val: bool) -> Self {
        self.pre_vote = Some(val);
        self
    }

    /// Enable or disable the leader's initial no-op barrier.
    pub fn no_op_barrier(mut self, val: bool) -> Self {
        self.no_op_barrier = Some(val);
        self
    }

    /// Validate the state of this builder and produce a new `Config` instance if valid.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN);
        let election_timeout_max = self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX);
        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if election_timeout_min <= heartbeat_interval {
            return Err(ConfigError::ElectionTimeoutLessThanHeartbeatInterval);
        }
        let install_snapshot_timeout = self.install_snapshot_timeout.unwrap_or(DEFAULT_INSTALL_SNAPSHOT_TIMEOUT);
        let snapshot_threshold = self.snapshot_threshold.unwrap_or(DEFAULT_SNAPSHOT_THRESHOLD);
        let snapshot_trailing = self.snapshot_trailing.unwrap_or(DEFAULT_SNAPSHOT_TRAILING);
        let inflight_log_threshold = self.inflight_log_threshold.unwrap_or(0);
        let max_catch_up_rounds = self.max_catch_up_rounds.unwrap_or(DEFAULT_MAX_CATCH_UP_ROUNDS);
        let apply_batch = self.apply_batch.unwrap_or(DEFAULT_APPLY_BATCH);
        if apply_batch == 0 {
            return Err(ConfigError::ApplyBatchTooSmall);
        }
        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            install_snapshot_timeout,
            snapshot_threshold,
            snapshot_trailing,
            inflight_log_threshold,
            max_catch_up_rounds,
            apply_batch,
            pre_vote: self.pre_vote.unwrap_or(true),
            no_op_barrier: self.no_op_barrier.unwrap_or(false),
        })
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::build("cluster0".into()).validate().unwrap();

        assert_eq!(cfg.election_timeout_min, DEFAULT_ELECTION_TIMEOUT_MIN);
        assert_eq!(cfg.election_timeout_max, DEFAULT_ELECTION_TIMEOUT_MAX);
        assert_eq!(cfg.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(cfg.install_snapshot_timeout, DEFAULT_INSTALL_SNAPSHOT_TIMEOUT);
        assert_eq!(cfg.snapshot_threshold, DEFAULT_SNAPSHOT_THRESHOLD);
        assert_eq!(cfg.snapshot_trailing, DEFAULT_SNAPSHOT_TRAILING);
        assert_eq!(cfg.inflight_log_threshold, 0);
        assert_eq!(cfg.max_catch_up_rounds, DEFAULT_MAX_CATCH_UP_ROUNDS);
        assert_eq!(cfg.apply_batch, DEFAULT_APPLY_BATCH);
        assert!(cfg.pre_vote);
        assert!(!cfg.no_op_barrier);
    }

    #[test]
    fn test_config_with_specified_values() {
        let cfg = Config::build("cluster0".into())
            .election_timeout_max(200)
            .election_timeout_min(100)
            .heartbeat_interval(10)
            .install_snapshot_timeout(500)
            .snapshot_threshold(100)
            .snapshot_trailing(20)
            .inflight_log_threshold(64)
            .max_catch_up_rounds(5)
            .apply_batch(4)
            .pre_vote(false)
            .no_op_barrier(true)
            .validate()
            .unwrap();

        assert_eq!(cfg.election_timeout_min, 100);
        assert_eq!(cfg.election_timeout_max, 200);
        assert_eq!(cfg.heartbeat_interval, 10);
        assert_eq!(cfg.install_snapshot_timeout, 500);
        assert_eq!(cfg.snapshot_threshold, 100);
        assert_eq!(cfg.snapshot_trailing, 20);
        assert_eq!(cfg.inflight_log_threshold, 64);
        assert_eq!(cfg.max_catch_up_rounds, 5);
        assert_eq!(cfg.apply_batch, 4);
        assert!(!cfg.pre_vote);
        assert!(cfg.no_op_barrier);
    }

    #[test]
    fn test_invalid_election_timeout_config_produces_expected_error() {
        let res = Config::build("cluster0".into())
            .election_timeout_min(1000)
            .election_timeout_max(700)
            .validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidElectionTimeoutMinMax);
    }

    #[test]
    fn test_rand_election_timeout_is_within_bounds() {
        let cfg = Config::build("cluster0".into()).validate().unwrap();
        for _ in 0..50 {
            let timeout = cfg.new_rand_election_timeout();
            assert!(timeout >= cfg.election_timeout_min);
            assert!(timeout < cfg.election_timeout_max);
        }
    }
}
