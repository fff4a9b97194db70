//! Runtime configuration of a Raft server core.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;
use crate::GroupId;

/// Default election timeout minimum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 150;
/// Default election timeout maximum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 300;
/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default threshold for followers to be considered lagging.
pub const DEFAULT_REPLICATION_LAG_THRESHOLD: u64 = 1000;
/// Default maximum number of entries per AppendEntries payload.
pub const DEFAULT_MAX_PAYLOAD_ENTRIES: u64 = 300;
/// Default snapshot chunk size, 3MiB.
pub const DEFAULT_SNAPSHOT_MAX_CHUNK_SIZE: u64 = 3 * 1024 * 1024;
/// Default logs-since-last snapshot policy threshold.
pub const DEFAULT_LOGS_UNTIL_SNAPSHOT: u64 = 5000;
/// Default timeout for a single InstallSnapshot RPC, in milliseconds.
pub const DEFAULT_INSTALL_SNAPSHOT_TIMEOUT: u64 = 200;
/// Default cap on an asynchronous state machine snapshot install, in milliseconds.
pub const DEFAULT_SNAPSHOT_INSTALL_TIMEOUT: u64 = 300_000;
/// Default threshold after which an appender's RPCs are reported as slow, in milliseconds.
pub const DEFAULT_RPC_SLOWNESS_TIMEOUT: u64 = 10_000;
/// Default capacity of the at-most-once retry cache.
pub const DEFAULT_RETRY_CACHE_CAPACITY: usize = 4096;
/// Default expiry of retry cache entries, in milliseconds.
pub const DEFAULT_RETRY_CACHE_EXPIRY: u64 = 60_000;

/// Log compaction and snapshot policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// A snapshot will be generated once the log has grown the specified number of logs since
    /// the last snapshot.
    LogsSinceLast(u64),
}

/// The runtime configuration of a Raft server core.
///
/// The election timeout is the amount of time a follower waits without hearing from a valid
/// leader before becoming a candidate; it is drawn uniformly from
/// `[election_timeout_min, election_timeout_max)` on every entry to the follower role and on
/// every valid leader RPC.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The identifier of the Raft group this peer participates in.
    pub group_id: GroupId,
    /// The minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout in milliseconds.
    pub election_timeout_max: u64,
    /// The interval at which leaders send heartbeats, in milliseconds.
    pub heartbeat_interval: u64,
    /// The distance behind in log replication a follower must fall before it is considered
    /// lagging.
    pub replication_lag_threshold: u64,
    /// The maximum number of entries per AppendEntries payload.
    pub max_payload_entries: u64,
    /// The snapshot policy.
    pub snapshot_policy: SnapshotPolicy,
    /// The maximum snapshot chunk size allowed when streaming snapshots to followers, in bytes.
    pub snapshot_max_chunk_size: u64,
    /// Whether snapshots are transferred to followers as chunks of bytes.
    ///
    /// When `false`, followers are only notified that a snapshot is required and the state
    /// machine obtains the snapshot data itself.
    pub install_snapshot_enabled: bool,
    /// The timeout for a single InstallSnapshot RPC, in milliseconds.
    pub install_snapshot_timeout: u64,
    /// The cap on an asynchronous state machine snapshot install, in milliseconds.
    ///
    /// When the state machine has not settled a notified install within this window, the
    /// in-progress marker is cleared so that the install can be retried.
    pub snapshot_install_timeout: u64,
    /// The threshold after which a follower's RPC round-trips are reported as slow, in
    /// milliseconds.
    pub rpc_slowness_timeout: u64,
    /// The maximum number of entries held by the at-most-once retry cache.
    pub retry_cache_capacity: usize,
    /// The expiry of retry cache entries, in milliseconds.
    pub retry_cache_expiry: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(group_id: GroupId) -> ConfigBuilder {
        ConfigBuilder {
            group_id,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            replication_lag_threshold: None,
            max_payload_entries: None,
            snapshot_policy: None,
            snapshot_max_chunk_size: None,
            install_snapshot_enabled: None,
            install_snapshot_timeout: None,
            snapshot_install_timeout: None,
            rpc_slowness_timeout: None,
            retry_cache_capacity: None,
            retry_cache_expiry: None,
        }
    }

    /// Generate a new random election timeout within the configured min & max.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A configuration builder.
pub struct ConfigBuilder {
    group_id: GroupId,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_interval: Option<u64>,
    replication_lag_threshold: Option<u64>,
    max_payload_entries: Option<u64>,
    snapshot_policy: Option<SnapshotPolicy>,
    snapshot_max_chunk_size: Option<u64>,
    install_snapshot_enabled: Option<bool>,
    install_snapshot_timeout: Option<u64>,
    snapshot_install_timeout: Option<u64>,
    rpc_slowness_timeout: Option<u64>,
    retry_cache_capacity: Option<usize>,
    retry_cache_expiry: Option<u64>,
}

impl ConfigBuilder {
    /// Set the minimum election timeout in milliseconds.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the maximum election timeout in milliseconds.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the heartbeat interval in milliseconds.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the threshold for when a follower is considered lagging.
    pub fn replication_lag_threshold(mut self, val: u64) -> Self {
        self.replication_lag_threshold = Some(val);
        self
    }

    /// Set the maximum number of entries per AppendEntries payload.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Set the snapshot policy.
    pub fn snapshot_policy(mut self, val: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(val);
        self
    }

    /// Set the maximum snapshot chunk size.
    pub fn snapshot_max_chunk_size(mut self, val: u64) -> Self {
        self.snapshot_max_chunk_size = Some(val);
        self
    }

    /// Select chunk transfer (`true`) or notification (`false`) snapshot installation.
    pub fn install_snapshot_enabled(mut self, val: bool) -> Self {
        self.install_snapshot_enabled = Some(val);
        self
    }

    /// Set the timeout for a single InstallSnapshot RPC, in milliseconds.
    pub fn install_snapshot_timeout(mut self, val: u64) -> Self {
        self.install_snapshot_timeout = Some(val);
        self
    }

    /// Set the cap on an asynchronous state machine snapshot install, in milliseconds.
    pub fn snapshot_install_timeout(mut self, val: u64) -> Self {
        self.snapshot_install_timeout = Some(val);
        self
    }

    /// Set the threshold after which a follower's RPCs are reported slow, in milliseconds.
    pub fn rpc_slowness_timeout(mut self, val: u64) -> Self {
        self.rpc_slowness_timeout = Some(val);
        self
    }

    /// Set the capacity of the at-most-once retry cache.
    pub fn retry_cache_capacity(mut self, val: usize) -> Self {
        self.retry_cache_capacity = Some(val);
        self
    }

    /// Set the expiry of retry cache entries, in milliseconds.
    pub fn retry_cache_expiry(mut self, val: u64) -> Self {
        self.retry_cache_expiry = Some(val);
        self
    }

    /// Validate the state of this builder, returning a usable `Config` on success.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN);
        let election_timeout_max = self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX);
        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if election_timeout_min <= heartbeat_interval {
            return Err(ConfigError::InvalidElectionTimeoutHeartbeat);
        }
        let max_payload_entries = self.max_payload_entries.unwrap_or(DEFAULT_MAX_PAYLOAD_ENTRIES);
        if max_payload_entries == 0 {
            return Err(ConfigError::MaxPayloadEntriesTooSmall);
        }
        let retry_cache_capacity = self.retry_cache_capacity.unwrap_or(DEFAULT_RETRY_CACHE_CAPACITY);
        if retry_cache_capacity == 0 {
            return Err(ConfigError::RetryCacheCapacityTooSmall);
        }
        Ok(Config {
            group_id: self.group_id,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            replication_lag_threshold: self.replication_lag_threshold.unwrap_or(DEFAULT_REPLICATION_LAG_THRESHOLD),
            max_payload_entries,
            snapshot_policy: self
                .snapshot_policy
                .unwrap_or(SnapshotPolicy::LogsSinceLast(DEFAULT_LOGS_UNTIL_SNAPSHOT)),
            snapshot_max_chunk_size: self.snapshot_max_chunk_size.unwrap_or(DEFAULT_SNAPSHOT_MAX_CHUNK_SIZE),
            install_snapshot_enabled: self.install_snapshot_enabled.unwrap_or(true),
            install_snapshot_timeout: self.install_snapshot_timeout.unwrap_or(DEFAULT_INSTALL_SNAPSHOT_TIMEOUT),
            snapshot_install_timeout: self.snapshot_install_timeout.unwrap_or(DEFAULT_SNAPSHOT_INSTALL_TIMEOUT),
            rpc_slowness_timeout: self.rpc_slowness_timeout.unwrap_or(DEFAULT_RPC_SLOWNESS_TIMEOUT),
            retry_cache_capacity,
            retry_cache_expiry: self.retry_cache_expiry.unwrap_or(DEFAULT_RETRY_CACHE_EXPIRY),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::build("cluster0".into()).validate().unwrap();
        assert_eq!("cluster0", &cfg.group_id);
        assert_eq!(DEFAULT_ELECTION_TIMEOUT_MIN, cfg.election_timeout_min);
        assert_eq!(DEFAULT_ELECTION_TIMEOUT_MAX, cfg.election_timeout_max);
        assert!(cfg.install_snapshot_enabled);
    }

    #[test]
    fn test_invalid_election_timeouts_rejected() {
        let res = Config::build("cluster0".into())
            .election_timeout_min(300)
            .election_timeout_max(150)
            .validate();
        assert!(matches!(res, Err(ConfigError::InvalidElectionTimeoutMinMax)));

        let res = Config::build("cluster0".into())
            .election_timeout_min(40)
            .election_timeout_max(80)
            .heartbeat_interval(50)
            .validate();
        assert!(matches!(res, Err(ConfigError::InvalidElectionTimeoutHeartbeat)));
    }

    #[test]
    fn test_rand_election_timeout_within_bounds() {
        let cfg = Config::build("cluster0".into()).validate().unwrap();
        for _ in 0..100 {
            let t = cfg.new_rand_election_timeout();
            assert!(t >= cfg.election_timeout_min);
            assert!(t < cfg.election_timeout_max);
        }
    }
}
