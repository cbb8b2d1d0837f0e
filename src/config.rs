use super::error::{Error, Result};
use super::snapshot::SnapshotPolicy;
use super::NodeId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Node configuration. Timing inside the core is counted in ticks; `tick_interval_ms` says how
/// long a tick is when the node drives its own clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub id: NodeId,
    /// ticks without hearing from a leader before a follower campaigns; randomised up to twice this
    pub election_tick: u32,
    /// ticks between leader heartbeats
    pub heartbeat_tick: u32,
    /// most entries carried by one AppendEntries
    pub max_append_entries: usize,
    /// applied entries between snapshots, 0 disables snapshots
    pub snapshot_interval: u64,
    /// entries kept behind a snapshot for followers that are only slightly behind
    pub log_entries_for_slow_followers: u64,
    /// how long a proposal waits to be committed before giving up
    pub proposal_timeout_ms: u64,
    /// none means ticks are delivered by hand
    pub tick_interval_ms: Option<u64>,
    /// seed for the election timeout jitter
    pub seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            id: 0,
            election_tick: 10,
            heartbeat_tick: 1,
            max_append_entries: 64,
            snapshot_interval: 1000,
            log_entries_for_slow_followers: 500,
            proposal_timeout_ms: 10_000,
            tick_interval_ms: Some(100),
            seed: None,
        }
    }
}

impl Config {
    pub fn new(id: NodeId) -> Self {
        Config {
            id,
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id == 0 {
            return Err(Error::Config("id must not be 0".into()));
        }
        if self.heartbeat_tick == 0 {
            return Err(Error::Config("heartbeat_tick must be greater than 0".into()));
        }
        if self.election_tick <= self.heartbeat_tick {
            return Err(Error::Config(
                "election_tick must be greater than heartbeat_tick".into(),
            ));
        }
        if self.max_append_entries == 0 {
            return Err(Error::Config("max_append_entries must be greater than 0".into()));
        }
        Ok(())
    }

    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_millis(self.proposal_timeout_ms)
    }

    pub fn tick_interval(&self) -> Option<Duration> {
        self.tick_interval_ms.map(Duration::from_millis)
    }

    pub fn snapshot_policy(&self) -> SnapshotPolicy {
        SnapshotPolicy {
            interval: self.snapshot_interval,
            keep_entries: self.log_entries_for_slow_followers,
        }
    }
}
