//! # config
//!
//! why: tune timing, batching and snapshot policy per peer
//! relations: read by engine/ and runtime.rs; loaded by the surrounding service
//! what: RaftConfig with defaults, validation and json loading

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::PeerId;

/// Configuration for one raft peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// this peer's id; 0 is reserved for "no peer"
    pub peer: PeerId,
    /// voting membership at startup
    pub members: Vec<PeerId>,
    /// lower bound of the randomized election timeout (ms)
    pub election_timeout_min: u64,
    /// upper bound of the randomized election timeout (ms)
    pub election_timeout_max: u64,
    /// leader heartbeat period (ms)
    pub heartbeat_interval: u64,
    /// max entries carried by one append
    pub max_batch: usize,
    /// stored log bytes below which no snapshot is taken
    pub snapshot_min_bytes: u64,
    /// max bytes of snapshot data per install message
    pub snapshot_chunk_size: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            peer: 1,
            members: vec![1],
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            max_batch: 64,
            snapshot_min_bytes: 64 * 1024 * 1024,
            snapshot_chunk_size: 1024 * 1024,
        }
    }
}

impl RaftConfig {
    pub fn new(peer: PeerId, members: Vec<PeerId>) -> Self {
        Self {
            peer,
            members,
            ..Self::default()
        }
    }

    /// Parse a json document; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: RaftConfig =
            serde_json::from_str(text).map_err(|e| RaftError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.peer == 0 {
            return Err(RaftError::InvalidConfig("peer id 0 is reserved".to_string()));
        }
        if self.members.contains(&0) {
            return Err(RaftError::InvalidConfig("member id 0 is reserved".to_string()));
        }
        if self.election_timeout_min == 0 || self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::InvalidConfig(format!(
                "election timeout range {}..={} is empty",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat interval {}ms must be below the election timeout",
                self.heartbeat_interval
            )));
        }
        if self.max_batch == 0 || self.snapshot_chunk_size == 0 {
            return Err(RaftError::InvalidConfig("batch and chunk sizes must be non-zero".to_string()));
        }
        Ok(())
    }

    /// A fresh randomized election timeout within the configured range
    pub fn election_timeout(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.election_timeout_min..=self.election_timeout_max);
        Duration::from_millis(ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }
}
