//! # config
//!
//! why: everything one engine needs to know before it starts
//! relations: consumed by engine.rs and server.rs; embeds raft-core's RaftConfig
//! what: EngineConfig with defaults and a json file loader

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use raft_core::{Address, RaftConfig};

use crate::{EngineError, Result};

/// Configuration for a single consensus engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// This node's address; also its identity in the cluster.
    pub address: Address,

    /// Bootstrap membership, used until a Configuration entry commits.
    /// A node joining an existing cluster lists the current members and not
    /// itself, so it never campaigns before it is added.
    pub members: BTreeSet<Address>,

    /// Election and heartbeat timing.
    pub raft: RaftConfig,

    /// How long a submission may wait for its entry to commit.
    pub submit_timeout_ms: u64,

    /// Deadline for one RequestVote or AppendEntries call.
    pub rpc_timeout_ms: u64,

    /// First retry delay after a transport failure while replicating.
    pub backoff_base_ms: u64,

    /// Upper bound on the replication retry delay.
    pub backoff_max_ms: u64,

    /// Directory for durable state; in-memory storage when absent.
    pub data_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:5555".to_string(),
            members: BTreeSet::new(),
            raft: RaftConfig::default(),
            submit_timeout_ms: 5_000,
            rpc_timeout_ms: 500,
            backoff_base_ms: 20,
            backoff_max_ms: 1_000,
            data_dir: None,
        }
    }
}

impl EngineConfig {
    /// A config for `address` in a cluster bootstrapped with `members`
    pub fn new<I, A>(address: impl Into<Address>, members: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Address>,
    {
        Self {
            address: address.into(),
            members: members.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Load a configuration from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.as_ref().display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(EngineError::Config("address must not be empty".into()));
        }
        if self.members.is_empty() {
            return Err(EngineError::Config("members must not be empty".into()));
        }
        if self.raft.election_timeout_min > self.raft.election_timeout_max {
            return Err(EngineError::Config(
                "election_timeout_min exceeds election_timeout_max".into(),
            ));
        }
        if self.raft.heartbeat_interval >= self.raft.election_timeout_min {
            return Err(EngineError::Config(
                "heartbeat_interval must be shorter than the election timeout".into(),
            ));
        }
        Ok(())
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Delay before retrying a peer after `failures` consecutive transport errors
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u64 << failures.min(16);
        let ms = self.backoff_base_ms.saturating_mul(factor).min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}
