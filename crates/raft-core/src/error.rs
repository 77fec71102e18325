//! # error
//!
//! why: give callers of submit a closed set of failures they can act on
//! relations: carried inside SubmitCommandResponse, produced by node.rs and raft-engine
//! what: SubmitError

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Address;

/// Why a command or configuration change was not committed
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SubmitError {
    /// The node is not the leader, or lost leadership before the entry committed
    #[error("not the leader (leader hint: {leader:?})")]
    NotLeader { leader: Option<Address> },

    /// No majority committed the entry in time; it may still commit later
    #[error("timed out waiting for the entry to commit")]
    Timeout,

    /// A configuration change is already appended but not yet committed
    #[error("a configuration change is already in progress")]
    ConfigurationChangeInProgress,

    /// The submission could not reach the node
    #[error("node unavailable: {0}")]
    Unavailable(String),
}

impl SubmitError {
    pub fn not_leader(leader: Option<Address>) -> Self {
        Self::NotLeader { leader }
    }
}
