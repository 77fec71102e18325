//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by node.rs, serialized by raft-transport
//! what: AppendEntries, RequestVote, SubmitCommand request/response pairs and the
//! tagged Request/Response unions used on the wire

use serde::{Deserialize, Serialize};

use crate::{Address, LogEntry, SubmitError};

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: Address,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

impl AppendEntriesRequest {
    /// Index of the last entry carried, or `prev_log_index` for a heartbeat
    pub fn last_index(&self) -> u64 {
        self.prev_log_index + self.entries.len() as u64
    }
}

/// Why an AppendEntries was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rejection {
    /// The request's term is behind the receiver's
    StaleTerm,
    /// The receiver has no entry matching `(prev_log_index, prev_log_term)`;
    /// the leader should retry from `next_index_hint` or earlier
    LogInconsistency { next_index_hint: u64 },
}

/// Response to AppendEntries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub rejection: Option<Rejection>,
}

impl AppendEntriesResponse {
    pub fn accepted(term: u64) -> Self {
        Self {
            term,
            success: true,
            rejection: None,
        }
    }

    pub fn stale_term(term: u64) -> Self {
        Self {
            term,
            success: false,
            rejection: Some(Rejection::StaleTerm),
        }
    }

    pub fn inconsistent(term: u64, next_index_hint: u64) -> Self {
        Self {
            term,
            success: false,
            rejection: Some(Rejection::LogInconsistency { next_index_hint }),
        }
    }
}

/// Request a vote during leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: Address,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Response to a vote request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// Client command submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitCommandRequest {
    pub command: Vec<u8>,
}

/// Where a submitted entry landed and what applying it produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committed {
    pub index: u64,
    pub output: Vec<u8>,
}

/// Response to a command submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitCommandResponse {
    pub result: Result<Committed, SubmitError>,
}

impl SubmitCommandResponse {
    pub fn committed(index: u64, output: Vec<u8>) -> Self {
        Self {
            result: Ok(Committed { index, output }),
        }
    }

    pub fn failed(error: SubmitError) -> Self {
        Self { result: Err(error) }
    }
}

/// Every request a node can receive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Request {
    AppendEntries(AppendEntriesRequest),
    RequestVote(RequestVoteRequest),
    SubmitCommand(SubmitCommandRequest),
}

/// Every response a node can send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Response {
    AppendEntries(AppendEntriesResponse),
    RequestVote(RequestVoteResponse),
    SubmitCommand(SubmitCommandResponse),
}
