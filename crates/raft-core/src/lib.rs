//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-engine on a tokio runtime, persisted via raft-storage,
//! messages carried by raft-transport
//! what: replicated log, cluster membership, message types, sans-io node state machine

pub mod error;
pub mod log;
pub mod membership;
pub mod message;
pub mod node;

pub use error::SubmitError;
pub use log::{Log, LogEntry, LogWrite};
pub use membership::ClusterConfiguration;
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, Committed, Rejection, Request, RequestVoteRequest,
    RequestVoteResponse, Response, SubmitCommandRequest, SubmitCommandResponse,
};
pub use node::{HardState, NodeState, RaftConfig, RaftNode};

/// Network address of a cluster member (`host:port` for tcp, any unique name for local clusters)
pub type Address = String;
