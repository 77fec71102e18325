//! # error
//!
//! why: one error type for starting, running and stopping an engine
//! relations: wraps raft-storage io errors and raft-transport ProtocolError
//! what: EngineError and the crate Result alias

use raft_transport::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Durable state could not be read or written; the engine stops
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] ProtocolError),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The engine task is no longer running
    #[error("engine stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, EngineError>;
