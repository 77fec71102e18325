//! # error
//!
//! why: separate "the call never got an answer" from protocol-level rejections
//! relations: returned by every handler, server and client in this crate
//! what: ProtocolError and the crate Result alias

use raft_core::Address;
use thiserror::Error;

/// Failures of the transport itself. Raft rejections (stale term, log
/// inconsistency, not leader) travel inside successful responses instead.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The target is reachable but has no request handler registered
    #[error("no request handler registered at {address}")]
    NoHandler { address: Address },

    /// The target could not be reached at all
    #[error("{address} is unreachable: {reason}")]
    Unreachable { address: Address, reason: String },

    /// The target did not answer in time
    #[error("request to {address} timed out")]
    Timeout { address: Address },

    /// The connection closed before the response arrived
    #[error("connection closed")]
    ConnectionClosed,

    /// The server is not running or has been stopped
    #[error("server is not running")]
    NotRunning,

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    /// The remote handler failed to produce a response
    #[error("remote handler failed: {0}")]
    Remote(String),

    /// A response arrived that does not match the request kind
    #[error("unexpected response: expected {expected}")]
    UnexpectedResponse { expected: &'static str },

    #[error("tls error: {0}")]
    Tls(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub fn unreachable(address: impl Into<Address>, reason: impl ToString) -> Self {
        Self::Unreachable {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this failure came from the transport (worth retrying later)
    /// rather than from a malformed exchange
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::NoHandler { .. }
                | Self::Unreachable { .. }
                | Self::Timeout { .. }
                | Self::ConnectionClosed
                | Self::NotRunning
                | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
