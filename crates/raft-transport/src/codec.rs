//! # codec
//!
//! why: frame raft messages on a byte stream and match replies to requests
//! relations: used by tcp::server and tcp::client through tokio_util::codec::Framed
//! what: Envelope{id, body}, FrameCodec (4-byte big-endian length + json), RemoteError

use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

use raft_core::{Request, Response};

use crate::{ProtocolError, Result};

/// Largest frame either side will accept (16 MiB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// A message plus the id that pairs a response with its request, so many
/// calls can share one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: u64,
    pub body: T,
}

/// Why the remote side could not produce a response.
///
/// Transport-level failures keep their kind across the wire so a tcp caller
/// sees the same [`ProtocolError`] variant a local caller would.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteError {
    /// No live handler behind the server
    NoHandler,
    /// The handler itself gave up waiting on something
    Timeout,
    /// The handler could not reach a node it depends on
    Unreachable { reason: String },
    Failed(String),
}

impl RemoteError {
    /// Classify a handler failure for the wire
    pub fn from_error(error: &ProtocolError) -> Self {
        match error {
            ProtocolError::NoHandler { .. } | ProtocolError::NotRunning => Self::NoHandler,
            ProtocolError::Timeout { .. } => Self::Timeout,
            ProtocolError::Unreachable { reason, .. } => Self::Unreachable {
                reason: reason.clone(),
            },
            other => Self::Failed(other.to_string()),
        }
    }

    /// Rebuild the error as seen by a caller of `target`
    pub fn into_error(self, target: &str) -> ProtocolError {
        match self {
            Self::NoHandler => ProtocolError::NoHandler {
                address: target.to_string(),
            },
            Self::Timeout => ProtocolError::Timeout {
                address: target.to_string(),
            },
            Self::Unreachable { reason } => ProtocolError::unreachable(target, reason),
            Self::Failed(reason) => ProtocolError::Remote(reason),
        }
    }
}

/// What a server writes back for each request
pub type Reply = std::result::Result<Response, RemoteError>;

/// Length-prefixed json framing, decoding `In` and encoding `Out`
///
/// Frame format: [4-byte length (big-endian)] [json payload]
pub struct FrameCodec<In, Out> {
    _marker: PhantomData<fn(Out) -> In>,
}

impl<In, Out> FrameCodec<In, Out> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<In, Out> Default for FrameCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

/// Server side: reads requests, writes replies
pub type ServerCodec = FrameCodec<Envelope<Request>, Envelope<Reply>>;

/// Client side: reads replies, writes requests
pub type ClientCodec = FrameCodec<Envelope<Reply>, Envelope<Request>>;

impl<In: DeserializeOwned, Out> Decoder for FrameCodec<In, Out> {
    type Item = In;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        // read length prefix without consuming
        let mut length_bytes = [0u8; LENGTH_PREFIX];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(length));
        }

        if src.len() < LENGTH_PREFIX + length {
            src.reserve(LENGTH_PREFIX + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let payload = src.split_to(length);
        Ok(Some(serde_json::from_slice(&payload)?))
    }
}

impl<In, Out: Serialize> Encoder<Out> for FrameCodec<In, Out> {
    type Error = ProtocolError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<()> {
        let payload = serde_json::to_vec(&item)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(payload.len()));
        }

        dst.reserve(LENGTH_PREFIX + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}
