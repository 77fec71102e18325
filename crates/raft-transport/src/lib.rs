//! # raft-transport
//!
//! why: let the consensus engine talk to peers without knowing how bytes move
//! relations: carries raft-core messages; raft-engine implements ProtocolHandler
//! and drives ProtocolServer/ProtocolClient
//! what: handler/server/client traits, an in-process local binding, and a
//! tcp binding with optional tls

pub mod codec;
pub mod error;
pub mod handler;
pub mod local;
pub mod tcp;

pub use codec::{ClientCodec, Envelope, FrameCodec, RemoteError, Reply, ServerCodec, MAX_FRAME_SIZE};
pub use error::{ProtocolError, Result};
pub use handler::{dispatch, ProtocolClient, ProtocolHandler, ProtocolServer};
pub use local::{LocalClient, LocalRegistry, LocalServer};
pub use tcp::{TcpClient, TcpConfig, TcpServer};
