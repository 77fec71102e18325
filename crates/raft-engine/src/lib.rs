//! # raft-engine
//!
//! why: run raft-core's node as a live cluster member
//! relations: drives raft-core, persists through raft-storage, speaks through
//! raft-transport (local registry or tcp)
//! what: async engine task, handle and protocol handler, server glue, config

mod config;
mod engine;
mod error;
mod event;
mod handle;
mod replication;
mod server;
mod state_machine;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use handle::{EngineHandler, RaftHandle, Status};
pub use server::{open_storage, RaftServer};
pub use state_machine::StateMachine;
