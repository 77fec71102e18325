//! # tcp
//!
//! why: carry raft traffic between processes and hosts
//! relations: implements ProtocolServer/ProtocolClient with codec.rs framing
//! what: TcpConfig, TcpServer, TcpClient, tls helpers

mod client;
mod config;
mod server;
pub mod tls;

pub use client::TcpClient;
pub use config::TcpConfig;
pub use server::TcpServer;
