//! TCP binding configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpSocket;

use crate::{ProtocolError, Result};

/// Listener, socket and tls options for the tcp binding.
///
/// Socket sizes and the traffic class use -1 for "leave the OS default".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Interface to bind (e.g., "0.0.0.0")
    pub host: String,

    /// Port to bind; 0 picks an ephemeral port
    pub port: u16,

    /// Wrap every connection in tls
    pub ssl_enabled: bool,

    /// PEM certificate chain; a self-signed certificate is generated when absent
    pub cert_path: Option<PathBuf>,

    /// PEM private key matching `cert_path`
    pub key_path: Option<PathBuf>,

    /// PEM trust anchor for outgoing connections. When absent the client
    /// accepts any server certificate, which is what generated certificates need.
    pub ca_path: Option<PathBuf>,

    /// Requests handled concurrently by one server
    pub worker_threads: usize,

    /// SO_SNDBUF in bytes
    pub send_buffer_size: i64,

    /// SO_RCVBUF in bytes
    pub receive_buffer_size: i64,

    /// TCP_NODELAY
    pub no_delay: bool,

    /// SO_KEEPALIVE
    pub keep_alive: bool,

    /// SO_REUSEADDR
    pub reuse_address: bool,

    /// Pending connections the listener queues
    pub accept_backlog: u32,

    /// IP_TOS
    pub traffic_class: i32,

    pub connect_timeout_ms: u64,

    pub request_timeout_ms: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5555,
            ssl_enabled: false,
            cert_path: None,
            key_path: None,
            ca_path: None,
            worker_threads: 16,
            send_buffer_size: -1,
            receive_buffer_size: -1,
            no_delay: false,
            keep_alive: true,
            reuse_address: true,
            accept_backlog: 128,
            traffic_class: -1,
            connect_timeout_ms: 1_000,
            request_timeout_ms: 5_000,
        }
    }
}

impl TcpConfig {
    /// Load a configuration from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the options are usable together
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(ProtocolError::InvalidConfig(
                "worker_threads must be at least 1".into(),
            ));
        }
        if self.cert_path.is_some() != self.key_path.is_some() {
            return Err(ProtocolError::InvalidConfig(
                "cert_path and key_path must be given together".into(),
            ));
        }
        if self.traffic_class > 255 {
            return Err(ProtocolError::InvalidConfig(format!(
                "traffic_class {} is out of range",
                self.traffic_class
            )));
        }
        Ok(())
    }

    /// "host:port" this server binds
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// A size option, or None when left at -1
    pub(crate) fn buffer_size(value: i64) -> Option<u32> {
        u32::try_from(value).ok()
    }

    /// Set the socket options on a socket before it binds or connects
    pub(crate) fn apply_to(&self, socket: &TcpSocket) -> Result<()> {
        socket.set_reuseaddr(self.reuse_address)?;
        socket.set_keepalive(self.keep_alive)?;
        socket.set_nodelay(self.no_delay)?;
        if let Some(size) = Self::buffer_size(self.send_buffer_size) {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = Self::buffer_size(self.receive_buffer_size) {
            socket.set_recv_buffer_size(size)?;
        }
        if let Ok(tos) = u32::try_from(self.traffic_class) {
            #[allow(deprecated)]
            socket.set_tos(tos)?;
        }
        Ok(())
    }
}
