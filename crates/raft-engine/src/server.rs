//! # server
//!
//! why: wire an engine to a transport binding in one call
//! relations: owns an engine (engine.rs), a raft-transport ProtocolServer and
//! ProtocolClient, and a raft-storage backend
//! what: RaftServer start/stop plus local and tcp constructors

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use raft_storage::{FileStorage, InMemoryStorage, Storage};
use raft_transport::{
    LocalRegistry, ProtocolClient, ProtocolServer, TcpClient, TcpConfig, TcpServer,
};

use crate::engine::Engine;
use crate::{EngineConfig, EngineError, RaftHandle, Result, StateMachine};

/// A running node: engine, protocol server and outbound client
pub struct RaftServer {
    handle: RaftHandle,
    server: Arc<dyn ProtocolServer>,
    client: Arc<dyn ProtocolClient>,
    task: JoinHandle<Result<()>>,
}

/// FileStorage under `data_dir` when configured, otherwise in memory
pub fn open_storage(config: &EngineConfig) -> Result<Box<dyn Storage>> {
    Ok(match &config.data_dir {
        Some(dir) => Box::new(FileStorage::new(dir)?),
        None => Box::new(InMemoryStorage::new()),
    })
}

impl RaftServer {
    /// Start an engine and serve it through `server`, reaching peers with `client`
    pub async fn start(
        config: EngineConfig,
        storage: Box<dyn Storage>,
        state_machine: impl StateMachine,
        server: Arc<dyn ProtocolServer>,
        client: Arc<dyn ProtocolClient>,
    ) -> Result<Self> {
        if server.address() != config.address {
            return Err(EngineError::Config(format!(
                "engine address {} does not match server address {}",
                config.address,
                server.address()
            )));
        }

        let (handle, task) = Engine::spawn(config, storage, Box::new(state_machine), client.clone())?;
        server.bind_handler(handle.handler());
        if let Err(e) = server.start().await {
            server.unbind_handler();
            let _ = handle.shutdown().await;
            return Err(e.into());
        }

        info!(address = %handle.address(), "raft server started");
        Ok(Self {
            handle,
            server,
            client,
            task,
        })
    }

    /// A node on an in-process registry
    pub async fn local(
        registry: &LocalRegistry,
        config: EngineConfig,
        state_machine: impl StateMachine,
    ) -> Result<Self> {
        let storage = open_storage(&config)?;
        let server = Arc::new(registry.server(config.address.clone()));
        let client = Arc::new(registry.client(config.address.clone()));
        Self::start(config, storage, state_machine, server, client).await
    }

    /// A node listening on tcp.
    ///
    /// The listener is bound first, so `tcp.port` may be 0; the engine's
    /// address is then taken from the bound socket.
    pub async fn tcp(
        mut config: EngineConfig,
        tcp: TcpConfig,
        state_machine: impl StateMachine,
    ) -> Result<Self> {
        let server = Arc::new(TcpServer::new(tcp.clone()));
        server.start().await?;
        if tcp.port == 0 {
            let bound = server.address();
            config.members.remove(&config.address);
            config.members.insert(bound.clone());
            config.address = bound;
        }

        let client = match TcpClient::new(tcp) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                let _ = server.stop().await;
                return Err(e.into());
            }
        };
        let storage = open_storage(&config)?;
        Self::start(config, storage, state_machine, server, client).await
    }

    pub fn handle(&self) -> &RaftHandle {
        &self.handle
    }

    pub fn address(&self) -> &str {
        self.handle.address()
    }

    /// Stop serving, stop the engine and release outbound connections
    pub async fn stop(self) -> Result<()> {
        self.server.unbind_handler();
        if let Err(e) = self.server.stop().await {
            warn!(address = %self.handle.address(), error = %e, "protocol server did not stop cleanly");
        }
        self.handle.shutdown().await?;
        self.client.close().await;

        let outcome = match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(address = %self.handle.address(), error = %e, "engine task panicked");
                Err(EngineError::Stopped)
            }
        };
        info!(address = %self.handle.address(), "raft server stopped");
        outcome
    }
}
