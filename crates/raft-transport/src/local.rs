//! # local
//!
//! why: run whole clusters inside one process, for tests and embedding
//! relations: implements ProtocolServer/ProtocolClient from handler.rs
//! what: LocalRegistry (address -> handler), LocalServer, LocalClient, and
//! isolate/heal fault injection for partition tests

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use raft_core::{Address, Request, Response};

use crate::handler::{dispatch, ProtocolClient, ProtocolHandler, ProtocolServer};
use crate::{ProtocolError, Result};

type HandlerSlot = RwLock<Option<Arc<dyn ProtocolHandler>>>;

#[derive(Default)]
struct RegistryInner {
    servers: HashMap<Address, Arc<HandlerSlot>>,
    isolated: HashSet<Address>,
}

/// Shared in-process address book. Clone it freely; clones see the same servers.
#[derive(Clone, Default)]
pub struct LocalRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A server that will listen at `address` once started
    pub fn server(&self, address: impl Into<Address>) -> LocalServer {
        LocalServer {
            address: address.into(),
            registry: self.clone(),
            slot: Arc::new(RwLock::new(None)),
            running: AtomicBool::new(false),
        }
    }

    /// A client whose calls originate from `source`; isolating `source` cuts it off too
    pub fn client(&self, source: impl Into<Address>) -> LocalClient {
        LocalClient {
            source: source.into(),
            registry: self.clone(),
        }
    }

    /// Drop all traffic to and from `address` until healed
    pub fn isolate(&self, address: &str) {
        debug!(address, "isolating");
        self.inner.write().isolated.insert(address.to_string());
    }

    pub fn heal(&self, address: &str) {
        debug!(address, "healing");
        self.inner.write().isolated.remove(address);
    }

    pub fn heal_all(&self) {
        self.inner.write().isolated.clear();
    }

    pub fn is_isolated(&self, address: &str) -> bool {
        self.inner.read().isolated.contains(address)
    }

    /// Addresses with a running server
    pub fn addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self.inner.read().servers.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    fn register(&self, address: &str, slot: Arc<HandlerSlot>) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.servers.get(address) {
            Some(existing) if !Arc::ptr_eq(existing, &slot) => Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{address} is already bound"),
            ))),
            _ => {
                inner.servers.insert(address.to_string(), slot);
                Ok(())
            }
        }
    }

    fn unregister(&self, address: &str, slot: &Arc<HandlerSlot>) {
        let mut inner = self.inner.write();
        if inner
            .servers
            .get(address)
            .is_some_and(|existing| Arc::ptr_eq(existing, slot))
        {
            inner.servers.remove(address);
        }
    }

    fn route(&self, source: &str, target: &str) -> Result<Arc<dyn ProtocolHandler>> {
        let inner = self.inner.read();
        if inner.isolated.contains(source) || inner.isolated.contains(target) {
            return Err(ProtocolError::unreachable(target, "partitioned"));
        }
        let slot = inner
            .servers
            .get(target)
            .ok_or_else(|| ProtocolError::unreachable(target, "no server listening"))?;
        let handler = slot.read().clone();
        handler.ok_or_else(|| ProtocolError::NoHandler {
            address: target.to_string(),
        })
    }
}

/// Server side of the local binding
pub struct LocalServer {
    address: Address,
    registry: LocalRegistry,
    slot: Arc<HandlerSlot>,
    running: AtomicBool,
}

#[async_trait]
impl ProtocolServer for LocalServer {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn bind_handler(&self, handler: Arc<dyn ProtocolHandler>) {
        *self.slot.write() = Some(handler);
    }

    fn unbind_handler(&self) {
        *self.slot.write() = None;
    }

    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.registry.register(&self.address, self.slot.clone()) {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        debug!(address = %self.address, "local server started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.running.swap(false, Ordering::SeqCst) {
            self.registry.unregister(&self.address, &self.slot);
            debug!(address = %self.address, "local server stopped");
        }
        Ok(())
    }
}

/// Client side of the local binding; calls run the target handler directly
#[derive(Clone)]
pub struct LocalClient {
    source: Address,
    registry: LocalRegistry,
}

#[async_trait]
impl ProtocolClient for LocalClient {
    async fn call(&self, target: &str, request: Request) -> Result<Response> {
        let handler = self.registry.route(&self.source, target)?;
        let response = dispatch(handler.as_ref(), request).await?;
        // a partition raised while the call was in flight loses the reply
        if self.registry.is_isolated(&self.source) || self.registry.is_isolated(target) {
            return Err(ProtocolError::unreachable(target, "partitioned"));
        }
        Ok(response)
    }
}
