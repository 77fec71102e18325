//! TCP server side of the networked binding.
//!
//! One accept loop per server, one task per connection, and one task per
//! request bounded by a semaphore of `worker_threads` permits. Replies carry
//! the id of the request they answer and may be written out of order.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::{tls, TcpConfig};
use crate::codec::{Envelope, RemoteError, Reply, ServerCodec};
use crate::handler::{dispatch, ProtocolHandler, ProtocolServer};
use crate::{ProtocolError, Result};

type HandlerSlot = Arc<RwLock<Option<Arc<dyn ProtocolHandler>>>>;

/// Replies queued per connection before request tasks wait on the writer
const REPLY_QUEUE: usize = 256;

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// Networked [`ProtocolServer`]
pub struct TcpServer {
    config: TcpConfig,
    handler: HandlerSlot,
    running: tokio::sync::Mutex<Option<Running>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl TcpServer {
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config,
            handler: Arc::new(RwLock::new(None)),
            running: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    /// The bound socket address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    async fn bind(&self) -> Result<TcpListener> {
        let config = &self.config;
        let addr = tokio::net::lookup_host(config.bind_address())
            .await?
            .next()
            .ok_or_else(|| {
                ProtocolError::InvalidConfig(format!("cannot resolve {}", config.bind_address()))
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        config.apply_to(&socket)?;
        socket.bind(addr)?;
        Ok(socket.listen(config.accept_backlog)?)
    }
}

#[async_trait]
impl ProtocolServer for TcpServer {
    fn address(&self) -> String {
        match self.local_addr() {
            Some(addr) => addr.to_string(),
            None => self.config.bind_address(),
        }
    }

    fn bind_handler(&self, handler: Arc<dyn ProtocolHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn unbind_handler(&self) {
        *self.handler.write() = None;
    }

    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        self.config.validate()?;

        let acceptor = if self.config.ssl_enabled {
            Some(tls::acceptor(&self.config)?)
        } else {
            None
        };

        let listener = self.bind().await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let workers = Arc::new(Semaphore::new(self.config.worker_threads));

        info!(
            address = %local_addr,
            tls = self.config.ssl_enabled,
            workers = self.config.worker_threads,
            "tcp server listening"
        );

        let accept_task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            self.handler.clone(),
            workers,
            self.config.no_delay,
            shutdown_rx,
        ));

        *self.local_addr.lock() = Some(local_addr);
        *running = Some(Running {
            local_addr,
            shutdown,
            accept_task,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        let _ = running.shutdown.send(true);
        if let Err(e) = running.accept_task.await {
            warn!(error = %e, "accept loop ended abnormally");
        }
        *self.local_addr.lock() = None;
        info!(address = %running.local_addr, "tcp server stopped");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    handler: HandlerSlot,
    workers: Arc<Semaphore>,
    no_delay: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            },
        };
        debug!(%peer, "accepted connection");

        let acceptor = acceptor.clone();
        let handler = handler.clone();
        let workers = workers.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = accept_connection(stream, acceptor, handler, workers, no_delay, shutdown).await {
                debug!(%peer, error = %e, "connection closed with error");
            }
        });
    }
}

async fn accept_connection(
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
    handler: HandlerSlot,
    workers: Arc<Semaphore>,
    no_delay: bool,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    stream.set_nodelay(no_delay)?;
    match acceptor {
        Some(acceptor) => {
            let stream = acceptor
                .accept(stream)
                .await
                .map_err(|e| ProtocolError::Tls(format!("handshake failed: {e}")))?;
            serve_connection(stream, handler, workers, shutdown).await
        }
        None => serve_connection(stream, handler, workers, shutdown).await,
    }
}

/// Read requests off one connection until it closes or the server stops
async fn serve_connection<S>(
    stream: S,
    handler: HandlerSlot,
    workers: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut frames) = Framed::new(stream, ServerCodec::new()).split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Envelope<Reply>>(REPLY_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            if let Err(e) = sink.send(reply).await {
                debug!(error = %e, "failed to write reply");
                break;
            }
        }
    });

    let result = loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break Ok(()),
            frame = frames.next() => frame,
        };
        let Envelope { id, body: request } = match frame {
            Some(Ok(envelope)) => envelope,
            Some(Err(e)) => break Err(e),
            None => break Ok(()),
        };

        let permit = match workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break Err(ProtocolError::NotRunning),
        };
        let handler = handler.read().clone();
        let reply_tx = reply_tx.clone();
        tokio::spawn(async move {
            let body = match handler {
                Some(handler) => dispatch(handler.as_ref(), request)
                    .await
                    .map_err(|e| RemoteError::from_error(&e)),
                None => Err(RemoteError::NoHandler),
            };
            let _ = reply_tx.send(Envelope { id, body }).await;
            drop(permit);
        });
    };

    drop(reply_tx);
    if result.is_err() || *shutdown.borrow() {
        writer.abort();
    } else {
        let _ = writer.await;
    }
    result
}
