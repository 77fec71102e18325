//! TCP client side of the networked binding.
//!
//! Keeps one connection per target and multiplexes concurrent calls over
//! it by request id. A connection that fails is dropped and redialed on the
//! next call.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{debug, info};

use raft_core::{Address, Request, Response};

use super::{tls, TcpConfig};
use crate::codec::{ClientCodec, Envelope, Reply};
use crate::handler::ProtocolClient;
use crate::{ProtocolError, Result};

/// Requests queued per connection before callers wait on the writer
const REQUEST_QUEUE: usize = 256;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

struct Connection {
    outgoing: mpsc::Sender<Envelope<Request>>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    fn spawn<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut frames) = Framed::new(stream, ClientCodec::new()).split();
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Envelope<Request>>(REQUEST_QUEUE);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer = {
            let closed = closed.clone();
            tokio::spawn(async move {
                while let Some(request) = outgoing_rx.recv().await {
                    if let Err(e) = sink.send(request).await {
                        debug!(error = %e, "failed to write request");
                        break;
                    }
                }
                closed.store(true, Ordering::SeqCst);
            })
        };

        let reader = {
            let closed = closed.clone();
            let pending = pending.clone();
            tokio::spawn(async move {
                while let Some(frame) = frames.next().await {
                    match frame {
                        Ok(Envelope { id, body }) => {
                            if let Some(waiter) = pending.lock().remove(&id) {
                                let _ = waiter.send(body);
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "failed to read reply");
                            break;
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                // dropping the waiters wakes every caller with ConnectionClosed
                pending.lock().clear();
            })
        };

        Self {
            outgoing,
            pending,
            closed,
            reader,
            writer,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Networked [`ProtocolClient`]
pub struct TcpClient {
    config: TcpConfig,
    connector: Option<TlsConnector>,
    connections: Mutex<HashMap<Address, Arc<Connection>>>,
    next_id: AtomicU64,
}

impl TcpClient {
    /// Build a client; tls is used when `config.ssl_enabled` is set
    pub fn new(config: TcpConfig) -> Result<Self> {
        let connector = if config.ssl_enabled {
            Some(tls::connector(&config)?)
        } else {
            None
        };
        Ok(Self {
            config,
            connector,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    async fn connection(&self, target: &str) -> Result<Arc<Connection>> {
        if let Some(conn) = self.connections.lock().get(target) {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }

        let conn = Arc::new(self.connect(target).await?);
        self.connections
            .lock()
            .insert(target.to_string(), conn.clone());
        Ok(conn)
    }

    async fn connect(&self, target: &str) -> Result<Connection> {
        let addr = tokio::net::lookup_host(target)
            .await
            .map_err(|e| ProtocolError::unreachable(target, e))?
            .next()
            .ok_or_else(|| ProtocolError::unreachable(target, "address did not resolve"))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        self.config.apply_to(&socket)?;

        let stream = match timeout(self.config.connect_timeout(), socket.connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ProtocolError::unreachable(target, e)),
            Err(_) => return Err(ProtocolError::unreachable(target, "connect timed out")),
        };

        let conn = match &self.connector {
            Some(connector) => {
                let name = tls::server_name(target)?;
                let stream = timeout(self.config.connect_timeout(), connector.connect(name, stream))
                    .await
                    .map_err(|_| ProtocolError::unreachable(target, "tls handshake timed out"))?
                    .map_err(|e| ProtocolError::unreachable(target, format!("tls handshake failed: {e}")))?;
                Connection::spawn(stream)
            }
            None => Connection::spawn(stream),
        };
        info!(target, tls = self.connector.is_some(), "connected to peer");
        Ok(conn)
    }

    fn forget(&self, target: &str, conn: &Arc<Connection>) {
        let mut connections = self.connections.lock();
        if connections
            .get(target)
            .is_some_and(|current| Arc::ptr_eq(current, conn))
        {
            connections.remove(target);
        }
    }
}

#[async_trait]
impl ProtocolClient for TcpClient {
    async fn call(&self, target: &str, request: Request) -> Result<Response> {
        let conn = self.connection(target).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        conn.pending.lock().insert(id, tx);
        // the reader may have cleared the waiters between the lookup and the insert
        if conn.is_closed() {
            conn.pending.lock().remove(&id);
            self.forget(target, &conn);
            return Err(ProtocolError::ConnectionClosed);
        }

        if conn
            .outgoing
            .send(Envelope { id, body: request })
            .await
            .is_err()
        {
            conn.pending.lock().remove(&id);
            self.forget(target, &conn);
            return Err(ProtocolError::ConnectionClosed);
        }

        let reply = match timeout(self.config.request_timeout(), rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                self.forget(target, &conn);
                return Err(ProtocolError::ConnectionClosed);
            }
            Err(_) => {
                conn.pending.lock().remove(&id);
                if conn.is_closed() {
                    self.forget(target, &conn);
                }
                return Err(ProtocolError::Timeout {
                    address: target.to_string(),
                });
            }
        };

        reply.map_err(|e| e.into_error(target))
    }

    async fn close(&self) {
        let closed: Vec<_> = self.connections.lock().drain().collect();
        for (target, _conn) in closed {
            debug!(target = %target, "closing connection");
        }
    }
}
