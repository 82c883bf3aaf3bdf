//! StoreServer: serves a [`StoreEngine`] to GCS clients over TCP.
//!
//! One task reads newline-framed requests per connection and executes them
//! in arrival order; a companion task drains the connection's outbox.
//! Writes and their publications are serialized by a single ordering lock,
//! so subscribers observe messages in commit order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, ConnId, Outbox};
use crate::engine::StoreEngine;
use crate::error::{StoreError, StoreResult};
use crate::protocol::*;

pub struct StoreServer {
    engine: StoreEngine,
    broker: Broker,
    write_order: Mutex<()>,
    next_conn: AtomicU64,
}

impl StoreServer {
    pub fn new(engine: StoreEngine) -> Self {
        Self {
            engine,
            broker: Broker::new(),
            write_order: Mutex::new(()),
            next_conn: AtomicU64::new(1),
        }
    }

    /// Accept connections until `shutdown` flips to `true`.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> StoreResult<()> {
        let addr = listener
            .local_addr()
            .map_err(|e| StoreError::Server(e.to_string()))?;
        info!(%addr, "store server listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.map_err(|e| StoreError::Server(e.to_string()))?;
                    let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
                    debug!(%peer, conn, "connection accepted");
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_connection(stream, conn).await;
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(%addr, "store server shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, conn: ConnId) {
        let _ = stream.set_nodelay(true);
        let (reader, mut writer) = stream.into_split();
        let (outbox, mut frames) = mpsc::unbounded_channel::<ServerFrame>();

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let line = match encode_line(&frame) {
                    Ok(line) => line,
                    Err(e) => {
                        error!(conn, error = %e, "failed to encode frame");
                        break;
                    }
                };
                if writer.write_all(&line).await.is_err() {
                    break;
                }
            }
        });

        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match decode_line::<Request>(line.as_bytes()) {
                    Ok(request) => self.execute(conn, &outbox, request),
                    Err(e) => {
                        warn!(conn, error = %e, "malformed request, closing connection");
                        break;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(conn, error = %e, "connection read failed");
                    break;
                }
            }
        }

        // The broker holds outbox clones; release them so the writer drains.
        self.broker.remove_connection(conn);
        drop(outbox);
        let _ = writer_task.await;
        debug!(conn, "connection closed");
    }

    /// Execute one request and queue its reply on `outbox`.
    pub fn execute(&self, conn: ConnId, outbox: &Outbox, request: Request) {
        let Request { id, command } = request;
        debug!(conn, id, op = command.name(), "request");

        let outcome = match command {
            Command::Subscribe { channel } => {
                // The broker queues the acknowledgement itself.
                self.broker.subscribe(&channel, conn, outbox, id);
                return;
            }
            Command::Unsubscribe { channel } => {
                self.broker.unsubscribe(&channel, conn);
                Outcome::Unsubscribed { channel }
            }
            Command::Set {
                key,
                value,
                publish,
            } => {
                let _order = self.write_order.lock().unwrap_or_else(PoisonError::into_inner);
                match self.engine.set(&key, &value) {
                    Ok(()) => {
                        if let Some(publish) = publish {
                            self.broker.publish(&publish.channel, &publish.tag, &value);
                        }
                        Outcome::Ok
                    }
                    Err(e) => error_outcome(e),
                }
            }
            Command::Get { key } => match self.engine.get(&key) {
                Ok(value) => Outcome::Value { value },
                Err(e) => error_outcome(e),
            },
            Command::Scan { prefix } => match self.engine.scan_prefix(&prefix) {
                Ok(entries) => Outcome::Entries {
                    entries: entries
                        .into_iter()
                        .map(|(key, value)| Entry { key, value })
                        .collect(),
                },
                Err(e) => error_outcome(e),
            },
            Command::UpdateIf {
                key,
                conditions,
                assign,
                publish,
            } => {
                let _order = self.write_order.lock().unwrap_or_else(PoisonError::into_inner);
                match self.engine.update_if(&key, &conditions, &assign) {
                    Ok(updated) => {
                        if let (true, Some(publish), Some(value)) =
                            (updated.applied, publish, updated.value.as_ref())
                        {
                            self.broker.publish(&publish.channel, &publish.tag, value);
                        }
                        Outcome::Updated {
                            value: updated.value,
                            applied: updated.applied,
                        }
                    }
                    Err(e) => error_outcome(e),
                }
            }
            Command::Ping => Outcome::Pong,
        };

        let _ = outbox.send(ServerFrame::Reply { id, outcome });
    }
}

fn error_outcome(e: StoreError) -> Outcome {
    warn!(error = %e, "request failed");
    Outcome::Error {
        message: e.to_string(),
    }
}

/// A store server running on its own thread and runtime.
///
/// Dropping the handle stops the server and closes every connection.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind `addr` and serve `engine` from a dedicated background thread.
///
/// Binding happens before this returns, so the handle's address is ready
/// to accept connections (use port 0 for an ephemeral port).
pub fn spawn_background(engine: StoreEngine, addr: &str) -> StoreResult<ServerHandle> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (bound_tx, bound_rx) = std::sync::mpsc::channel::<Result<SocketAddr, String>>();
    let addr = addr.to_string();

    let thread = std::thread::Builder::new()
        .name("gcs-store".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = bound_tx.send(Err(e.to_string()));
                    return;
                }
            };
            runtime.block_on(async move {
                let listener = match TcpListener::bind(&addr).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        let _ = bound_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let local = match listener.local_addr() {
                    Ok(local) => local,
                    Err(e) => {
                        let _ = bound_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = bound_tx.send(Ok(local));
                let server = Arc::new(StoreServer::new(engine));
                if let Err(e) = server.serve(listener, shutdown_rx).await {
                    error!(error = %e, "store server stopped");
                }
            });
        })
        .map_err(|e| StoreError::Server(e.to_string()))?;

    let addr = bound_rx
        .recv()
        .map_err(|e| StoreError::Server(e.to_string()))?
        .map_err(StoreError::Server)?;

    Ok(ServerHandle {
        addr,
        shutdown: shutdown_tx,
        thread: Some(thread),
    })
}
