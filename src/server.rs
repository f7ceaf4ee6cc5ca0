// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Command server: maps `Version` and `Append` requests onto tape streams.
//!
//! # Architecture
//!
//! ```text
//!  conn task ─┐
//!  conn task ─┼─ (message, oneshot) ─► dispatcher ─► spawn_blocking(dispatch)
//!  conn task ─┘                              │
//!                                            └─► TapeStorage::stream(name)
//! ```
//!
//! Connections only read and write frames. Every request from every
//! connection goes through the single dispatcher, which handles one request
//! to completion before taking the next, so requests are served in arrival
//! order with no concurrency inside the server.
//!
//! # Shutdown
//!
//! The accept loop, every connection and the dispatcher watch a shared
//! `watch::Receiver<bool>`. [`ServerHandle::shutdown`] flips it and waits up
//! to the drain timeout for the server task to exit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, TapeError};
use crate::metrics;
use crate::tape::{FileTapeStorage, TapeStorage};
use crate::types::AppendCondition;
use crate::wire::{self, AppendEntry, Request};

/// Pending requests between connection tasks and the dispatcher.
const DISPATCH_QUEUE: usize = 64;

struct Job {
    message: wire::Message,
    reply: oneshot::Sender<Vec<u8>>,
}

/// Request handler bound to a storage.
pub struct CommandServer {
    storage: Arc<dyn TapeStorage>,
}

impl CommandServer {
    pub fn new(storage: Arc<dyn TapeStorage>) -> Self {
        Self { storage }
    }

    /// Current version of `stream`.
    pub fn version(&self, stream: &str) -> Result<u64> {
        self.storage.stream(stream)?.current_version()
    }

    /// Applies each entry with `VersionIs(expected_version)`.
    ///
    /// Returns the version of the last accepted entry, or 0 when none was
    /// accepted. Entries before a failing one stay applied, and their
    /// version is published before the error is returned.
    pub fn append(&self, stream: &str, entries: &[AppendEntry]) -> Result<u64> {
        let tape = self.storage.stream(stream)?;
        let mut last_accepted = 0;
        let mut failure = None;
        for entry in entries {
            let condition = AppendCondition::version_is(entry.expected_version);
            match tape.try_append(&entry.payload, condition) {
                Ok(0) => {}
                Ok(version) => last_accepted = version,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if last_accepted != 0 {
            let published = tape.publish_version(last_accepted);
            match (&failure, published) {
                (_, Ok(())) => {}
                (None, Err(e)) => return Err(e),
                (Some(_), Err(e)) => {
                    warn!(stream = %stream, last_accepted, error = %e, "Version marker not published");
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        debug!(
            stream = %stream,
            entries = entries.len(),
            last_accepted,
            "Handled append"
        );
        Ok(last_accepted)
    }

    /// Handles one request message and produces the reply frame.
    ///
    /// Never fails: errors become `ERROR: ...` replies.
    pub fn dispatch(&self, message: &[Vec<u8>]) -> Vec<u8> {
        let started = Instant::now();
        let request = match wire::parse_request(message) {
            Ok(request) => request,
            Err(e) => {
                let detail = match e {
                    TapeError::Protocol(detail) => detail,
                    other => other.to_string(),
                };
                warn!(error = %detail, "Malformed request");
                metrics::record_server_request("malformed", "protocol_error", started.elapsed());
                return wire::error_reply(&format!("protocol: {detail}"));
            }
        };

        let command = request.command();
        let result = match request {
            Request::Version { stream } => self.version(&stream),
            Request::Append { stream, entries } => self.append(&stream, &entries),
            Request::Unknown { command } => {
                debug!(command = %command, "Unknown command");
                metrics::record_server_request("unknown", "unknown", started.elapsed());
                return wire::REPLY_UNKNOWN.to_vec();
            }
        };

        match result {
            Ok(version) => {
                metrics::record_server_request(command, "ok", started.elapsed());
                wire::encode_version(version)
            }
            Err(e) => {
                warn!(command, error = %e, "Request failed");
                metrics::record_server_request(command, e.kind(), started.elapsed());
                wire::error_reply(&e.to_string())
            }
        }
    }

    /// Opens file storage per `config` and starts serving on `config.bind_addr`.
    pub async fn bind(config: &ServerConfig) -> Result<ServerHandle> {
        config.validate()?;
        let storage = FileTapeStorage::open(&config.root)?
            .with_fsync(config.fsync)
            .with_version_markers(config.version_markers);
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let server = Arc::new(Self::new(Arc::new(storage)));
        server.spawn(listener, config.max_frame_bytes, config.drain_timeout_duration())
    }

    /// Starts serving on an already bound listener.
    pub fn spawn(
        self: Arc<Self>,
        listener: TcpListener,
        max_frame_bytes: usize,
        drain_timeout: Duration,
    ) -> Result<ServerHandle> {
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(listener, max_frame_bytes, shutdown_rx));
        info!(addr = %local_addr, "Command server listening");
        Ok(ServerHandle {
            local_addr,
            shutdown_tx,
            join,
            drain_timeout,
        })
    }

    /// Serves until `shutdown` becomes `true`.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        max_frame_bytes: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let (job_tx, job_rx) = mpsc::channel::<Job>(DISPATCH_QUEUE);
        let dispatcher = tokio::spawn(Arc::clone(&self).run_dispatcher(job_rx, shutdown.clone()));
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            debug!(peer = %peer, "Accepted connection");
                            let _ = socket.set_nodelay(true);
                            connections.spawn(handle_connection(
                                socket,
                                peer,
                                job_tx.clone(),
                                max_frame_bytes,
                                shutdown.clone(),
                            ));
                            metrics::set_server_connections(connections.len());
                        }
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                        }
                    }
                }

                Some(_) = connections.join_next(), if !connections.is_empty() => {
                    metrics::set_server_connections(connections.len());
                }
            }
        }

        info!("Command server stopping");
        drop(job_tx);
        connections.shutdown().await;
        metrics::set_server_connections(0);
        if let Err(e) = dispatcher.await {
            error!(error = %e, "Dispatcher task failed");
        }
        info!("Command server stopped");
        Ok(())
    }

    async fn run_dispatcher(
        self: Arc<Self>,
        mut jobs: mpsc::Receiver<Job>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let job = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            let server = Arc::clone(&self);
            let message = job.message;
            let reply = match tokio::task::spawn_blocking(move || server.dispatch(&message)).await {
                Ok(reply) => reply,
                Err(e) => {
                    error!(error = %e, "Request handler panicked");
                    wire::error_reply("internal: request handler failed")
                }
            };
            // Connection may have gone away; nothing to report to.
            let _ = job.reply.send(reply);
        }
        debug!("Dispatcher stopped");
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    jobs: mpsc::Sender<Job>,
    max_frame_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            message = wire::read_message(&mut reader, max_frame_bytes) => message,
        };

        let message = match message {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(peer = %peer, "Connection closed");
                break;
            }
            Err(TapeError::Protocol(detail)) => {
                // Framing is lost; answer once and drop the connection.
                warn!(peer = %peer, error = %detail, "Bad frame");
                let reply = wire::error_reply(&format!("protocol: {detail}"));
                let _ = wire::write_message(&mut writer, &[reply], max_frame_bytes).await;
                break;
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Connection read failed");
                break;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if jobs.send(Job { message, reply: reply_tx }).await.is_err() {
            break;
        }
        let Ok(reply) = reply_rx.await else {
            break;
        };
        if let Err(e) = wire::write_message(&mut writer, &[reply], max_frame_bytes).await {
            debug!(peer = %peer, error = %e, "Connection write failed");
            break;
        }
    }
}

/// Handle to a running command server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<Result<()>>,
    drain_timeout: Duration,
}

impl ServerHandle {
    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signals shutdown and waits for the server task.
    ///
    /// Returns [`TapeError::Shutdown`] if the task did not finish within the
    /// drain timeout; it is aborted in that case.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        let mut join = self.join;
        match tokio::time::timeout(self.drain_timeout, &mut join).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(TapeError::Internal(format!("server task failed: {e}"))),
            Err(_) => {
                warn!(addr = %self.local_addr, "Server did not stop within drain timeout");
                join.abort();
                Err(TapeError::Shutdown)
            }
        }
    }
}
