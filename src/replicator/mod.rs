// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Catch-up replication client.
//!
//! Keeps one or more remote copies of a stream current with a local stream:
//! - [`batch`]: how many records go into the next push
//! - [`pass`]: one reconciliation pass over every peer
//! - [`Replicator`]: the long-running driver around passes
//!
//! # Driver Loop
//!
//! ```text
//!            ┌──────────── wake / recheck timer ◄───────────┐
//!            ▼                                              │
//!  load known_version ──► run_pass ──► fully synced and ────┘
//!            ▲                         known unchanged?
//!            │                               │ no
//!            └───── backoff (failed pass) ◄──┘
//! ```
//!
//! The driver starts dirty, so the first pass runs immediately. It only goes
//! back to waiting when a pass left every peer at `known_version` and the
//! known version did not move while the pass ran; otherwise a write that
//! landed mid-pass could sit unreplicated until the next timer tick.
//!
//! `known_version` comes from the version marker beside the local stream
//! (written by the local command server), falling back to the local
//! stream's own current version when no marker exists.

pub mod batch;
pub mod pass;
mod types;

pub use batch::{batches_needed, next_batch_size};
pub use pass::{run_pass, sync_peer, PassReport, PeerSyncOutcome};
pub use types::ReplicatorState;

use crate::config::ReplicatorConfig;
use crate::error::{Result, TapeError};
use crate::marker::VersionMarker;
use crate::metrics;
use crate::peer::{PeerManager, PeerTimeouts};
use crate::resilience::RetryConfig;
use crate::tape::{FileTapeStream, TapeStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Replicates one local stream to a set of remote command servers.
pub struct Replicator {
    config: ReplicatorConfig,

    /// Local stream (read only from here)
    local: Arc<dyn TapeStream>,

    /// Source of `known_version`
    marker: VersionMarker,

    peer_manager: Arc<PeerManager>,

    /// Change notification from the host (file watcher, local writer, ...)
    wake: Arc<Notify>,

    state_tx: watch::Sender<ReplicatorState>,
    state_rx: watch::Receiver<ReplicatorState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    driver: Option<JoinHandle<()>>,
}

impl Replicator {
    /// Replicator over the stream file at `config.local_path`.
    pub fn new(config: ReplicatorConfig) -> Result<Self> {
        let local: Arc<dyn TapeStream> = Arc::new(FileTapeStream::new(&config.local_path));
        Self::with_stream(config, local)
    }

    /// Replicator over an already opened local stream.
    ///
    /// `config.local_path` is still used to locate the default marker.
    pub fn with_stream(config: ReplicatorConfig, local: Arc<dyn TapeStream>) -> Result<Self> {
        config.validate()?;

        let peer_manager = Arc::new(PeerManager::new(PeerTimeouts::from_settings(&config.settings)));
        for peer in &config.peers {
            peer_manager.add_peer(peer.clone());
        }

        let marker = config.marker();
        let (state_tx, state_rx) = watch::channel(ReplicatorState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        metrics::set_replicator_state("Created");

        Ok(Self {
            config,
            local,
            marker,
            peer_manager,
            wake: Arc::new(Notify::new()),
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            driver: None,
        })
    }

    /// Get current state.
    pub fn state(&self) -> ReplicatorState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ReplicatorState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Handle the host signals when the local stream may have grown.
    ///
    /// A notification sent while a pass is running is kept and wakes the
    /// driver as soon as it next waits.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Signal that the local stream changed.
    pub fn notify_changed(&self) {
        self.wake.notify_one();
    }

    /// Get the peer manager (for metrics/diagnostics).
    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.peer_manager
    }

    pub fn stream_name(&self) -> &str {
        &self.config.stream_name
    }

    /// Current target version: the marker's value, or the local stream's
    /// version when no marker has been written.
    pub async fn known_version(&self) -> Result<u64> {
        load_known_version(&self.local, &self.marker).await
    }

    /// Runs a single pass now, independent of the driver.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let (report, _) = self.driver_context().pass().await?;
        Ok(report)
    }

    /// Spawns the driver task.
    pub fn start(&mut self) -> Result<()> {
        let state = self.state();
        if state != ReplicatorState::Created {
            return Err(TapeError::Internal(format!(
                "replicator can only start from Created, not {state}"
            )));
        }

        info!(
            stream = %self.config.stream_name,
            local = %self.config.local_path.display(),
            peer_count = self.peer_manager.len(),
            "Starting replicator"
        );

        let driver = self.driver_context();
        self.driver = Some(tokio::spawn(driver.run(self.shutdown_rx.clone())));
        self.set_state(ReplicatorState::Running);
        Ok(())
    }

    /// Stops the driver and drops peer connections.
    ///
    /// A pass in progress is abandoned at its next await point. Anything it
    /// already pushed is kept by the remote, and the next pass resumes from
    /// the remote's reported version.
    pub async fn shutdown(&mut self) {
        if self.state().is_stopped() {
            return;
        }
        info!(stream = %self.config.stream_name, "Shutting down replicator");
        self.set_state(ReplicatorState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        if let Some(mut driver) = self.driver.take() {
            let drain_timeout = self.config.settings.drain_timeout_duration();
            match tokio::time::timeout(drain_timeout, &mut driver).await {
                Ok(Ok(())) => debug!("Driver task completed"),
                Ok(Err(e)) => warn!(error = %e, "Driver task panicked during shutdown"),
                Err(_) => {
                    warn!(?drain_timeout, "Driver task did not stop in time, aborting");
                    driver.abort();
                }
            }
        }

        self.peer_manager.disconnect_all().await;
        self.set_state(ReplicatorState::Stopped);
        info!(stream = %self.config.stream_name, "Replicator stopped");
    }

    fn set_state(&self, state: ReplicatorState) {
        let _ = self.state_tx.send(state);
        metrics::set_replicator_state(&state.to_string());
    }

    fn driver_context(&self) -> Driver {
        let settings = &self.config.settings;
        Driver {
            local: Arc::clone(&self.local),
            marker: self.marker.clone(),
            peer_manager: Arc::clone(&self.peer_manager),
            wake: Arc::clone(&self.wake),
            stream_name: self.config.stream_name.clone(),
            batch_size: settings.batch_size,
            recheck_interval: settings.recheck_interval_duration(),
            retry: settings.retry_config(),
        }
    }
}

/// Everything the driver task owns.
struct Driver {
    local: Arc<dyn TapeStream>,
    marker: VersionMarker,
    peer_manager: Arc<PeerManager>,
    wake: Arc<Notify>,
    stream_name: String,
    batch_size: usize,
    recheck_interval: Duration,
    retry: RetryConfig,
}

impl Driver {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut dirty = true;
        let mut failed_passes: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if !dirty {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                    _ = self.wake.notified() => trace!("Change notification"),
                    _ = tokio::time::sleep(self.recheck_interval) => trace!("Recheck timer fired"),
                }
            }

            let outcome = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                outcome = self.pass() => outcome,
            };

            match outcome {
                Ok((report, advanced)) if report.fully_synced() => {
                    failed_passes = 0;
                    // Re-arm the wait only if nothing landed during the pass.
                    dirty = advanced;
                    if advanced {
                        debug!(known_version = report.known_version, "Known version advanced during pass");
                    }
                    continue;
                }
                Ok(_) => {}
                Err(e) => warn!(stream = %self.stream_name, error = %e, "Replication pass failed"),
            }

            dirty = true;
            failed_passes = failed_passes.saturating_add(1);
            let delay = self.retry.delay_for_attempt(failed_passes);
            debug!(failed_passes, ?delay, "Backing off before next pass");
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!(stream = %self.stream_name, "Replicator driver exiting");
    }

    /// One pass. Also reports whether the known version moved meanwhile.
    async fn pass(&self) -> Result<(PassReport, bool)> {
        let known_version = load_known_version(&self.local, &self.marker).await?;
        metrics::set_known_version(&self.stream_name, known_version);

        let peers = self.peer_manager.all();
        let report = run_pass(&self.local, &peers, &self.stream_name, known_version, self.batch_size).await;
        metrics::set_connected_peers(self.peer_manager.connected_count().await);

        let after = load_known_version(&self.local, &self.marker).await?;
        Ok((report, after != known_version))
    }
}

async fn load_known_version(local: &Arc<dyn TapeStream>, marker: &VersionMarker) -> Result<u64> {
    let local = Arc::clone(local);
    let marker = marker.clone();
    tokio::task::spawn_blocking(move || match marker.load()? {
        Some(version) => Ok(version),
        None => local.current_version(),
    })
    .await
    .map_err(|e| TapeError::Internal(format!("known version task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::CommandServer;
    use crate::tape::{MemoryTapeStorage, MemoryTapeStream, TapeStorage};
    use crate::types::AppendCondition;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    async fn spawn_remote() -> (Arc<MemoryTapeStorage>, crate::server::ServerHandle) {
        let storage = Arc::new(MemoryTapeStorage::new());
        let server = Arc::new(CommandServer::new(storage.clone() as Arc<dyn TapeStorage>));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = server
            .spawn(listener, crate::wire::DEFAULT_MAX_FRAME_BYTES, Duration::from_secs(1))
            .unwrap();
        (storage, handle)
    }

    fn append_events(stream: &MemoryTapeStream, count: usize) {
        for i in 0..count {
            stream
                .try_append(format!("event-{i}").as_bytes(), AppendCondition::None)
                .unwrap();
        }
    }

    async fn wait_for_version(stream: &MemoryTapeStream, version: u64) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while stream.current_version().unwrap() < version {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for version {version}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let config = ReplicatorConfig::for_testing(dir.path().join("orders"), "orders", &[]);
        assert!(matches!(Replicator::new(config), Err(TapeError::Config(_))));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let dir = TempDir::new().unwrap();
        let config = ReplicatorConfig::for_testing(dir.path().join("orders"), "orders", &["127.0.0.1:1"]);
        let mut replicator = Replicator::new(config).unwrap();
        let mut states = replicator.state_receiver();
        assert_eq!(replicator.state(), ReplicatorState::Created);

        replicator.start().unwrap();
        assert!(replicator.is_running());
        assert!(states.has_changed().unwrap());
        assert!(replicator.start().is_err());

        replicator.shutdown().await;
        assert_eq!(replicator.state(), ReplicatorState::Stopped);

        // Idempotent.
        replicator.shutdown().await;
        assert_eq!(*states.borrow_and_update(), ReplicatorState::Stopped);
    }

    #[tokio::test]
    async fn test_known_version_prefers_marker() {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(MemoryTapeStream::new("orders"));
        append_events(&local, 3);
        let config = ReplicatorConfig::for_testing(dir.path().join("orders"), "orders", &["127.0.0.1:1"]);
        let marker = config.marker();
        let replicator = Replicator::with_stream(config, local.clone()).unwrap();

        assert_eq!(replicator.known_version().await.unwrap(), 3);
        marker.store(2).unwrap();
        assert_eq!(replicator.known_version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_run_pass_without_driver() {
        let dir = TempDir::new().unwrap();
        let (remote, handle) = spawn_remote().await;
        let local = Arc::new(MemoryTapeStream::new("orders"));
        append_events(&local, 12);

        let address = handle.local_addr().to_string();
        let config = ReplicatorConfig::for_testing(dir.path().join("orders"), "orders", &[address.as_str()]);
        let replicator = Replicator::with_stream(config, local).unwrap();

        let report = replicator.run_pass().await.unwrap();
        assert!(report.fully_synced());
        assert_eq!(remote.get("orders").current_version().unwrap(), 12);
        assert_eq!(replicator.peer_manager().connected_count().await, 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_driver_replicates_on_notify() {
        let dir = TempDir::new().unwrap();
        let (remote, handle) = spawn_remote().await;
        let local = Arc::new(MemoryTapeStream::new("orders"));
        append_events(&local, 5);

        let address = handle.local_addr().to_string();
        let mut config = ReplicatorConfig::for_testing(dir.path().join("orders"), "orders", &[address.as_str()]);
        // Long timer so only the notification can trigger the second pass.
        config.settings.recheck_interval = "1h".to_string();
        let mut replicator = Replicator::with_stream(config, local.clone()).unwrap();
        replicator.start().unwrap();

        let remote_stream = remote.get("orders");
        wait_for_version(&remote_stream, 5).await;

        append_events(&local, 3);
        replicator.notify_changed();
        wait_for_version(&remote_stream, 8).await;

        replicator.shutdown().await;
        handle.shutdown().await.unwrap();
    }
}
