//! One reconciliation pass over every peer.
//!
//! For each peer, in address order:
//! 1. Ask the remote for its version. Unreachable peers are recorded as
//!    [`PeerSyncOutcome::Unavailable`] and skipped for this pass.
//! 2. If the remote is at or past `known_version`, nothing to do.
//! 3. Otherwise read the next batch of local records after the remote's
//!    version and push it as one `Append`. Each record asks to be applied
//!    only if the remote is exactly one behind it, so a resent batch is
//!    harmless. Advance to the version the remote reports and repeat.
//!
//! A peer that stops making progress (reply of 0, or a version no further
//! than before) ends as [`PeerSyncOutcome::Incomplete`]. The pass never
//! retries internally; the driver decides when to run again.

use crate::error::{Result, TapeError};
use crate::metrics;
use crate::peer::PeerConnection;
use crate::replicator::batch::{batches_needed, next_batch_size};
use crate::tape::TapeStream;
use crate::types::TapeRecord;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

/// How one peer ended a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerSyncOutcome {
    /// Remote was already at or past the known version.
    UpToDate { remote_version: u64 },
    /// Remote was brought from `from` to `to` (`to >= known_version`).
    CaughtUp { from: u64, to: u64, batches: u64 },
    /// Remote moved (or not) but stopped short of the known version.
    Incomplete { remote_version: u64, reason: String },
    /// Remote could not be reached for the version query.
    Unavailable { reason: String },
    /// Local read failure or malformed remote reply.
    Failed { error: String },
}

impl PeerSyncOutcome {
    /// True when the peer reached the known version.
    pub fn is_synced(&self) -> bool {
        matches!(self, Self::UpToDate { .. } | Self::CaughtUp { .. })
    }

    /// Metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::UpToDate { .. } => "up_to_date",
            Self::CaughtUp { .. } => "caught_up",
            Self::Incomplete { .. } => "incomplete",
            Self::Unavailable { .. } => "unavailable",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Result of a pass over all peers.
#[derive(Debug, Clone)]
pub struct PassReport {
    /// Target version of the pass.
    pub known_version: u64,
    /// Outcome per peer address, in the order peers were visited.
    pub outcomes: Vec<(String, PeerSyncOutcome)>,
    pub duration: Duration,
}

impl PassReport {
    /// Every peer reached `known_version`.
    pub fn fully_synced(&self) -> bool {
        self.outcomes.iter().all(|(_, outcome)| outcome.is_synced())
    }

    pub fn outcome(&self, address: &str) -> Option<&PeerSyncOutcome> {
        self.outcomes
            .iter()
            .find(|(peer, _)| peer == address)
            .map(|(_, outcome)| outcome)
    }

    fn synced_count(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_synced()).count()
    }
}

/// Run one pass: bring every peer up to `known_version`.
///
/// Peers are visited one after another; a failure on one peer never stops
/// the others.
pub async fn run_pass(
    local: &Arc<dyn TapeStream>,
    peers: &[Arc<PeerConnection>],
    stream_name: &str,
    known_version: u64,
    batch_size: usize,
) -> PassReport {
    let started = Instant::now();
    let mut outcomes = Vec::with_capacity(peers.len());

    for peer in peers {
        let outcome = sync_peer(local, peer, stream_name, known_version, batch_size).await;
        metrics::record_peer_outcome(peer.address(), outcome.label());
        outcomes.push((peer.address().to_string(), outcome));
    }

    let report = PassReport {
        known_version,
        outcomes,
        duration: started.elapsed(),
    };
    metrics::record_pass(report.fully_synced(), report.duration);

    if report.fully_synced() {
        debug!(known_version, peers = report.outcomes.len(), "Pass complete, all peers synced");
    } else {
        info!(
            known_version,
            synced = report.synced_count(),
            peers = report.outcomes.len(),
            "Pass complete, some peers behind"
        );
    }
    report
}

/// Bring one peer up to `known_version`.
pub async fn sync_peer(
    local: &Arc<dyn TapeStream>,
    peer: &PeerConnection,
    stream_name: &str,
    known_version: u64,
    batch_size: usize,
) -> PeerSyncOutcome {
    let span = info_span!("sync_peer", peer = %peer.address(), stream = %stream_name, known_version);
    catch_up(local, peer, stream_name, known_version, batch_size)
        .instrument(span)
        .await
}

async fn catch_up(
    local: &Arc<dyn TapeStream>,
    peer: &PeerConnection,
    stream_name: &str,
    known_version: u64,
    batch_size: usize,
) -> PeerSyncOutcome {
    let address = peer.address();

    let mut remote_version = match peer.version(stream_name).await {
        Ok(version) => version,
        Err(e @ TapeError::PeerUnavailable { .. }) => {
            debug!(error = %e, "Peer unavailable, skipping for this pass");
            return PeerSyncOutcome::Unavailable { reason: e.to_string() };
        }
        Err(e) => {
            warn!(error = %e, "Version query failed");
            return PeerSyncOutcome::Failed { error: e.to_string() };
        }
    };
    metrics::set_replication_lag(address, known_version.saturating_sub(remote_version));

    if remote_version >= known_version {
        debug!(remote_version, "Peer up to date");
        return PeerSyncOutcome::UpToDate { remote_version };
    }

    let from = remote_version;
    info!(
        remote_version,
        behind = known_version - remote_version,
        planned_batches = batches_needed(remote_version, known_version, batch_size),
        "Catching up peer"
    );

    let mut batches = 0u64;
    while remote_version < known_version {
        let count = next_batch_size(remote_version, known_version, batch_size);

        let records = match read_local(Arc::clone(local), remote_version, count).await {
            Ok(records) => records,
            Err(e) => {
                warn!(after = remote_version, error = %e, "Local read failed");
                return PeerSyncOutcome::Failed { error: e.to_string() };
            }
        };
        if records.is_empty() {
            // Known version is ahead of what the local stream holds.
            warn!(after = remote_version, "No local records to push");
            return PeerSyncOutcome::Incomplete {
                remote_version,
                reason: format!("local stream has no records after version {remote_version}"),
            };
        }

        let pushed = records.len();
        let started = Instant::now();
        let reply = match peer.append(stream_name, &records).await {
            Ok(version) => version,
            Err(e @ TapeError::PeerUnavailable { .. }) => {
                warn!(remote_version, error = %e, "Peer went offline mid-push");
                return PeerSyncOutcome::Incomplete {
                    remote_version,
                    reason: e.to_string(),
                };
            }
            Err(e) => {
                warn!(remote_version, error = %e, "Append push failed");
                return PeerSyncOutcome::Failed { error: e.to_string() };
            }
        };
        metrics::record_replication_batch(address, pushed, started.elapsed());

        if reply == 0 || reply <= remote_version {
            warn!(remote_version, reply, batch_size = pushed, "Peer accepted nothing from batch");
            return PeerSyncOutcome::Incomplete {
                remote_version,
                reason: format!("peer made no progress (reply {reply})"),
            };
        }

        let accepted = reply - remote_version;
        if accepted < pushed as u64 {
            debug!(remote_version, reply, batch_size = pushed, "Peer accepted a prefix of the batch");
        }
        remote_version = reply;
        batches += 1;
        metrics::set_replication_lag(address, known_version.saturating_sub(remote_version));
    }

    info!(from, to = remote_version, batches, "Peer caught up");
    PeerSyncOutcome::CaughtUp {
        from,
        to: remote_version,
        batches,
    }
}

/// Reads up to `count` local records after `after` off the async runtime.
async fn read_local(local: Arc<dyn TapeStream>, after: u64, count: usize) -> Result<Vec<TapeRecord>> {
    tokio::task::spawn_blocking(move || local.read_records(after, count)?.collect::<Result<Vec<_>>>())
        .await
        .map_err(|e| TapeError::Internal(format!("local read task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::peer::PeerTimeouts;
    use crate::server::CommandServer;
    use crate::tape::{MemoryTapeStorage, MemoryTapeStream, TapeStorage};
    use crate::types::AppendCondition;
    use tokio::net::TcpListener;

    fn fast_timeouts() -> PeerTimeouts {
        PeerTimeouts {
            connect: Duration::from_millis(300),
            version: Duration::from_millis(500),
            append: Duration::from_secs(1),
            max_frame_bytes: crate::wire::DEFAULT_MAX_FRAME_BYTES,
        }
    }

    fn local_with(count: u64) -> Arc<dyn TapeStream> {
        let stream = MemoryTapeStream::new("orders");
        for i in 1..=count {
            stream
                .try_append(format!("event-{i}").as_bytes(), AppendCondition::None)
                .unwrap();
        }
        Arc::new(stream)
    }

    async fn spawn_remote() -> (Arc<MemoryTapeStorage>, crate::server::ServerHandle) {
        let storage = Arc::new(MemoryTapeStorage::new());
        let server = Arc::new(CommandServer::new(storage.clone() as Arc<dyn TapeStorage>));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = server
            .spawn(listener, crate::wire::DEFAULT_MAX_FRAME_BYTES, Duration::from_secs(1))
            .unwrap();
        (storage, handle)
    }

    #[tokio::test]
    async fn test_sync_peer_catches_up_in_batches() {
        let local = local_with(25);
        let (remote, handle) = spawn_remote().await;
        let peer = PeerConnection::new(PeerConfig::for_testing(&handle.local_addr().to_string()), fast_timeouts());

        let outcome = sync_peer(&local, &peer, "orders", 25, 10).await;
        assert_eq!(outcome, PeerSyncOutcome::CaughtUp { from: 0, to: 25, batches: 3 });
        assert_eq!(remote.get("orders").current_version().unwrap(), 25);

        let outcome = sync_peer(&local, &peer, "orders", 25, 10).await;
        assert_eq!(outcome, PeerSyncOutcome::UpToDate { remote_version: 25 });

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_peer_resumes_from_remote_version() {
        let local = local_with(8);
        let (remote, handle) = spawn_remote().await;
        let copy = local.read_records(0, 5).unwrap().collect::<Result<Vec<_>>>().unwrap();
        remote.get("orders").append_non_atomic(&copy).unwrap();

        let peer = PeerConnection::new(PeerConfig::for_testing(&handle.local_addr().to_string()), fast_timeouts());
        let outcome = sync_peer(&local, &peer, "orders", 8, 1000).await;
        assert_eq!(outcome, PeerSyncOutcome::CaughtUp { from: 5, to: 8, batches: 1 });

        let records: Vec<_> = remote
            .get("orders")
            .read_records(0, 100)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let expected: Vec<_> = local.read_records(0, 100).unwrap().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(records, expected);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_peer_unreachable() {
        let local = local_with(3);
        // Bind then drop to get a port nothing listens on.
        let address = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let peer = PeerConnection::new(PeerConfig::for_testing(&address), fast_timeouts());

        let outcome = sync_peer(&local, &peer, "orders", 3, 1000).await;
        assert!(matches!(outcome, PeerSyncOutcome::Unavailable { .. }));
        assert!(!outcome.is_synced());
    }

    #[tokio::test]
    async fn test_sync_peer_known_version_beyond_local() {
        let local = local_with(2);
        let (_remote, handle) = spawn_remote().await;
        let peer = PeerConnection::new(PeerConfig::for_testing(&handle.local_addr().to_string()), fast_timeouts());

        let outcome = sync_peer(&local, &peer, "orders", 5, 1000).await;
        assert!(
            matches!(outcome, PeerSyncOutcome::Incomplete { remote_version: 2, .. }),
            "got {outcome:?}"
        );

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_peer_compares_versions_not_contents() {
        let local = local_with(4);
        let (remote, handle) = spawn_remote().await;
        // Remote holds two records that differ from the local ones.
        let diverged = remote.get("orders");
        diverged.try_append(b"other-1", AppendCondition::None).unwrap();
        diverged.try_append(b"other-2", AppendCondition::None).unwrap();
        let peer = PeerConnection::new(PeerConfig::for_testing(&handle.local_addr().to_string()), fast_timeouts());

        // Records 3 and 4 apply on top of the remote's 2.
        let outcome = sync_peer(&local, &peer, "orders", 4, 1000).await;
        assert_eq!(outcome, PeerSyncOutcome::CaughtUp { from: 2, to: 4, batches: 1 });

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_pass_reports_per_peer() {
        let local = local_with(6);
        let (_remote, handle) = spawn_remote().await;
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let live = handle.local_addr().to_string();
        let peers = vec![
            Arc::new(PeerConnection::new(PeerConfig::for_testing(&live), fast_timeouts())),
            Arc::new(PeerConnection::new(PeerConfig::for_testing(&dead), fast_timeouts())),
        ];

        let report = run_pass(&local, &peers, "orders", 6, 1000).await;
        assert!(!report.fully_synced());
        assert_eq!(report.known_version, 6);
        assert!(report.outcome(&live).unwrap().is_synced());
        assert!(matches!(report.outcome(&dead), Some(PeerSyncOutcome::Unavailable { .. })));

        handle.shutdown().await.unwrap();
    }

    #[test]
    fn test_empty_pass_is_fully_synced() {
        let report = PassReport {
            known_version: 10,
            outcomes: Vec::new(),
            duration: Duration::ZERO,
        };
        assert!(report.fully_synced());
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(PeerSyncOutcome::UpToDate { remote_version: 1 }.label(), "up_to_date");
        assert_eq!(
            PeerSyncOutcome::Failed { error: "x".into() }.label(),
            "failed"
        );
        assert!(!PeerSyncOutcome::Incomplete { remote_version: 0, reason: String::new() }.is_synced());
    }
}
