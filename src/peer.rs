//! Peer connection management.
//!
//! A [`PeerConnection`] talks to one remote command server over a single TCP
//! connection, one request at a time.
//!
//! # Connection Lifecycle
//!
//! ```text
//! Disconnected ──request──► Connected
//!      ▲                        │
//!      └── timeout / I/O error ─┘
//! ```
//!
//! Connections are **lazy**: they're only established when a request needs
//! one. Any transport failure or reply timeout drops the connection, so a
//! late reply can never be mistaken for the answer to the next request.
//! Callers see [`TapeError::PeerUnavailable`] and decide whether to retry.
//!
//! # Circuit Breaker
//!
//! Each peer has a circuit breaker to prevent cascade failures:
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Too many consecutive failures, requests rejected immediately
//!
//! The circuit opens after `circuit_failure_threshold` consecutive failures
//! and resets after `circuit_reset_timeout_sec` seconds.

use crate::config::{PeerConfig, ReplicationSettings};
use crate::error::{Result, TapeError};
use crate::metrics;
use crate::types::TapeRecord;
use crate::wire::{self, Message};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// State of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No open connection (initial state, and after any failure).
    Disconnected,
    /// Connected and usable for the next request.
    Connected,
}

/// Circuit breaker state for peer connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCircuitState {
    /// Normal operation, requests pass through.
    Closed,
    /// Too many failures, requests rejected immediately.
    Open,
}

enum PeerLink {
    Disconnected,
    Connected(TcpStream),
}

/// Timeouts and limits for talking to peers.
#[derive(Debug, Clone)]
pub struct PeerTimeouts {
    pub connect: Duration,
    /// Reply timeout for `Version`.
    pub version: Duration,
    /// Reply timeout for `Append`.
    pub append: Duration,
    pub max_frame_bytes: usize,
}

impl Default for PeerTimeouts {
    fn default() -> Self {
        Self::from_settings(&ReplicationSettings::default())
    }
}

impl PeerTimeouts {
    pub fn from_settings(settings: &ReplicationSettings) -> Self {
        Self {
            connect: settings.connect_timeout_duration(),
            version: settings.version_timeout_duration(),
            append: settings.append_timeout_duration(),
            max_frame_bytes: settings.max_frame_bytes,
        }
    }
}

/// A lazily connected client for one remote command server.
pub struct PeerConnection {
    /// Peer configuration
    pub config: PeerConfig,
    timeouts: PeerTimeouts,
    /// Held for the whole request/reply exchange.
    link: Mutex<PeerLink>,
    /// Consecutive failure count
    failure_count: AtomicU64,
    /// When the circuit opened (for reset timeout)
    circuit_opened_at: RwLock<Option<Instant>>,
}

impl PeerConnection {
    /// Create a new peer connection (not yet connected).
    pub fn new(config: PeerConfig, timeouts: PeerTimeouts) -> Self {
        Self {
            config,
            timeouts,
            link: Mutex::new(PeerLink::Disconnected),
            failure_count: AtomicU64::new(0),
            circuit_opened_at: RwLock::new(None),
        }
    }

    /// Remote `host:port`.
    pub fn address(&self) -> &str {
        &self.config.address
    }

    /// Get current connection state.
    ///
    /// Reports `Connected` while a request is in flight.
    pub async fn state(&self) -> PeerState {
        match *self.link.lock().await {
            PeerLink::Disconnected => PeerState::Disconnected,
            PeerLink::Connected(_) => PeerState::Connected,
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == PeerState::Connected
    }

    // =========================================================================
    // Circuit Breaker
    // =========================================================================

    /// Get the current circuit breaker state.
    pub async fn circuit_state(&self) -> PeerCircuitState {
        let failures = self.failure_count.load(Ordering::Relaxed);
        let threshold = self.config.circuit_failure_threshold as u64;

        if failures >= threshold {
            // Half-open once the reset timeout has passed
            if let Some(opened_at) = *self.circuit_opened_at.read().await {
                let reset_timeout = Duration::from_secs(self.config.circuit_reset_timeout_sec);
                if opened_at.elapsed() >= reset_timeout {
                    return PeerCircuitState::Closed;
                }
            }
            PeerCircuitState::Open
        } else {
            PeerCircuitState::Closed
        }
    }

    /// Check if the circuit is open (should reject requests).
    pub async fn is_circuit_open(&self) -> bool {
        self.circuit_state().await == PeerCircuitState::Open
    }

    /// Record a successful operation (resets failure count).
    pub async fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
        let mut opened_at = self.circuit_opened_at.write().await;
        if opened_at.take().is_some() {
            info!(peer = %self.config.address, "Circuit breaker closed for peer");
            metrics::record_peer_circuit_state(&self.config.address, "closed");
        }
    }

    /// Record a failed operation (increments failure count, may open circuit).
    pub async fn record_failure(&self) {
        let failures = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        let threshold = self.config.circuit_failure_threshold as u64;

        if failures >= threshold {
            let mut opened_at = self.circuit_opened_at.write().await;
            let current = *opened_at;
            match current {
                None => {
                    *opened_at = Some(Instant::now());
                    warn!(
                        peer = %self.config.address,
                        failures,
                        threshold,
                        reset_timeout_sec = self.config.circuit_reset_timeout_sec,
                        "Circuit breaker opened for peer"
                    );
                    metrics::record_peer_circuit_state(&self.config.address, "open");
                }
                // Half-open probe failed: re-arm the reset timer
                Some(at) if at.elapsed() >= Duration::from_secs(self.config.circuit_reset_timeout_sec) => {
                    *opened_at = Some(Instant::now());
                }
                Some(_) => {}
            }
        }
    }

    /// Get consecutive failure count.
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Drop the connection; the next request reconnects.
    pub async fn mark_disconnected(&self) {
        let mut link = self.link.lock().await;
        if matches!(*link, PeerLink::Connected(_)) {
            *link = PeerLink::Disconnected;
            debug!(peer = %self.config.address, "Connection marked as disconnected");
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Remote version of `stream`.
    pub async fn version(&self, stream: &str) -> Result<u64> {
        let reply = self
            .exchange("version", &wire::version_request(stream), self.timeouts.version)
            .await?;
        wire::parse_version_reply(&reply)
    }

    /// Pushes `records` as one `Append` request.
    ///
    /// Each record is sent with expected version `record.version - 1`.
    /// Returns the remote's last accepted version (0 if none was accepted).
    pub async fn append(&self, stream: &str, records: &[TapeRecord]) -> Result<u64> {
        let request = wire::append_request(stream, records);
        let reply = self.exchange("append", &request, self.timeouts.append).await?;
        wire::parse_version_reply(&reply)
    }

    /// One request/reply turn.
    async fn exchange(&self, operation: &str, request: &Message, reply_timeout: Duration) -> Result<Message> {
        if self.is_circuit_open().await {
            return Err(TapeError::unavailable(&self.config.address, "circuit open"));
        }

        let mut link = self.link.lock().await;
        let started = Instant::now();

        if matches!(*link, PeerLink::Disconnected) {
            match self.connect().await {
                Ok(socket) => *link = PeerLink::Connected(socket),
                Err(message) => {
                    self.record_failure().await;
                    return Err(TapeError::unavailable(&self.config.address, message));
                }
            }
        }
        let PeerLink::Connected(socket) = &mut *link else {
            return Err(TapeError::Internal("peer link not connected".into()));
        };

        let max_frame_bytes = self.timeouts.max_frame_bytes;
        let outcome = timeout(reply_timeout, async {
            wire::write_message(socket, request, max_frame_bytes).await?;
            wire::read_message(socket, max_frame_bytes).await
        })
        .await;

        let failure = match outcome {
            Ok(Ok(Some(reply))) => {
                metrics::record_peer_operation_latency(&self.config.address, operation, started.elapsed());
                drop(link);
                self.record_success().await;
                return Ok(reply);
            }
            Ok(Ok(None)) => "connection closed by peer".to_string(),
            Ok(Err(TapeError::Protocol(detail))) => {
                // Framing is lost; the connection cannot be reused.
                *link = PeerLink::Disconnected;
                return Err(TapeError::Protocol(detail));
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no reply within {reply_timeout:?}"),
        };

        *link = PeerLink::Disconnected;
        drop(link);
        warn!(peer = %self.config.address, operation, error = %failure, "Peer request failed");
        self.record_failure().await;
        Err(TapeError::unavailable(&self.config.address, failure))
    }

    async fn connect(&self) -> std::result::Result<TcpStream, String> {
        let address = self.config.address.as_str();
        let result = match timeout(self.timeouts.connect, TcpStream::connect(address)).await {
            Ok(Ok(socket)) => Ok(socket),
            Ok(Err(e)) => Err(format!("connect failed: {e}")),
            Err(_) => Err(format!("connect timed out after {:?}", self.timeouts.connect)),
        };

        match &result {
            Ok(socket) => {
                let _ = socket.set_nodelay(true);
                debug!(peer = %address, "Connected to peer");
                metrics::record_peer_connection(address, true);
            }
            Err(message) => {
                debug!(peer = %address, error = %message, "Peer connection failed");
                metrics::record_peer_connection(address, false);
            }
        }
        result
    }
}

/// Manager for all peer connections.
pub struct PeerManager {
    /// All peer connections (keyed by address)
    peers: dashmap::DashMap<String, Arc<PeerConnection>>,
    timeouts: PeerTimeouts,
}

impl PeerManager {
    /// Create a new peer manager.
    pub fn new(timeouts: PeerTimeouts) -> Self {
        Self {
            peers: dashmap::DashMap::new(),
            timeouts,
        }
    }

    /// Add a peer from configuration. Replaces an existing peer with the same address.
    pub fn add_peer(&self, config: PeerConfig) {
        let address = config.address.clone();
        let conn = Arc::new(PeerConnection::new(config, self.timeouts.clone()));
        self.peers.insert(address, conn);
    }

    /// Get a peer connection by address.
    pub fn get(&self, address: &str) -> Option<Arc<PeerConnection>> {
        self.peers.get(address).map(|r| r.value().clone())
    }

    /// All peer connections, ordered by address.
    pub fn all(&self) -> Vec<Arc<PeerConnection>> {
        let mut peers: Vec<_> = self.peers.iter().map(|r| r.value().clone()).collect();
        peers.sort_by(|a, b| a.address().cmp(b.address()));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drop every open connection.
    pub async fn disconnect_all(&self) {
        for peer in self.all() {
            peer.mark_disconnected().await;
        }
        metrics::set_connected_peers(0);
    }

    /// Get count of connected peers.
    pub async fn connected_count(&self) -> usize {
        let mut count = 0;
        for peer in self.all() {
            if peer.is_connected().await {
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast() -> PeerTimeouts {
        PeerTimeouts {
            connect: Duration::from_millis(300),
            version: Duration::from_millis(300),
            append: Duration::from_millis(300),
            max_frame_bytes: 1 << 20,
        }
    }

    /// Address with nothing listening on it.
    async fn dead_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    /// Answers every request with `reply`.
    async fn canned_server(reply: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let reply = reply.clone();
                tokio::spawn(async move {
                    while let Ok(Some(_)) = wire::read_message(&mut socket, 1 << 20).await {
                        if wire::write_message(&mut socket, &[reply.clone()], 1 << 20).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_peer_initial_state() {
        let conn = PeerConnection::new(PeerConfig::for_testing("127.0.0.1:1"), fast());
        assert_eq!(conn.address(), "127.0.0.1:1");
        assert_eq!(conn.state().await, PeerState::Disconnected);
        assert!(!conn.is_connected().await);
        assert_eq!(conn.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_circuit_breaker() {
        let config = PeerConfig {
            address: "127.0.0.1:1".to_string(),
            circuit_failure_threshold: 3,
            circuit_reset_timeout_sec: 1,
        };
        let conn = PeerConnection::new(config, fast());

        assert_eq!(conn.circuit_state().await, PeerCircuitState::Closed);
        conn.record_failure().await;
        conn.record_failure().await;
        assert_eq!(conn.circuit_state().await, PeerCircuitState::Closed);
        conn.record_failure().await;
        assert!(conn.is_circuit_open().await);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(conn.circuit_state().await, PeerCircuitState::Closed);

        conn.record_success().await;
        assert_eq!(conn.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_unavailable() {
        let conn = PeerConnection::new(PeerConfig::for_testing(&dead_address().await), fast());
        let err = conn.version("orders").await.unwrap_err();
        assert!(matches!(err, TapeError::PeerUnavailable { .. }));
        assert_eq!(conn.failure_count(), 1);
        assert_eq!(conn.state().await, PeerState::Disconnected);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_dialing() {
        let config = PeerConfig {
            circuit_failure_threshold: 1,
            ..PeerConfig::for_testing(&dead_address().await)
        };
        let conn = PeerConnection::new(config, fast());
        assert!(conn.version("s").await.is_err());
        let err = conn.version("s").await.unwrap_err();
        assert!(err.to_string().contains("circuit open"));
        // Rejected by the circuit, so no new failure was counted
        assert_eq!(conn.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_version_reply_parsed() {
        let addr = canned_server(wire::encode_version(42)).await;
        let conn = PeerConnection::new(PeerConfig::for_testing(&addr), fast());
        assert_eq!(conn.version("orders").await.unwrap(), 42);
        assert!(conn.is_connected().await);
        // Connection reused
        assert_eq!(conn.version("orders").await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_short_reply_is_protocol_error_and_keeps_connection() {
        let addr = canned_server(vec![1, 2, 3]).await;
        let conn = PeerConnection::new(PeerConfig::for_testing(&addr), fast());
        let err = conn.version("orders").await.unwrap_err();
        assert!(matches!(err, TapeError::Protocol(_)));
        assert!(conn.is_connected().await);
        assert_eq!(conn.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            // Accept and hold the socket without answering
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let conn = PeerConnection::new(PeerConfig::for_testing(&addr), fast());
        let err = conn.append("orders", &[TapeRecord::new(1, b"x".to_vec())]).await.unwrap_err();
        assert!(matches!(err, TapeError::PeerUnavailable { .. }));
        assert!(err.to_string().contains("no reply"));
        assert_eq!(conn.state().await, PeerState::Disconnected);
    }

    #[tokio::test]
    async fn test_peer_manager() {
        let manager = PeerManager::new(fast());
        assert!(manager.is_empty());
        manager.add_peer(PeerConfig::for_testing("b:2"));
        manager.add_peer(PeerConfig::for_testing("a:1"));
        assert_eq!(manager.len(), 2);

        let all = manager.all();
        assert_eq!(all[0].address(), "a:1");
        assert_eq!(all[1].address(), "b:2");
        assert!(manager.get("a:1").is_some());
        assert_eq!(manager.connected_count().await, 0);

        manager.disconnect_all().await;
        assert_eq!(manager.len(), 2);
    }
}
