//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Stream appends, reads and corruption
//! - Command server requests
//! - Peer connection status and circuit breaker state
//! - Replication batches, lag and pass outcomes
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `tape_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No recorder is installed by this crate; without one every call is a no-op.
//!
//! # Usage
//!
//! ```rust,no_run
//! use tape_replication::metrics;
//! use std::time::Duration;
//!
//! metrics::record_append("orders", true);
//! metrics::record_replication_batch("10.0.0.2:8765", 1000, Duration::from_millis(40));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Storage
// =============================================================================

/// Record the outcome of a conditional append.
pub fn record_append(stream: &str, accepted: bool) {
    let outcome = if accepted { "accepted" } else { "rejected" };
    counter!("tape_appends_total", "stream" => stream.to_string(), "outcome" => outcome).increment(1);
}

/// Record records written through the unconditional bulk path.
pub fn record_records_appended(stream: &str, count: usize) {
    counter!("tape_records_appended_total", "stream" => stream.to_string()).increment(count as u64);
}

pub fn record_records_read(stream: &str, count: usize) {
    counter!("tape_records_read_total", "stream" => stream.to_string()).increment(count as u64);
}

/// Record a record that failed integrity verification.
pub fn record_corrupt_record(stream: &str) {
    counter!("tape_corrupt_records_total", "stream" => stream.to_string()).increment(1);
}

// =============================================================================
// Command server
// =============================================================================

/// Record a handled request. `outcome` is `ok`, `error`, `protocol_error` or `unknown`.
pub fn record_server_request(command: &str, outcome: &str, duration: Duration) {
    counter!(
        "tape_server_requests_total",
        "command" => command.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("tape_server_request_duration_seconds", "command" => command.to_string())
        .record(duration.as_secs_f64());
}

pub fn set_server_connections(count: usize) {
    gauge!("tape_server_connections").set(count as f64);
}

// =============================================================================
// Peers
// =============================================================================

/// Record a peer connection event.
pub fn record_peer_connection(peer: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("tape_peer_connections_total", "peer" => peer.to_string(), "status" => status).increment(1);
}

/// Record peer circuit breaker state change.
pub fn record_peer_circuit_state(peer: &str, state: &str) {
    gauge!("tape_peer_circuit_open", "peer" => peer.to_string()).set(if state == "open" { 1.0 } else { 0.0 });
    counter!("tape_peer_circuit_transitions_total", "peer" => peer.to_string(), "state" => state.to_string())
        .increment(1);
}

/// Record latency of one request/reply exchange with a peer.
pub fn record_peer_operation_latency(peer: &str, operation: &str, duration: Duration) {
    histogram!(
        "tape_peer_operation_duration_seconds",
        "peer" => peer.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn set_connected_peers(count: usize) {
    gauge!("tape_connected_peers").set(count as f64);
}

// =============================================================================
// Replication
// =============================================================================

/// Record one pushed catch-up batch.
pub fn record_replication_batch(peer: &str, records: usize, duration: Duration) {
    counter!("tape_replication_batches_total", "peer" => peer.to_string()).increment(1);
    counter!("tape_replication_records_total", "peer" => peer.to_string()).increment(records as u64);
    histogram!("tape_replication_batch_size", "peer" => peer.to_string()).record(records as f64);
    histogram!("tape_replication_batch_duration_seconds", "peer" => peer.to_string())
        .record(duration.as_secs_f64());
}

/// Record replication lag in records (known version minus remote version).
pub fn set_replication_lag(peer: &str, lag_records: u64) {
    gauge!("tape_replication_lag_records", "peer" => peer.to_string()).set(lag_records as f64);
}

/// Record a per-peer pass outcome (`up_to_date`, `caught_up`, `incomplete`, `unavailable`, `failed`).
pub fn record_peer_outcome(peer: &str, outcome: &str) {
    counter!(
        "tape_replication_peer_outcomes_total",
        "peer" => peer.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a completed reconciliation pass.
pub fn record_pass(fully_synced: bool, duration: Duration) {
    let outcome = if fully_synced { "synced" } else { "behind" };
    counter!("tape_replication_passes_total", "outcome" => outcome).increment(1);
    histogram!("tape_replication_pass_duration_seconds").record(duration.as_secs_f64());
}

pub fn set_known_version(stream: &str, version: u64) {
    gauge!("tape_replication_known_version", "stream" => stream.to_string()).set(version as f64);
}

/// Set replicator state gauge.
pub fn set_replicator_state(state: &str) {
    let state_value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("tape_replicator_state").set(state_value);
}
