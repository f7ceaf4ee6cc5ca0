//! Configuration for the command server and the replicator.
//!
//! Both can be constructed programmatically or deserialized from YAML/JSON.
//! Durations are humantime strings (`"500ms"`, `"5s"`, `"1m"`); a value that
//! fails to parse falls back to the documented default.
//!
//! # Quick Start
//!
//! ```rust
//! use tape_replication::config::{PeerConfig, ReplicatorConfig};
//!
//! let config = ReplicatorConfig {
//!     local_path: "/var/lib/tapes/orders".into(),
//!     stream_name: "orders".into(),
//!     peers: vec![PeerConfig::for_testing("10.0.0.2:8765")],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ServerConfig
//! ├── bind_addr: String            # TCP listen address
//! ├── root: PathBuf                # one file per stream
//! ├── fsync / version_markers
//! └── max_frame_bytes / drain_timeout
//!
//! ReplicatorConfig
//! ├── local_path: PathBuf          # local stream file
//! ├── stream_name: String          # name on the remote servers
//! ├── marker_path: Option<PathBuf> # defaults to <local_path>.ver
//! ├── peers: Vec<PeerConfig>
//! └── settings: ReplicationSettings
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! local_path: "/var/lib/tapes/orders"
//! stream_name: "orders"
//! peers:
//!   - address: "10.0.0.2:8765"
//!   - address: "10.0.0.3:8765"
//!     circuit_failure_threshold: 3
//! settings:
//!   batch_size: 500
//!   recheck_interval: "30s"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TapeError};
use crate::marker::VersionMarker;
use crate::wire::DEFAULT_MAX_FRAME_BYTES;

/// Upper bound on records pushed in one `Append` request.
pub const MAX_CATCH_UP_BATCH: usize = 1000;

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// ServerConfig: command server endpoint + storage root
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// TCP address to listen on, e.g. `"0.0.0.0:8765"`.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Directory holding one file per stream. Locked for the server's lifetime.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Largest accepted frame.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// `fdatasync` after every append.
    #[serde(default = "default_false")]
    pub fsync: bool,

    /// Write `<stream>.ver` after every `Append` command.
    #[serde(default = "default_true")]
    pub version_markers: bool,

    /// How long `shutdown` waits for the server task to finish.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8765".to_string()
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_drain_timeout() -> String {
    "5s".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            root: default_root(),
            max_frame_bytes: default_max_frame_bytes(),
            fsync: false,
            version_markers: true,
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port on loopback, storing under `root`.
    pub fn for_testing(root: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn drain_timeout_duration(&self) -> Duration {
        parse_or(&self.drain_timeout, Duration::from_secs(5))
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind_addr.is_empty() {
            return Err(TapeError::Config("bind_addr must not be empty".into()));
        }
        if self.max_frame_bytes == 0 {
            return Err(TapeError::Config("max_frame_bytes must be positive".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicatorConfig: local stream + remote peers
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything a replicator needs to keep remote copies of one stream current.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Path of the local stream file (read-only from the replicator's side).
    pub local_path: PathBuf,

    /// Stream name used in requests to the remote servers.
    pub stream_name: String,

    /// Known-version marker. Defaults to `<local_path>.ver`.
    #[serde(default)]
    pub marker_path: Option<PathBuf>,

    /// Remote command servers to keep caught up.
    pub peers: Vec<PeerConfig>,

    #[serde(default)]
    pub settings: ReplicationSettings,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            local_path: PathBuf::new(),
            stream_name: String::new(),
            marker_path: None,
            peers: Vec::new(),
            settings: ReplicationSettings::default(),
        }
    }
}

impl ReplicatorConfig {
    /// Minimal config with fast timings for tests.
    pub fn for_testing(local_path: impl Into<PathBuf>, stream_name: &str, peers: &[&str]) -> Self {
        Self {
            local_path: local_path.into(),
            stream_name: stream_name.to_string(),
            marker_path: None,
            peers: peers.iter().map(|a| PeerConfig::for_testing(a)).collect(),
            settings: ReplicationSettings::for_testing(),
        }
    }

    /// The marker this replicator reads its known version from.
    pub fn marker(&self) -> VersionMarker {
        match &self.marker_path {
            Some(path) => VersionMarker::new(path.clone()),
            None => VersionMarker::for_stream(&self.local_path),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.stream_name.is_empty() {
            return Err(TapeError::Config("stream_name must not be empty".into()));
        }
        if self.local_path.as_os_str().is_empty() {
            return Err(TapeError::Config("local_path must not be empty".into()));
        }
        if self.peers.is_empty() {
            return Err(TapeError::Config("at least one peer is required".into()));
        }
        if self.peers.iter().any(|p| p.address.is_empty()) {
            return Err(TapeError::Config("peer address must not be empty".into()));
        }
        self.settings.validate()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings: batching, timers and timeouts
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Records per `Append` request (at most [`MAX_CATCH_UP_BATCH`]).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Run a pass at least this often even without a wake-up.
    #[serde(default = "default_recheck_interval")]
    pub recheck_interval: String,

    /// Delay after the first failed pass.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: String,

    /// Cap for the exponential retry delay.
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// Reply timeout for `Version`.
    #[serde(default = "default_version_timeout")]
    pub version_timeout: String,

    /// Reply timeout for `Append`.
    #[serde(default = "default_append_timeout")]
    pub append_timeout: String,

    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// How long `shutdown` waits for the driver task.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

fn default_batch_size() -> usize {
    MAX_CATCH_UP_BATCH
}

fn default_recheck_interval() -> String {
    "30s".to_string()
}

fn default_retry_delay() -> String {
    "500ms".to_string()
}

fn default_max_retry_delay() -> String {
    "30s".to_string()
}

fn default_connect_timeout() -> String {
    "2s".to_string()
}

fn default_version_timeout() -> String {
    "2s".to_string()
}

fn default_append_timeout() -> String {
    "5s".to_string()
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            recheck_interval: default_recheck_interval(),
            retry_delay: default_retry_delay(),
            max_retry_delay: default_max_retry_delay(),
            connect_timeout: default_connect_timeout(),
            version_timeout: default_version_timeout(),
            append_timeout: default_append_timeout(),
            max_frame_bytes: default_max_frame_bytes(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl ReplicationSettings {
    /// Short timers so tests do not sit in backoff.
    pub fn for_testing() -> Self {
        Self {
            recheck_interval: "200ms".to_string(),
            retry_delay: "20ms".to_string(),
            max_retry_delay: "100ms".to_string(),
            connect_timeout: "500ms".to_string(),
            version_timeout: "500ms".to_string(),
            append_timeout: "1s".to_string(),
            drain_timeout: "2s".to_string(),
            ..Default::default()
        }
    }

    pub fn recheck_interval_duration(&self) -> Duration {
        parse_or(&self.recheck_interval, Duration::from_secs(30))
    }

    pub fn retry_delay_duration(&self) -> Duration {
        parse_or(&self.retry_delay, Duration::from_millis(500))
    }

    pub fn max_retry_delay_duration(&self) -> Duration {
        parse_or(&self.max_retry_delay, Duration::from_secs(30))
    }

    pub fn connect_timeout_duration(&self) -> Duration {
        parse_or(&self.connect_timeout, Duration::from_secs(2))
    }

    pub fn version_timeout_duration(&self) -> Duration {
        parse_or(&self.version_timeout, Duration::from_secs(2))
    }

    pub fn append_timeout_duration(&self) -> Duration {
        parse_or(&self.append_timeout, Duration::from_secs(5))
    }

    pub fn drain_timeout_duration(&self) -> Duration {
        parse_or(&self.drain_timeout, Duration::from_secs(5))
    }

    /// Backoff schedule between failed passes.
    pub fn retry_config(&self) -> crate::resilience::RetryConfig {
        crate::resilience::RetryConfig {
            initial_delay: self.retry_delay_duration(),
            max_delay: self.max_retry_delay_duration(),
            backoff_factor: 2.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TapeError::Config("batch_size must be positive".into()));
        }
        if self.batch_size > MAX_CATCH_UP_BATCH {
            return Err(TapeError::Config(format!(
                "batch_size {} exceeds {MAX_CATCH_UP_BATCH}",
                self.batch_size
            )));
        }
        if self.max_frame_bytes == 0 {
            return Err(TapeError::Config("max_frame_bytes must be positive".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PeerConfig: one entry per remote command server
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// `host:port` of the remote command server.
    pub address: String,

    /// Number of consecutive failures before circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long to wait before trying again after circuit opens (seconds).
    #[serde(default = "default_circuit_reset_timeout")]
    pub circuit_reset_timeout_sec: u64,
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout() -> u64 {
    30
}

impl PeerConfig {
    /// Create a peer config for testing.
    pub fn for_testing(address: &str) -> Self {
        Self {
            address: address.to_string(),
            circuit_failure_threshold: 5,
            circuit_reset_timeout_sec: 30,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8765");
        assert!(config.version_markers);
        assert!(!config.fsync);
        assert_eq!(config.drain_timeout_duration(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_config_from_json_defaults() {
        let config: ServerConfig = serde_json::from_str(r#"{"root": "/data"}"#).unwrap();
        assert_eq!(config.root, PathBuf::from("/data"));
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
    }

    #[test]
    fn test_settings_default_timeouts() {
        let settings = ReplicationSettings::default();
        assert_eq!(settings.batch_size, 1000);
        assert_eq!(settings.version_timeout_duration(), Duration::from_secs(2));
        assert_eq!(settings.append_timeout_duration(), Duration::from_secs(5));
        assert_eq!(settings.recheck_interval_duration(), Duration::from_secs(30));
    }

    #[test]
    fn test_duration_various_formats() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("1m", Duration::from_secs(60)),
            ("500ms", Duration::from_millis(500)),
            ("2min", Duration::from_secs(120)),
        ];

        for (input, expected) in test_cases {
            let settings = ReplicationSettings {
                append_timeout: input.to_string(),
                ..Default::default()
            };
            assert_eq!(settings.append_timeout_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_duration_invalid_fallback() {
        let settings = ReplicationSettings {
            version_timeout: "soon".to_string(),
            retry_delay: "".to_string(),
            ..Default::default()
        };
        assert_eq!(settings.version_timeout_duration(), Duration::from_secs(2));
        assert_eq!(settings.retry_delay_duration(), Duration::from_millis(500));
    }

    #[test]
    fn test_batch_size_bounds() {
        let mut settings = ReplicationSettings::default();
        settings.batch_size = 0;
        assert!(matches!(settings.validate(), Err(TapeError::Config(_))));
        settings.batch_size = MAX_CATCH_UP_BATCH + 1;
        assert!(settings.validate().is_err());
        settings.batch_size = 1;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_replicator_requires_peers() {
        let mut config = ReplicatorConfig::for_testing("/tmp/orders", "orders", &[]);
        assert!(config.validate().is_err());
        config.peers.push(PeerConfig::for_testing("127.0.0.1:9"));
        assert!(config.validate().is_ok());
        config.stream_name.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_marker_defaults_beside_local_file() {
        let config = ReplicatorConfig::for_testing("/data/orders", "orders", &["a:1"]);
        assert_eq!(config.marker().path(), std::path::Path::new("/data/orders.ver"));

        let config = ReplicatorConfig {
            marker_path: Some("/run/orders.version".into()),
            ..config
        };
        assert_eq!(config.marker().path(), std::path::Path::new("/run/orders.version"));
    }

    #[test]
    fn test_peer_config_defaults() {
        let peer: PeerConfig = serde_json::from_str(r#"{"address": "10.0.0.2:8765"}"#).unwrap();
        assert_eq!(peer.circuit_failure_threshold, 5);
        assert_eq!(peer.circuit_reset_timeout_sec, 30);
    }

    #[test]
    fn test_retry_config_from_settings() {
        let retry = ReplicationSettings::default().retry_config();
        assert_eq!(retry.initial_delay, Duration::from_millis(500));
        assert_eq!(retry.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = ReplicatorConfig::for_testing("/data/orders", "orders", &["a:1", "b:2"]);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ReplicatorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.peers.len(), 2);
        assert_eq!(parsed.settings.recheck_interval, "200ms");
    }
}
