//! # Tape Replication
//!
//! Append-only "tape" streams with optimistic-concurrency writes, a small
//! request/reply command server in front of them, and a client that catches
//! remote copies of a stream up to a local one.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐          ┌──────────────────────────────┐
//! │        Replicator        │  Version │        CommandServer         │
//! │                          │ ───────► │                              │
//! │ known_version (.ver)     │  Append  │  dispatcher (one at a time)  │
//! │ run_pass ─► sync_peer ───┼────────► │        │                     │
//! │   batches of <= 1000     │ ◄─────── │        ▼                     │
//! │                          │  version │  TapeStorage ─► TapeStream   │
//! └────────────┬─────────────┘          └──────────────────────────────┘
//!              │ read_records
//!              ▼
//!      local TapeStream (file)
//! ```
//!
//! ## Record Format
//!
//! Every record on disk is self-describing:
//!
//! ```text
//! /* header <len:16 hex> */\r\n
//! <payload>
//! \r\n/* footer <len:16 hex><version:16 hex><sha1 base64:28> */\r\n
//! ```
//!
//! The footer sits at a fixed distance from the end of the file, so the
//! current version of a stream is read from its last 49 bytes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tape_replication::{CommandServer, Replicator, ReplicatorConfig, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> tape_replication::Result<()> {
//!     let server = CommandServer::bind(&ServerConfig::default()).await?;
//!
//!     let config = ReplicatorConfig::for_testing("data/orders", "orders", &["10.0.0.2:8765"]);
//!     let mut replicator = Replicator::new(config)?;
//!     replicator.start()?;
//!
//!     // ... local writes happen, host calls replicator.notify_changed() ...
//!
//!     replicator.shutdown().await;
//!     server.shutdown().await
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod marker;
pub mod metrics;
pub mod peer;
pub mod replicator;
pub mod resilience;
pub mod server;
pub mod tape;
pub mod types;
pub mod wire;

// Re-exports for convenience
pub use config::{PeerConfig, ReplicationSettings, ReplicatorConfig, ServerConfig, MAX_CATCH_UP_BATCH};
pub use error::{Result, TapeError};
pub use marker::VersionMarker;
pub use peer::{PeerConnection, PeerManager};
pub use replicator::{PassReport, PeerSyncOutcome, Replicator, ReplicatorState};
pub use server::{CommandServer, ServerHandle};
pub use tape::{FileTapeStorage, FileTapeStream, MemoryTapeStorage, MemoryTapeStream, TapeStorage, TapeStream};
pub use types::{AppendCondition, TapeRecord, MAX_VERSION};
