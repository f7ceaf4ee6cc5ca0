//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - File-backed command servers on ephemeral ports
//! - Stream fill/read helpers
//! - Addresses nothing listens on

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tape_replication::{
    CommandServer, FileTapeStream, ServerConfig, ServerHandle, TapeRecord, TapeStream,
};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// A command server over a temporary root directory.
pub struct TestServer {
    pub root: TempDir,
    handle: ServerHandle,
}

impl TestServer {
    /// Starts a file-backed server on `127.0.0.1:0`.
    pub async fn start() -> Self {
        let root = TempDir::new().unwrap();
        let handle = CommandServer::bind(&ServerConfig::for_testing(root.path()))
            .await
            .unwrap();
        Self { root, handle }
    }

    /// Starts a server over an existing listener (e.g. a reserved address).
    pub async fn start_on(listener: TcpListener) -> Self {
        let root = TempDir::new().unwrap();
        let storage = tape_replication::FileTapeStorage::open(root.path()).unwrap();
        let server = Arc::new(CommandServer::new(Arc::new(storage)));
        let handle = server
            .spawn(listener, tape_replication::wire::DEFAULT_MAX_FRAME_BYTES, Duration::from_secs(2))
            .unwrap();
        Self { root, handle }
    }

    pub fn address(&self) -> String {
        self.handle.local_addr().to_string()
    }

    /// Read-side handle on one of the server's streams.
    pub fn stream(&self, name: &str) -> FileTapeStream {
        FileTapeStream::new(self.root.path().join(name))
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().await.unwrap();
    }
}

/// Appends `count` records `"<prefix>-<n>"` without conditions.
pub fn write_events(stream: &dyn TapeStream, prefix: &str, count: usize) {
    let start = stream.current_version().unwrap();
    let records: Vec<TapeRecord> = (1..=count as u64)
        .map(|i| TapeRecord::new(start + i, format!("{prefix}-{}", start + i)))
        .collect();
    stream.append_non_atomic(&records).unwrap();
}

/// Every record in `stream`.
pub fn read_all(stream: &dyn TapeStream) -> Vec<TapeRecord> {
    stream
        .read_records(0, 1_000_000)
        .unwrap()
        .collect::<tape_replication::Result<Vec<_>>>()
        .unwrap()
}

/// File stream in `dir` preloaded with `count` events.
pub fn local_stream(dir: &Path, name: &str, count: usize) -> FileTapeStream {
    let stream = FileTapeStream::new(dir.join(name));
    if count > 0 {
        write_events(&stream, name, count);
    }
    stream
}

/// Reserves a loopback port and releases it, so nothing listens there.
pub async fn unused_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

/// Polls until `stream` reaches `version` or five seconds pass.
pub async fn wait_for_version(stream: &dyn TapeStream, version: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = stream.current_version().unwrap();
        if current >= version {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out at version {current}, waiting for {version}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
