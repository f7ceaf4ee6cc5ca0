// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tape stream engine contract.
//!
//! A [`TapeStream`] owns one named, append-only log. A [`TapeStorage`] maps
//! stream names to engines. Two media are provided:
//!
//! - [`file`]: one file per stream under a root directory, with a
//!   medium-level exclusive lock per append and a store-wide lock file.
//! - [`memory`]: the same encoded layout kept in a byte buffer.
//!
//! # Concurrency
//!
//! Appends are serialized per stream. Reads never wait on an append: they
//! snapshot the stream length when opened and iterate over an independent
//! handle, so a reader never sees a record written after it started.
//!
//! # Rejections
//!
//! [`TapeStream::try_append`] returns `0` when its [`AppendCondition`] is not
//! met. That is not an error: the caller re-reads the version and retries.

pub mod file;
pub mod memory;

use std::sync::Arc;

use crate::error::{Result, TapeError};
use crate::types::{AppendCondition, TapeRecord, MAX_VERSION};

pub use file::{FileTapeStorage, FileTapeStream, RecordReader, StoreLock, STORE_LOCK_FILE};
pub use memory::{MemoryTapeStorage, MemoryTapeStream};

/// Lazy, finite sequence of records produced by [`TapeStream::read_records`].
///
/// Yields at most one error, after which it ends.
pub type RecordIter = Box<dyn Iterator<Item = Result<TapeRecord>> + Send>;

/// One named, append-only, versioned log.
pub trait TapeStream: Send + Sync {
    /// Stream name.
    fn name(&self) -> &str;

    /// Version of the last record, or 0 for an empty or missing stream.
    fn current_version(&self) -> Result<u64>;

    /// Up to `max_count` records with version greater than `after_version`.
    ///
    /// Bounds are checked eagerly; corruption surfaces lazily at the record
    /// that is damaged. Each call starts a fresh scan.
    fn read_records(&self, after_version: u64, max_count: usize) -> Result<RecordIter>;

    /// Appends `payload` at `current_version + 1` if `condition` holds.
    ///
    /// Returns the new version, or 0 if the condition rejected the write.
    fn try_append(&self, payload: &[u8], condition: AppendCondition) -> Result<u64>;

    /// Appends already-versioned records without checking conditions.
    ///
    /// Versions are written as given; contiguity with the existing tail is the
    /// caller's responsibility. Every payload must be non-empty.
    fn append_non_atomic(&self, records: &[TapeRecord]) -> Result<()>;

    /// Publishes `version` to observers of this stream (e.g. a replicator).
    fn publish_version(&self, _version: u64) -> Result<()> {
        Ok(())
    }
}

/// Maps stream names to engines.
pub trait TapeStorage: Send + Sync {
    /// Engine for `name`. Opening never creates anything on the medium.
    fn stream(&self, name: &str) -> Result<Arc<dyn TapeStream>>;
}

/// Validates `read_records` bounds against the version domain.
pub(crate) fn check_read_bounds(after_version: u64, max_count: usize) -> Result<()> {
    if max_count == 0 {
        return Err(TapeError::invalid("max_count must be more than zero"));
    }
    if after_version > MAX_VERSION {
        return Err(TapeError::invalid(format!(
            "after_version {after_version} exceeds {MAX_VERSION}"
        )));
    }
    let max = max_count as u64;
    if max > MAX_VERSION || after_version > MAX_VERSION - max {
        return Err(TapeError::invalid(format!(
            "after_version {after_version} + max_count {max_count} exceeds {MAX_VERSION}"
        )));
    }
    Ok(())
}

pub(crate) fn check_payloads(records: &[TapeRecord]) -> Result<()> {
    match records.iter().find(|r| r.data.is_empty()) {
        Some(r) => Err(TapeError::invalid(format!(
            "record {} must contain at least one byte",
            r.version
        ))),
        None => Ok(()),
    }
}
