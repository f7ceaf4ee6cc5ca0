// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory tape streams.
//!
//! Keeps the exact on-disk byte layout in a buffer and runs the same codec
//! over it, so behaviour (including corruption detection) matches the file
//! medium. Useful for embedders without a filesystem and for tests.

use std::io::Cursor;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use tracing::debug;

use super::{check_payloads, check_read_bounds, RecordIter, TapeStorage, TapeStream};
use crate::codec;
use crate::error::{Result, TapeError};
use crate::metrics;
use crate::types::{AppendCondition, TapeRecord, MAX_VERSION};

#[derive(Debug, Default)]
pub struct MemoryTapeStream {
    name: String,
    bytes: RwLock<Vec<u8>>,
    published: RwLock<Option<u64>>,
}

impl MemoryTapeStream {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Raw encoded contents.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.read_guard()?.clone())
    }

    /// Replaces the raw contents. Intended for corruption tests.
    pub fn overwrite(&self, bytes: Vec<u8>) -> Result<()> {
        *self.write_guard()? = bytes;
        Ok(())
    }

    /// Last value passed to [`TapeStream::publish_version`].
    pub fn published_version(&self) -> Option<u64> {
        self.published.read().ok().and_then(|v| *v)
    }

    fn read_guard(&self) -> Result<RwLockReadGuard<'_, Vec<u8>>> {
        self.bytes
            .read()
            .map_err(|_| TapeError::Internal(format!("stream {} lock poisoned", self.name)))
    }

    fn write_guard(&self) -> Result<RwLockWriteGuard<'_, Vec<u8>>> {
        self.bytes
            .write()
            .map_err(|_| TapeError::Internal(format!("stream {} lock poisoned", self.name)))
    }
}

impl TapeStream for MemoryTapeStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn current_version(&self) -> Result<u64> {
        let bytes = self.read_guard()?;
        codec::read_version_from_tail(&mut Cursor::new(bytes.as_slice()))
    }

    fn read_records(&self, after_version: u64, max_count: usize) -> Result<RecordIter> {
        check_read_bounds(after_version, max_count)?;

        // Copy-on-read gives the iterator its own view, like a separate file handle.
        let mut cursor = Cursor::new(self.snapshot()?);
        let mut skipped = after_version == 0;
        let mut remaining = max_count;
        let mut done = false;
        let stream = self.name.clone();

        Ok(Box::new(std::iter::from_fn(move || {
            if done || remaining == 0 {
                return None;
            }
            let next = (|| -> Result<Option<TapeRecord>> {
                if !skipped {
                    skipped = true;
                    if !codec::skip_records(&mut cursor, after_version)? {
                        return Ok(None);
                    }
                }
                codec::read_record(&mut cursor)
            })();
            match next {
                Ok(Some(record)) => {
                    remaining -= 1;
                    metrics::record_records_read(&stream, 1);
                    Some(Ok(record))
                }
                Ok(None) => {
                    done = true;
                    None
                }
                Err(e) => {
                    done = true;
                    if matches!(e, TapeError::CorruptRecord { .. }) {
                        metrics::record_corrupt_record(&stream);
                    }
                    Some(Err(e))
                }
            }
        })))
    }

    fn try_append(&self, payload: &[u8], condition: AppendCondition) -> Result<u64> {
        if payload.is_empty() {
            return Err(TapeError::invalid("payload must contain at least one byte"));
        }
        let mut bytes = self.write_guard()?;
        let current = codec::read_version_from_tail(&mut Cursor::new(bytes.as_slice()))?;
        if !condition.satisfy(current) {
            metrics::record_append(&self.name, false);
            return Ok(0);
        }
        if current >= MAX_VERSION {
            return Err(TapeError::invalid("stream version exhausted"));
        }
        let version = current + 1;
        codec::encode_into(&mut bytes, payload, version)?;
        metrics::record_append(&self.name, true);
        debug!(stream = %self.name, version, "Appended record");
        Ok(version)
    }

    fn append_non_atomic(&self, records: &[TapeRecord]) -> Result<()> {
        check_payloads(records)?;
        let mut buf = Vec::new();
        for record in records {
            codec::encode_into(&mut buf, &record.data, record.version)?;
        }
        self.write_guard()?.extend_from_slice(&buf);
        metrics::record_records_appended(&self.name, records.len());
        Ok(())
    }

    fn publish_version(&self, version: u64) -> Result<()> {
        if let Ok(mut published) = self.published.write() {
            *published = Some(version);
        }
        Ok(())
    }
}

/// Name-keyed collection of [`MemoryTapeStream`]s, created on first use.
#[derive(Debug, Default)]
pub struct MemoryTapeStorage {
    streams: DashMap<String, Arc<MemoryTapeStream>>,
}

impl MemoryTapeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concrete handle, for inspection in tests.
    pub fn get(&self, name: &str) -> Arc<MemoryTapeStream> {
        self.streams
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryTapeStream::new(name)))
            .clone()
    }
}

impl TapeStorage for MemoryTapeStorage {
    fn stream(&self, name: &str) -> Result<Arc<dyn TapeStream>> {
        if name.is_empty() {
            return Err(TapeError::invalid("stream name must not be empty"));
        }
        Ok(self.get(name))
    }
}
