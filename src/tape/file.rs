// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! File-backed tape streams.
//!
//! One file per stream. Writers open the file read-write and take an
//! exclusive advisory lock ([`fs2`]) for the duration of a single append;
//! readers open read-only and never lock.
//!
//! A [`FileTapeStorage`] owns a root directory and holds [`StoreLock`] on
//! `<root>/lock-store.txt` for its lifetime, so two servers cannot share a
//! root.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use tracing::{debug, info, warn};

use super::{check_payloads, check_read_bounds, RecordIter, TapeStorage, TapeStream};
use crate::codec;
use crate::error::{Result, TapeError};
use crate::marker::{VersionMarker, MARKER_SUFFIX, MARKER_TMP_SUFFIX};
use crate::metrics;
use crate::types::{AppendCondition, TapeRecord, MAX_VERSION};

/// Name of the store-wide lock file inside a storage root.
pub const STORE_LOCK_FILE: &str = "lock-store.txt";

// =============================================================================
// FileTapeStream
// =============================================================================

/// A tape stream stored in a single file.
#[derive(Debug, Clone)]
pub struct FileTapeStream {
    name: String,
    path: PathBuf,
    fsync: bool,
    marker: Option<VersionMarker>,
}

impl FileTapeStream {
    /// Stream backed by the file at `path`. The file is created on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name,
            path,
            fsync: false,
            marker: None,
        }
    }

    /// Flush file data to disk after every append.
    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    /// Write `<file>.ver` on [`TapeStream::publish_version`].
    pub fn with_version_marker(mut self, enabled: bool) -> Self {
        self.marker = enabled.then(|| VersionMarker::for_stream(&self.path));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_read(&self) -> Result<Option<File>> {
        match File::open(&self.path) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs `f` on the stream file while holding its exclusive lock.
    fn with_write_lock<T>(&self, f: impl FnOnce(&mut File) -> Result<T>) -> Result<T> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        file.lock_exclusive()?;

        let result = f(&mut file);
        let unlocked = FileExt::unlock(&file);
        let value = result?;
        unlocked?;
        Ok(value)
    }

    fn write_tail(&self, file: &mut File, bytes: &[u8]) -> Result<()> {
        file.seek(SeekFrom::End(0))?;
        file.write_all(bytes)?;
        if self.fsync {
            file.sync_data()?;
        }
        Ok(())
    }

    fn note_corruption<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(TapeError::CorruptRecord { offset, reason }) = &result {
            warn!(stream = %self.name, offset, reason = %reason, "Corrupt record");
            metrics::record_corrupt_record(&self.name);
        }
        result
    }
}

impl TapeStream for FileTapeStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn current_version(&self) -> Result<u64> {
        let Some(mut file) = self.open_read()? else {
            return Ok(0);
        };
        self.note_corruption(codec::read_version_from_tail(&mut file))
    }

    fn read_records(&self, after_version: u64, max_count: usize) -> Result<RecordIter> {
        check_read_bounds(after_version, max_count)?;
        let Some(file) = self.open_read()? else {
            return Ok(Box::new(std::iter::empty()));
        };
        let reader = RecordReader::open(file, self.name.clone(), after_version, max_count)?;
        Ok(Box::new(reader))
    }

    fn try_append(&self, payload: &[u8], condition: AppendCondition) -> Result<u64> {
        if payload.is_empty() {
            return Err(TapeError::invalid("payload must contain at least one byte"));
        }

        let result = self.with_write_lock(|file| {
            let current = codec::read_version_from_tail(file)?;
            if !condition.satisfy(current) {
                debug!(stream = %self.name, current, ?condition, "Append rejected");
                return Ok(0);
            }
            if current >= MAX_VERSION {
                return Err(TapeError::invalid("stream version exhausted"));
            }

            let version = current + 1;
            let bytes = codec::encode(payload, version)?;
            self.write_tail(file, &bytes)?;
            Ok(version)
        });
        let version = self.note_corruption(result)?;

        metrics::record_append(&self.name, version != 0);
        if version != 0 {
            debug!(stream = %self.name, version, bytes = payload.len(), "Appended record");
        }
        Ok(version)
    }

    fn append_non_atomic(&self, records: &[TapeRecord]) -> Result<()> {
        check_payloads(records)?;
        if records.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(
            records.iter().map(|r| codec::encoded_len(r.data.len())).sum(),
        );
        for record in records {
            codec::encode_into(&mut buf, &record.data, record.version)?;
        }

        self.with_write_lock(|file| self.write_tail(file, &buf))?;

        metrics::record_records_appended(&self.name, records.len());
        debug!(
            stream = %self.name,
            count = records.len(),
            first = records[0].version,
            last = records[records.len() - 1].version,
            "Appended records without condition"
        );
        Ok(())
    }

    fn publish_version(&self, version: u64) -> Result<()> {
        match &self.marker {
            Some(marker) => marker.store(version),
            None => Ok(()),
        }
    }
}

// =============================================================================
// RecordReader
// =============================================================================

/// Iterator over the records of one stream file.
///
/// Holds its own read handle. The file length is captured at open, so records
/// appended while iterating are not observed. The requested skip happens on
/// the first call to `next`, which means a damaged record in the skipped
/// region surfaces as the first item rather than failing the call that
/// created the reader.
pub struct RecordReader {
    reader: BufReader<File>,
    stream: String,
    end: u64,
    pending_skip: u64,
    remaining: usize,
    done: bool,
}

impl RecordReader {
    pub fn open(file: File, stream: String, after_version: u64, max_count: usize) -> Result<Self> {
        let end = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            stream,
            end,
            pending_skip: after_version,
            remaining: max_count,
            done: false,
        })
    }

    fn advance(&mut self) -> Result<Option<TapeRecord>> {
        if self.pending_skip > 0 {
            let skip = std::mem::take(&mut self.pending_skip);
            if !codec::skip_records(&mut self.reader, skip)? {
                return Ok(None);
            }
        }
        if self.reader.stream_position()? >= self.end {
            return Ok(None);
        }
        codec::read_record(&mut self.reader)
    }
}

impl Iterator for RecordReader {
    type Item = Result<TapeRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.remaining == 0 {
            return None;
        }
        match self.advance() {
            Ok(Some(record)) => {
                self.remaining -= 1;
                metrics::record_records_read(&self.stream, 1);
                Some(Ok(record))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                if let TapeError::CorruptRecord { offset, reason } = &e {
                    warn!(stream = %self.stream, offset, reason = %reason, "Corrupt record");
                    metrics::record_corrupt_record(&self.stream);
                }
                Some(Err(e))
            }
        }
    }
}

// =============================================================================
// Storage root
// =============================================================================

/// Exclusive ownership of a storage root.
///
/// Released, and the lock file removed, on drop.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
    file: File,
}

impl StoreLock {
    /// Takes the lock without blocking.
    pub fn acquire(root: &Path) -> Result<Self> {
        let path = root.join(STORE_LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        file.try_lock_exclusive().map_err(|_| TapeError::StoreLocked {
            path: path.display().to_string(),
        })?;

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release store lock");
        }
        if let Err(e) = fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "Store lock file not removed");
        }
    }
}

/// Root directory holding one file per stream.
#[derive(Debug)]
pub struct FileTapeStorage {
    root: PathBuf,
    fsync: bool,
    version_markers: bool,
    _lock: StoreLock,
}

impl FileTapeStorage {
    /// Creates `root` if needed and takes the store lock.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let lock = StoreLock::acquire(&root)?;
        info!(root = %root.display(), "Opened tape storage");
        Ok(Self {
            root,
            fsync: false,
            version_markers: false,
            _lock: lock,
        })
    }

    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn with_version_markers(mut self, enabled: bool) -> Self {
        self.version_markers = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File path for `name`. Only the final path component is used.
    ///
    /// The store lock and anything shaped like a version marker share the
    /// root with stream files, so those names are refused.
    pub fn stream_path(&self, name: &str) -> Result<PathBuf> {
        let file_name = Path::new(name)
            .file_name()
            .ok_or_else(|| TapeError::invalid(format!("invalid stream name {name:?}")))?;
        let reserved = file_name == STORE_LOCK_FILE
            || file_name
                .to_str()
                .is_some_and(|n| n.ends_with(MARKER_SUFFIX) || n.ends_with(MARKER_TMP_SUFFIX));
        if reserved {
            return Err(TapeError::invalid(format!("reserved stream name {name:?}")));
        }
        Ok(self.root.join(file_name))
    }
}

impl TapeStorage for FileTapeStorage {
    fn stream(&self, name: &str) -> Result<Arc<dyn TapeStream>> {
        let path = self.stream_path(name)?;
        Ok(Arc::new(
            FileTapeStream::new(path)
                .with_fsync(self.fsync)
                .with_version_marker(self.version_markers),
        ))
    }
}
