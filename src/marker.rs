// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persisted "known version" marker.
//!
//! The marker for stream file `orders` lives next to it as `orders.ver` and
//! holds the version as 8 bytes of little-endian signed integer. The command
//! server writes it after each append; the replicator reads it to learn how
//! far the local stream has advanced without rescanning.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::error::{Result, TapeError};
use crate::types::MAX_VERSION;

/// Suffix appended to a stream file name.
pub const MARKER_SUFFIX: &str = ".ver";

/// Suffix of the temp file a marker is written through.
pub const MARKER_TMP_SUFFIX: &str = ".ver.tmp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMarker {
    path: PathBuf,
}

impl VersionMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Marker that sits beside `stream_path`.
    pub fn for_stream(stream_path: &Path) -> Self {
        let mut name = stream_path.as_os_str().to_owned();
        name.push(MARKER_SUFFIX);
        Self::new(PathBuf::from(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored version, or `None` if no marker has been written.
    pub fn load(&self) -> Result<Option<u64>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            TapeError::corrupt(0, format!("version marker holds {} bytes, expected 8", bytes.len()))
        })?;
        let version = i64::from_le_bytes(raw);
        u64::try_from(version)
            .map(Some)
            .map_err(|_| TapeError::corrupt(0, format!("negative version marker {version}")))
    }

    /// Overwrites the marker with `version`.
    ///
    /// Written to a sibling temp file and renamed into place so readers
    /// never observe a partial value.
    pub fn store(&self, version: u64) -> Result<()> {
        if version > MAX_VERSION {
            return Err(TapeError::invalid(format!("version {version} exceeds {MAX_VERSION}")));
        }
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, (version as i64).to_le_bytes())?;
        fs::rename(&tmp, &self.path)?;
        trace!(path = %self.path.display(), version, "Published version marker");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_marker_path_beside_stream() {
        let marker = VersionMarker::for_stream(Path::new("/data/orders"));
        assert_eq!(marker.path(), Path::new("/data/orders.ver"));
    }

    #[test]
    fn test_missing_marker_is_none() {
        let dir = TempDir::new().unwrap();
        let marker = VersionMarker::new(dir.path().join("none.ver"));
        assert_eq!(marker.load().unwrap(), None);
    }

    #[test]
    fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        let marker = VersionMarker::new(dir.path().join("s.ver"));
        marker.store(2500).unwrap();
        assert_eq!(marker.load().unwrap(), Some(2500));
        assert_eq!(fs::read(marker.path()).unwrap(), 2500i64.to_le_bytes());
        marker.store(2501).unwrap();
        assert_eq!(marker.load().unwrap(), Some(2501));
    }

    #[test]
    fn test_malformed_marker() {
        let dir = TempDir::new().unwrap();
        let marker = VersionMarker::new(dir.path().join("s.ver"));
        fs::write(marker.path(), b"abc").unwrap();
        assert!(matches!(marker.load(), Err(TapeError::CorruptRecord { .. })));
        fs::write(marker.path(), (-1i64).to_le_bytes()).unwrap();
        assert!(marker.load().is_err());
    }
}
