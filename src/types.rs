// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Core value types: committed records and append conditions.

use crate::error::{Result, TapeError};

/// Largest version a stream may reach.
///
/// Versions travel the wire as signed 64-bit integers, so the domain is
/// capped at `i64::MAX` even though they are held as `u64` locally.
pub const MAX_VERSION: u64 = i64::MAX as u64;

/// One committed `(version, payload)` unit within a tape stream.
///
/// Records are only created by a successful append and never change afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapeRecord {
    /// Position of the record in its stream, starting at 1.
    pub version: u64,
    /// Opaque payload bytes (never empty).
    pub data: Vec<u8>,
}

impl TapeRecord {
    /// Create a record.
    pub fn new(version: u64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            version,
            data: data.into(),
        }
    }
}

/// Optimistic-concurrency precondition for an append.
///
/// Evaluated against the stream's current version while the write lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppendCondition {
    /// Always satisfied.
    #[default]
    None,
    /// Satisfied only when the current version equals the given one.
    VersionIs(u64),
}

impl AppendCondition {
    /// Condition that matches exactly `version`.
    pub fn version_is(version: u64) -> Self {
        Self::VersionIs(version)
    }

    /// Whether an append may proceed on a stream currently at `version`.
    pub fn satisfy(&self, version: u64) -> bool {
        match self {
            Self::None => true,
            Self::VersionIs(expected) => *expected == version,
        }
    }

    /// Strict variant of [`satisfy`](Self::satisfy).
    ///
    /// Returns [`TapeError::ConcurrencyConflict`] instead of `false`.
    pub fn enforce(&self, version: u64) -> Result<()> {
        match self {
            Self::VersionIs(expected) if *expected != version => {
                Err(TapeError::ConcurrencyConflict {
                    expected: *expected,
                    actual: version,
                })
            }
            _ => Ok(()),
        }
    }
}
