//! Catch-up batch sizing.
//!
//! A lagging peer is brought forward in batches of at most `batch_size`
//! records, each pushed as one `Append` request.

use crate::config::MAX_CATCH_UP_BATCH;

/// Number of records to push next: `min(batch_size, known - remote)`.
///
/// Returns 0 when the peer is not behind. `batch_size` is clamped to
/// `1..=MAX_CATCH_UP_BATCH`.
pub fn next_batch_size(remote_version: u64, known_version: u64, batch_size: usize) -> usize {
    let behind = known_version.saturating_sub(remote_version);
    let limit = batch_size.clamp(1, MAX_CATCH_UP_BATCH) as u64;
    behind.min(limit) as usize
}

/// Batches needed to bring `remote_version` up to `known_version`, assuming
/// every batch is accepted in full.
pub fn batches_needed(remote_version: u64, known_version: u64, batch_size: usize) -> u64 {
    let behind = known_version.saturating_sub(remote_version);
    let limit = batch_size.clamp(1, MAX_CATCH_UP_BATCH) as u64;
    behind.div_ceil(limit)
}
