//! Fuzz target for the tail version read.
//!
//! Tests that `read_version_from_tail` never panics or reads out of bounds.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tape_replication::codec::read_version_from_tail;
use tape_replication::MAX_VERSION;

fuzz_target!(|data: &[u8]| {
    let mut cursor = std::io::Cursor::new(data);
    if let Ok(version) = read_version_from_tail(&mut cursor) {
        assert!(version <= MAX_VERSION);
    }
});
