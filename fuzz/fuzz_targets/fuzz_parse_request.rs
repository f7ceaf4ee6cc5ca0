//! Fuzz target for request parsing.
//!
//! Splits the input into frames and checks `parse_request` never panics.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tape_replication::wire::parse_request;

fuzz_target!(|data: &[u8]| {
    let frames: Vec<Vec<u8>> = data.split(|b| *b == 0xff).map(<[u8]>::to_vec).collect();
    let _ = parse_request(&frames);
});
