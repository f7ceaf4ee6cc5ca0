//! Fuzz target for record decoding.
//!
//! Arbitrary bytes must decode to a record or a corruption error, never panic.
//! Anything that does decode must re-encode to the bytes it came from.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tape_replication::codec;

fuzz_target!(|data: &[u8]| {
    if let Ok(record) = codec::decode(data) {
        let encoded = codec::encode(&record.data, record.version).expect("decoded record re-encodes");
        assert_eq!(&encoded[..], &data[..encoded.len()]);
    }

    let mut cursor = std::io::Cursor::new(data);
    let _ = codec::skip_records(&mut cursor, 3);
});
