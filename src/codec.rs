// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Record Codec
//!
//! Encodes a single `(version, payload)` pair into a self-describing byte
//! layout and decodes it back, detecting corruption on the way.
//!
//! ## Record Format
//!
//! ```text
//! /* header <length:16 hex> */\r\n
//! <payload: length bytes>
//! \r\n/* footer <length:16 hex><version:16 hex><sha1:28 base64> */\r\n
//! ```
//!
//! Integers are lowercase, zero-padded hexadecimal text and the hash is
//! padded standard base64, so a file of text payloads stays readable in a
//! plain viewer.
//!
//! Every field after the payload has a fixed width. That makes the last
//! record's version reachable by seeking back [`TAIL_LEN`] bytes from the end
//! of the stream, without scanning.

use std::io::{self, Read, Seek, SeekFrom};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::{Digest, Sha1};

use crate::error::{Result, TapeError};
use crate::types::{TapeRecord, MAX_VERSION};

pub const HEADER_START: &[u8] = b"/* header ";
pub const HEADER_END: &[u8] = b" */\r\n";
pub const FOOTER_START: &[u8] = b"\r\n/* footer ";
pub const FOOTER_END: &[u8] = b" */\r\n";

/// Width of a hex-encoded 64-bit integer.
pub const HEX_LEN: usize = 16;
/// Width of a base64-encoded SHA-1 digest.
pub const HASH_LEN: usize = 28;

/// Bytes before the payload.
pub const HEADER_LEN: usize = HEADER_START.len() + HEX_LEN + HEADER_END.len();
/// Bytes after the payload.
pub const FOOTER_LEN: usize = FOOTER_START.len() + HEX_LEN + HEX_LEN + HASH_LEN + FOOTER_END.len();
/// Distance from end of stream back to the last record's version field.
pub const TAIL_LEN: usize = HEX_LEN + HASH_LEN + FOOTER_END.len();

/// Total encoded size of a record carrying `payload_len` bytes.
pub fn encoded_len(payload_len: usize) -> usize {
    HEADER_LEN + payload_len + FOOTER_LEN
}

// =============================================================================
// Encoding
// =============================================================================

/// Encodes one record.
///
/// Fails with [`TapeError::InvalidArgument`] for an empty payload or a
/// version outside `1..=MAX_VERSION`.
pub fn encode(payload: &[u8], version: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(encoded_len(payload.len()));
    encode_into(&mut buf, payload, version)?;
    Ok(buf)
}

/// Appends one encoded record to `buf`.
///
/// Nothing is written to `buf` when validation fails.
pub fn encode_into(buf: &mut Vec<u8>, payload: &[u8], version: u64) -> Result<()> {
    if payload.is_empty() {
        return Err(TapeError::invalid("payload must contain at least one byte"));
    }
    if version == 0 || version > MAX_VERSION {
        return Err(TapeError::invalid(format!(
            "version {version} outside 1..={MAX_VERSION}"
        )));
    }

    let length = format!("{:016x}", payload.len());
    let hash = STANDARD.encode(Sha1::digest(payload));

    buf.reserve(encoded_len(payload.len()));
    buf.extend_from_slice(HEADER_START);
    buf.extend_from_slice(length.as_bytes());
    buf.extend_from_slice(HEADER_END);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(FOOTER_START);
    buf.extend_from_slice(length.as_bytes());
    buf.extend_from_slice(format!("{version:016x}").as_bytes());
    buf.extend_from_slice(hash.as_bytes());
    buf.extend_from_slice(FOOTER_END);
    Ok(())
}

// =============================================================================
// Decoding
// =============================================================================

/// Decodes the next record from `reader`.
///
/// Returns `Ok(None)` when the reader is exactly at end of stream. A record
/// that starts but does not finish, has a damaged marker, mismatched lengths
/// or a wrong hash fails with [`TapeError::CorruptRecord`] carrying the
/// offset where the record starts.
pub fn read_record<R: Read + Seek>(reader: &mut R) -> Result<Option<TapeRecord>> {
    let offset = reader.stream_position()?;

    let mut start = [0u8; HEADER_START.len()];
    match fill(reader, &mut start)? {
        0 => return Ok(None),
        n if n < start.len() => return Err(TapeError::corrupt(offset, "truncated header")),
        _ => {}
    }
    if start != HEADER_START {
        return Err(TapeError::corrupt(offset, "header start marker mismatch"));
    }

    let length = read_hex(reader, offset, "header length")?;
    expect_marker(reader, offset, HEADER_END, "header end")?;

    if length == 0 {
        return Err(TapeError::corrupt(offset, "zero payload length"));
    }
    let length = usize::try_from(length)
        .map_err(|_| TapeError::corrupt(offset, "payload length exceeds address space"))?;

    // `take` keeps a damaged length field from pre-allocating a huge buffer.
    let mut data = Vec::new();
    reader.by_ref().take(length as u64).read_to_end(&mut data)?;
    if data.len() != length {
        return Err(TapeError::corrupt(offset, "truncated payload"));
    }

    expect_marker(reader, offset, FOOTER_START, "footer start")?;
    let footer_length = read_hex(reader, offset, "footer length")?;
    if footer_length != length as u64 {
        return Err(TapeError::corrupt(
            offset,
            format!("footer length {footer_length} does not match header length {length}"),
        ));
    }

    let version = read_hex(reader, offset, "version")?;
    if version == 0 || version > MAX_VERSION {
        return Err(TapeError::corrupt(offset, format!("version {version} out of range")));
    }

    let mut stored_hash = [0u8; HASH_LEN];
    read_field(reader, &mut stored_hash, offset, "hash")?;
    let computed = STANDARD.encode(Sha1::digest(&data));
    if computed.as_bytes() != stored_hash {
        return Err(TapeError::corrupt(offset, "hash mismatch"));
    }

    expect_marker(reader, offset, FOOTER_END, "footer end")?;

    Ok(Some(TapeRecord { version, data }))
}

/// Decodes exactly one record from a byte slice.
pub fn decode(bytes: &[u8]) -> Result<TapeRecord> {
    let mut cursor = io::Cursor::new(bytes);
    read_record(&mut cursor)?.ok_or_else(|| TapeError::corrupt(0, "no record present"))
}

/// Advances `reader` past `count` records without reading their payloads.
///
/// Only the header is checked and only the declared length is trusted; the
/// hash is not verified. Returns `Ok(false)` if end of stream was reached
/// before `count` records were skipped.
pub fn skip_records<R: Read + Seek>(reader: &mut R, count: u64) -> Result<bool> {
    let end = stream_len(reader)?;
    for _ in 0..count {
        let offset = reader.stream_position()?;
        if offset >= end {
            return Ok(false);
        }

        expect_marker(reader, offset, HEADER_START, "header start")?;
        let length = read_hex(reader, offset, "header length")?;
        expect_marker(reader, offset, HEADER_END, "header end")?;

        let next = (offset + HEADER_LEN as u64)
            .checked_add(length)
            .and_then(|n| n.checked_add(FOOTER_LEN as u64))
            .ok_or_else(|| TapeError::corrupt(offset, "payload length overflows stream"))?;
        if next > end {
            return Err(TapeError::corrupt(offset, "record extends past end of stream"));
        }
        reader.seek(SeekFrom::Start(next))?;
    }
    Ok(true)
}

/// Reads the version of the last record in the stream.
///
/// Seeks to the end, then back over the fixed-width tail. An empty stream is
/// version 0. Only the version field and the end marker are inspected.
pub fn read_version_from_tail<R: Read + Seek>(reader: &mut R) -> Result<u64> {
    let end = reader.seek(SeekFrom::End(0))?;
    if end == 0 {
        return Ok(0);
    }
    if end < (HEADER_LEN + 1 + FOOTER_LEN) as u64 {
        return Err(TapeError::corrupt(0, "stream shorter than one record"));
    }

    let offset = end - TAIL_LEN as u64;
    reader.seek(SeekFrom::Start(offset))?;
    let version = read_hex(reader, offset, "tail version")?;
    reader.seek(SeekFrom::Current(HASH_LEN as i64))?;
    expect_marker(reader, offset, FOOTER_END, "tail end")?;

    if version == 0 || version > MAX_VERSION {
        return Err(TapeError::corrupt(offset, format!("tail version {version} out of range")));
    }
    Ok(version)
}

fn stream_len<R: Seek>(reader: &mut R) -> io::Result<u64> {
    let pos = reader.stream_position()?;
    let end = reader.seek(SeekFrom::End(0))?;
    if pos != end {
        reader.seek(SeekFrom::Start(pos))?;
    }
    Ok(end)
}

/// Reads until `buf` is full or EOF, returning the byte count.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

fn read_field<R: Read>(reader: &mut R, buf: &mut [u8], offset: u64, name: &str) -> Result<()> {
    if fill(reader, buf)? < buf.len() {
        return Err(TapeError::corrupt(offset, format!("truncated {name}")));
    }
    Ok(())
}

fn expect_marker<R: Read>(reader: &mut R, offset: u64, marker: &[u8], name: &str) -> Result<()> {
    let mut buf = [0u8; 16];
    let buf = &mut buf[..marker.len()];
    read_field(reader, buf, offset, name)?;
    if buf != marker {
        return Err(TapeError::corrupt(offset, format!("{name} marker mismatch")));
    }
    Ok(())
}

fn read_hex<R: Read>(reader: &mut R, offset: u64, name: &str) -> Result<u64> {
    let mut buf = [0u8; HEX_LEN];
    read_field(reader, &mut buf, offset, name)?;
    parse_hex(&buf).ok_or_else(|| TapeError::corrupt(offset, format!("{name} is not lowercase hex")))
}

/// Strict parse: exactly 16 chars of `[0-9a-f]`.
fn parse_hex(field: &[u8; HEX_LEN]) -> Option<u64> {
    field.iter().try_fold(0u64, |acc, &b| {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            _ => return None,
        };
        Some((acc << 4) | u64::from(digit))
    })
}
