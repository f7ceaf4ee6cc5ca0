// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire protocol: multi-part messages over a byte stream.
//!
//! # Framing
//!
//! ```text
//! [flags: u8][length: u32 LE][bytes: length]
//! ```
//!
//! Bit 0 of `flags` ([`FLAG_MORE`]) means another frame of the same message
//! follows. A message ends with the first frame whose bit is clear. Empty
//! frames are legal and carry meaning (the `Append` terminator).
//!
//! # Requests
//!
//! | Frames | Reply |
//! |--------|-------|
//! | `"Version"`, name | 8-byte LE signed version |
//! | `"Append"`, name, (expected 8B, payload)*, `""` | 8-byte LE signed last accepted version, or 0 |
//! | anything else | `"UNKNOWN"` |
//!
//! Failures while handling a request are answered with a single text frame
//! starting with [`ERROR_PREFIX`].

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TapeError};
use crate::types::{TapeRecord, MAX_VERSION};

pub const FRAME_HEADER_LEN: usize = 5;
pub const FLAG_MORE: u8 = 0x01;

/// Default upper bound on a single frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Upper bound on frames in one message. A full catch-up batch needs about
/// two frames per record.
pub const MAX_MESSAGE_FRAMES: usize = 4096;

/// A whole message, frame headers included, may be this many times
/// `max_frame_bytes`.
pub const MESSAGE_SIZE_FACTOR: usize = 4;

fn max_message_bytes(max_frame_bytes: usize) -> usize {
    max_frame_bytes.saturating_mul(MESSAGE_SIZE_FACTOR)
}

pub const CMD_VERSION: &str = "Version";
pub const CMD_APPEND: &str = "Append";
pub const REPLY_UNKNOWN: &[u8] = b"UNKNOWN";
pub const ERROR_PREFIX: &str = "ERROR: ";

/// One multi-part message.
pub type Message = Vec<Vec<u8>>;

// =============================================================================
// Framing
// =============================================================================

/// Reads one message.
///
/// Returns `Ok(None)` if the peer closed the connection between messages.
/// EOF inside a message is an I/O error. Messages over
/// [`MAX_MESSAGE_FRAMES`] frames or over `MESSAGE_SIZE_FACTOR` times
/// `max_frame_bytes` in total are protocol errors.
pub async fn read_message<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let max_total = max_message_bytes(max_frame_bytes);
    let mut frames = Vec::new();
    let mut total = 0usize;
    loop {
        if frames.len() >= MAX_MESSAGE_FRAMES {
            return Err(TapeError::Protocol(format!(
                "message has more than {MAX_MESSAGE_FRAMES} frames"
            )));
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        let first = reader.read(&mut header[..1]).await?;
        if first == 0 {
            if frames.is_empty() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "message truncated between frames",
            )
            .into());
        }
        reader.read_exact(&mut header[1..]).await?;

        let flags = header[0];
        if flags & !FLAG_MORE != 0 {
            return Err(TapeError::Protocol(format!("unknown frame flags {flags:#04x}")));
        }
        let length = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if length > max_frame_bytes {
            return Err(TapeError::Protocol(format!(
                "frame too large: max {max_frame_bytes} got {length}"
            )));
        }
        total = total.saturating_add(FRAME_HEADER_LEN + length);
        if total > max_total {
            return Err(TapeError::Protocol(format!(
                "message too large: max {max_total} bytes"
            )));
        }

        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;
        frames.push(body);

        if flags & FLAG_MORE == 0 {
            return Ok(Some(frames));
        }
    }
}

/// Encodes `frames` as one message.
pub fn encode_message<F: AsRef<[u8]>>(frames: &[F], max_frame_bytes: usize) -> Result<Vec<u8>> {
    if frames.is_empty() {
        return Err(TapeError::Protocol("message must have at least one frame".into()));
    }
    if frames.len() > MAX_MESSAGE_FRAMES {
        return Err(TapeError::Protocol(format!(
            "message has more than {MAX_MESSAGE_FRAMES} frames"
        )));
    }
    let total: usize = frames
        .iter()
        .map(|f| FRAME_HEADER_LEN + f.as_ref().len())
        .sum();
    if total > max_message_bytes(max_frame_bytes) {
        return Err(TapeError::Protocol(format!(
            "message too large: max {} bytes got {total}",
            max_message_bytes(max_frame_bytes)
        )));
    }
    let mut buf = Vec::with_capacity(total);
    let last = frames.len() - 1;
    for (i, frame) in frames.iter().enumerate() {
        let bytes = frame.as_ref();
        if bytes.len() > max_frame_bytes {
            return Err(TapeError::Protocol(format!(
                "frame too large: max {max_frame_bytes} got {}",
                bytes.len()
            )));
        }
        let length = u32::try_from(bytes.len())
            .map_err(|_| TapeError::Protocol("frame length exceeds u32".into()))?;
        buf.push(if i < last { FLAG_MORE } else { 0 });
        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(bytes);
    }
    Ok(buf)
}

/// Writes `frames` as one message and flushes.
pub async fn write_message<W, F>(writer: &mut W, frames: &[F], max_frame_bytes: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
    F: AsRef<[u8]>,
{
    let buf = encode_message(frames, max_frame_bytes)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

// =============================================================================
// Requests
// =============================================================================

/// A parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Version { stream: String },
    Append { stream: String, entries: Vec<AppendEntry> },
    Unknown { command: String },
}

impl Request {
    /// Command label for logs and metrics.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Version { .. } => "version",
            Self::Append { .. } => "append",
            Self::Unknown { .. } => "unknown",
        }
    }
}

/// One `(expected_version, payload)` pair of an `Append` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendEntry {
    pub expected_version: u64,
    pub payload: Vec<u8>,
}

/// Parses a request message.
///
/// An unrecognised command token is not an error; malformed frames of a
/// recognised command are [`TapeError::Protocol`].
pub fn parse_request(message: &[Vec<u8>]) -> Result<Request> {
    let mut frames = message.iter();
    let command = match frames.next() {
        Some(frame) => String::from_utf8_lossy(frame).into_owned(),
        None => return Err(TapeError::Protocol("empty message".into())),
    };

    match command.as_str() {
        CMD_VERSION => {
            let stream = stream_name(frames.next())?;
            Ok(Request::Version { stream })
        }
        CMD_APPEND => {
            let stream = stream_name(frames.next())?;
            let mut entries = Vec::new();
            while let Some(frame) = frames.next() {
                if frame.is_empty() {
                    break;
                }
                let expected_version = decode_version(frame)?;
                let payload = frames.next().ok_or_else(|| {
                    TapeError::Protocol(format!(
                        "missing payload after expected version {expected_version}"
                    ))
                })?;
                entries.push(AppendEntry {
                    expected_version,
                    payload: payload.clone(),
                });
            }
            Ok(Request::Append { stream, entries })
        }
        _ => Ok(Request::Unknown { command }),
    }
}

fn stream_name(frame: Option<&Vec<u8>>) -> Result<String> {
    let frame = frame.ok_or_else(|| TapeError::Protocol("missing stream name".into()))?;
    String::from_utf8(frame.clone())
        .map_err(|_| TapeError::Protocol("stream name is not valid UTF-8".into()))
}

/// `Version` request for `stream`.
pub fn version_request(stream: &str) -> Message {
    vec![CMD_VERSION.as_bytes().to_vec(), stream.as_bytes().to_vec()]
}

/// `Append` request that applies each record only if the remote is exactly
/// one version behind it.
pub fn append_request(stream: &str, records: &[TapeRecord]) -> Message {
    let mut frames = Vec::with_capacity(3 + records.len() * 2);
    frames.push(CMD_APPEND.as_bytes().to_vec());
    frames.push(stream.as_bytes().to_vec());
    for record in records {
        frames.push(encode_version(record.version.saturating_sub(1)));
        frames.push(record.data.clone());
    }
    frames.push(Vec::new());
    frames
}

// =============================================================================
// Replies
// =============================================================================

/// 8-byte little-endian signed encoding of a version.
pub fn encode_version(version: u64) -> Vec<u8> {
    (version.min(MAX_VERSION) as i64).to_le_bytes().to_vec()
}

/// Parses an 8-byte version field.
pub fn decode_version(frame: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = frame.try_into().map_err(|_| {
        TapeError::Protocol(format!("expected 8-byte version, got {} bytes", frame.len()))
    })?;
    let value = i64::from_le_bytes(raw);
    u64::try_from(value).map_err(|_| TapeError::Protocol(format!("negative version {value}")))
}

pub fn error_reply(message: &str) -> Vec<u8> {
    format!("{ERROR_PREFIX}{message}").into_bytes()
}

/// Interprets a reply to `Version` or `Append`.
pub fn parse_version_reply(message: &[Vec<u8>]) -> Result<u64> {
    let [frame] = message else {
        return Err(TapeError::Protocol(format!(
            "expected single-frame reply, got {} frames",
            message.len()
        )));
    };
    if frame.starts_with(ERROR_PREFIX.as_bytes()) {
        return Err(TapeError::Protocol(format!(
            "remote error: {}",
            String::from_utf8_lossy(&frame[ERROR_PREFIX.len()..])
        )));
    }
    if frame.as_slice() == REPLY_UNKNOWN {
        return Err(TapeError::Protocol("remote did not recognise command".into()));
    }
    decode_version(frame)
}
