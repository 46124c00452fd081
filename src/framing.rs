//! Message boundaries on the byte stream between the headband and the
//! ground unit.
//!
//! A length-prefixed frame looks like this on the wire:
//!
//! ```text
//! +------+------+-------------------+------------------------+
//! | 0x42 | 0x50 | payload length    | payload                |
//! | 'B'  | 'P'  | u32, little-end.  | `length` bytes         |
//! +------+------+-------------------+------------------------+
//! ```
//!
//! The header is decoded with [nom]'s streaming parsers, so a header split
//! across two reads reports "incomplete" rather than an error. Anything that
//! does not start with the magic is skipped up to the next candidate magic.

use nom::{
    bytes::streaming::tag, number::streaming::le_u32, sequence::preceded, Err as NomErr, IResult,
};
use serde::{Deserialize, Serialize};
use std::{io, ops::Range};

/// Marks the start of every length-prefixed frame.
pub const MAGIC: &[u8] = b"BP";

/// Magic plus the `u32` payload length.
pub const HEADER_LEN: usize = 6;

/// How a byte stream is split into frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Framing {
    /// `b"BP"`, a little-endian `u32` length, then the payload
    #[default]
    LengthPrefixed,
    /// Everything received before the peer closes is one frame
    UntilClose,
}

/// Result of trying to pull one frame off the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A whole frame is buffered. `payload` indexes into the buffer, and
    /// `consumed` bytes should be removed once the payload is taken.
    Frame {
        /// Where the payload sits in the buffer
        payload: Range<usize>,
        /// Header plus payload length
        consumed: usize,
    },
    /// More bytes are needed before anything can be decided.
    Incomplete,
    /// The buffer does not start with a frame; drop `skip` bytes.
    Garbage {
        /// Bytes before the next candidate magic
        skip: usize,
    },
    /// The header announces a payload over the limit. Drop the `skip` header
    /// bytes, then `len` payload bytes as they arrive, before looking for the
    /// next magic.
    TooLarge {
        /// Announced payload length
        len: usize,
        /// Header length
        skip: usize,
    },
}

fn frame_header(input: &[u8]) -> IResult<&[u8], u32> {
    preceded(tag(MAGIC), le_u32)(input)
}

/// Inspects the front of `buf` for a frame no larger than `max_frame_bytes`.
pub fn decode_frame(buf: &[u8], max_frame_bytes: usize) -> Decoded {
    match frame_header(buf) {
        Ok((rest, len)) => {
            let len = len as usize;
            if len > max_frame_bytes {
                Decoded::TooLarge {
                    len,
                    skip: HEADER_LEN,
                }
            } else if rest.len() < len {
                Decoded::Incomplete
            } else {
                Decoded::Frame {
                    payload: HEADER_LEN..HEADER_LEN + len,
                    consumed: HEADER_LEN + len,
                }
            }
        }
        Err(NomErr::Incomplete(_)) => Decoded::Incomplete,
        Err(_) => Decoded::Garbage {
            skip: garbage_len(buf),
        },
    }
}

/// Length of the prefix of `buf` that cannot be the start of a frame. A
/// trailing partial magic is kept, since the rest of it may still arrive.
fn garbage_len(buf: &[u8]) -> usize {
    (1..buf.len())
        .find(|&i| {
            let tail = &buf[i..];
            let n = tail.len().min(MAGIC.len());
            tail[..n] == MAGIC[..n]
        })
        .unwrap_or(buf.len())
}

/// Wraps `payload` in a length-prefixed frame.
pub fn encode_frame(payload: &[u8]) -> io::Result<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload of {} bytes does not fit a frame", payload.len()),
        )
    })?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(MAGIC);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}
