//! Buffer-oriented frame parser.
//!
//! Used by readers that accumulate bytes in a buffer rather than reading a
//! stream field by field. Besides frames it recognizes the raw `ping`
//! liveness marker the server writes between frames.

use bytes::Bytes;

use super::{Payload, PayloadType, ProtocolSpec, HEADER_SIZE, PING};
use crate::error::ProtocolError;

/// Something received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// Unframed liveness marker.
    Ping,
    /// A complete frame.
    Payload(Payload),
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// Parsed item with bytes consumed.
    Complete(Incoming, usize),
    /// Need more data.
    Incomplete,
    /// Protocol error; the stream cannot be resynchronized.
    Error(ProtocolError),
}

/// Parse one item from the start of `input`.
pub fn parse(spec: &ProtocolSpec, input: &[u8]) -> ParseResult {
    let Some(&first) = input.first() else {
        return ParseResult::Incomplete;
    };

    if first != spec.version {
        return parse_ping(spec, input);
    }

    if input.len() < HEADER_SIZE {
        // Surface a bad type byte as early as possible.
        if let Some(&tag) = input.get(1) {
            if let Err(e) = PayloadType::try_from(tag) {
                return ParseResult::Error(e);
            }
        }
        return ParseResult::Incomplete;
    }

    let kind = match PayloadType::try_from(input[1]) {
        Ok(kind) => kind,
        Err(e) => return ParseResult::Error(e),
    };
    let length = u32::from_be_bytes([input[2], input[3], input[4], input[5]]);
    if let Err(e) = spec.check_length(kind, length) {
        return ParseResult::Error(e);
    }

    let total = HEADER_SIZE + length as usize;
    if input.len() < total {
        return ParseResult::Incomplete;
    }

    let body = Bytes::copy_from_slice(&input[HEADER_SIZE..total]);
    match Payload::from_body(kind, body) {
        Ok(payload) => ParseResult::Complete(Incoming::Payload(payload), total),
        Err(e) => ParseResult::Error(e),
    }
}

fn parse_ping(spec: &ProtocolSpec, input: &[u8]) -> ParseResult {
    if input.starts_with(PING) {
        ParseResult::Complete(Incoming::Ping, PING.len())
    } else if PING.starts_with(input) {
        ParseResult::Incomplete
    } else {
        ParseResult::Error(ProtocolError::VersionMismatch {
            expected: spec.version,
            found: input[0],
        })
    }
}
