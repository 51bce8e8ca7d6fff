//! Length-prefixed binary framing.
//!
//! Every frame carries exactly one typed payload behind a fixed 6-byte
//! header:
//!
//! ```text
//! ┌─────────┬────────┬──────────────┬────────────────┐
//! │ Version │ Type   │ Length       │ Body           │
//! │ 1 byte  │ 1 byte │ uint32 BE    │ Length bytes   │
//! └─────────┴────────┴──────────────┴────────────────┘
//! ```
//!
//! Payload types:
//! - `1`: binary, opaque bytes
//! - `2`: string, text carried as raw bytes
//! - `3`: initialization packet, `uint16 ping_interval_ms` + `uint16 n_retries`
//!
//! Liveness pings are sent outside the framing as the literal bytes `ping`.
//! [`parser`] recognizes them on the receiving side.

pub mod codec;
pub mod parser;
pub mod payload;

pub use codec::{decode, encode, write_payload};
pub use parser::{parse, Incoming, ParseResult};
pub use payload::{InitializationPacket, Payload, PayloadType};

use crate::error::ProtocolError;

/// The single supported protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum body length accepted by the decoder (10 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 10 << 20;

/// Header size in bytes: version, type and length.
pub const HEADER_SIZE: usize = 6;

/// Raw liveness marker written by the server between frames.
pub const PING: &[u8] = b"ping";

/// Immutable description of the protocol a codec speaks.
///
/// Passed explicitly to the codec so that several descriptions can coexist,
/// for example a test peer speaking a different version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSpec {
    pub version: u8,
    pub max_payload_size: u32,
}

impl ProtocolSpec {
    /// Version 1 with the 10 MiB payload cap.
    pub const V1: ProtocolSpec = ProtocolSpec::new(PROTOCOL_VERSION, MAX_PAYLOAD_SIZE);

    pub const fn new(version: u8, max_payload_size: u32) -> Self {
        Self {
            version,
            max_payload_size,
        }
    }

    pub(crate) fn check_version(&self, found: u8) -> Result<(), ProtocolError> {
        if found == self.version {
            Ok(())
        } else {
            Err(ProtocolError::VersionMismatch {
                expected: self.version,
                found,
            })
        }
    }

    /// Validate a declared body length before any buffer is allocated for it.
    pub(crate) fn check_length(&self, kind: PayloadType, length: u32) -> Result<(), ProtocolError> {
        if length > self.max_payload_size {
            return Err(ProtocolError::PayloadTooLarge {
                length,
                max: self.max_payload_size,
            });
        }
        if kind == PayloadType::InitializationPacket
            && length as usize != InitializationPacket::BODY_LEN
        {
            return Err(ProtocolError::MalformedBody { kind, length });
        }
        Ok(())
    }
}

impl Default for ProtocolSpec {
    fn default() -> Self {
        Self::V1
    }
}
