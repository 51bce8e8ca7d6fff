//! Error types for the wire protocol and connection sessions.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::protocol::PayloadType;

/// The part of a frame that was being read when a transport error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Version,
    Type,
    Length,
    Body,
    /// The frame as a whole, used when a deadline expires mid-read.
    Frame,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Field::Version => "version",
            Field::Type => "type",
            Field::Length => "length",
            Field::Body => "body",
            Field::Frame => "frame",
        };
        f.write_str(name)
    }
}

/// Every way a connection can fail. All variants are connection-fatal.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The version byte did not match the configured protocol version.
    #[error("payload does not match expected version: expected {expected}, found {found}")]
    VersionMismatch { expected: u8, found: u8 },

    /// The type byte does not name a known payload kind.
    #[error("could not decode packet: unexpected payload type {0}")]
    UnexpectedType(u8),

    /// The declared body length exceeds the maximum payload size.
    #[error("maximum payload size exceeded: {length} > {max}")]
    PayloadTooLarge { length: u32, max: u32 },

    /// The body length is invalid for the declared payload kind.
    #[error("malformed {kind} body of {length} bytes")]
    MalformedBody { kind: PayloadType, length: u32 },

    /// Reading a frame failed, including deadline expiry.
    #[error("failed to read frame {field}: {source}")]
    Transport {
        field: Field,
        #[source]
        source: io::Error,
    },

    /// Writing a response failed.
    #[error("failed to write response: {0}")]
    Write(#[source] io::Error),

    /// The first frame on a connection was not an initialization packet.
    #[error("expected an initialization packet during handshake, received {0}")]
    UnexpectedHandshakePayload(PayloadType),
}

impl ProtocolError {
    pub(crate) fn transport(field: Field, source: io::Error) -> Self {
        ProtocolError::Transport { field, source }
    }

    pub(crate) fn deadline_exceeded() -> Self {
        ProtocolError::Transport {
            field: Field::Frame,
            source: io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded"),
        }
    }

    /// True when the peer closed the connection cleanly between frames.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ProtocolError::Transport { field: Field::Version, source }
                if source.kind() == io::ErrorKind::UnexpectedEof
        )
    }

    /// True when the per-connection deadline expired.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProtocolError::Transport { source, .. } if source.kind() == io::ErrorKind::TimedOut
        )
    }
}
