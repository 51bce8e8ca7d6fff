//! Payload variants carried by a frame.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Wire tag identifying a payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    Binary = 1,
    String = 2,
    InitializationPacket = 3,
}

impl PayloadType {
    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PayloadType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(PayloadType::Binary),
            2 => Ok(PayloadType::String),
            3 => Ok(PayloadType::InitializationPacket),
            other => Err(ProtocolError::UnexpectedType(other)),
        }
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayloadType::Binary => "binary",
            PayloadType::String => "string",
            PayloadType::InitializationPacket => "initialization packet",
        };
        f.write_str(name)
    }
}

/// Handshake control message negotiating the liveness cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InitializationPacket {
    /// Requested interval between server pings. Zero selects the server default.
    pub ping_interval_ms: u16,
    /// Stored with the session; no retry policy consumes it yet.
    pub n_retries: u16,
}

impl InitializationPacket {
    /// Encoded body length: two big-endian u16 fields.
    pub const BODY_LEN: usize = 4;

    pub fn new(ping_interval_ms: u16, n_retries: u16) -> Self {
        Self {
            ping_interval_ms,
            n_retries,
        }
    }

    pub fn encode(&self) -> [u8; Self::BODY_LEN] {
        let mut buf = [0u8; Self::BODY_LEN];
        buf[0..2].copy_from_slice(&self.ping_interval_ms.to_be_bytes());
        buf[2..4].copy_from_slice(&self.n_retries.to_be_bytes());
        buf
    }

    /// Decode from a body that must be exactly [`Self::BODY_LEN`] bytes.
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() != Self::BODY_LEN {
            return Err(ProtocolError::MalformedBody {
                kind: PayloadType::InitializationPacket,
                length: body.len() as u32,
            });
        }
        Ok(Self {
            ping_interval_ms: u16::from_be_bytes([body[0], body[1]]),
            n_retries: u16::from_be_bytes([body[2], body[3]]),
        })
    }
}

/// A typed payload. Produced by decode and consumed right away by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Binary(Bytes),
    /// Text is not validated as UTF-8; it travels as raw bytes both ways.
    String(Bytes),
    InitializationPacket(InitializationPacket),
}

impl Payload {
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Payload::Binary(data.into())
    }

    pub fn string(text: impl Into<Bytes>) -> Self {
        Payload::String(text.into())
    }

    pub fn init(ping_interval_ms: u16, n_retries: u16) -> Self {
        Payload::InitializationPacket(InitializationPacket::new(ping_interval_ms, n_retries))
    }

    pub fn payload_type(&self) -> PayloadType {
        match self {
            Payload::Binary(_) => PayloadType::Binary,
            Payload::String(_) => PayloadType::String,
            Payload::InitializationPacket(_) => PayloadType::InitializationPacket,
        }
    }

    /// Length of the serialized body.
    pub fn body_len(&self) -> usize {
        match self {
            Payload::Binary(data) | Payload::String(data) => data.len(),
            Payload::InitializationPacket(_) => InitializationPacket::BODY_LEN,
        }
    }

    /// Append the serialized body to `buf`.
    pub fn write_body(&self, buf: &mut BytesMut) {
        match self {
            Payload::Binary(data) | Payload::String(data) => buf.put_slice(data),
            Payload::InitializationPacket(init) => buf.put_slice(&init.encode()),
        }
    }

    /// Build a payload from a fully read body.
    pub fn from_body(kind: PayloadType, body: Bytes) -> Result<Self, ProtocolError> {
        match kind {
            PayloadType::Binary => Ok(Payload::Binary(body)),
            PayloadType::String => Ok(Payload::String(body)),
            PayloadType::InitializationPacket => {
                InitializationPacket::decode(&body).map(Payload::InitializationPacket)
            }
        }
    }

    /// Raw body bytes for the data-carrying variants.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Binary(data) | Payload::String(data) => Some(data),
            Payload::InitializationPacket(_) => None,
        }
    }
}

/// Human-readable description for logs. Never parsed.
impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Binary(data) => write!(f, "binary({} bytes)", data.len()),
            Payload::String(text) => write!(f, "string({:?})", String::from_utf8_lossy(text)),
            Payload::InitializationPacket(init) => write!(
                f,
                "init(ping_interval_ms={}, n_retries={})",
                init.ping_interval_ms, init.n_retries
            ),
        }
    }
}
