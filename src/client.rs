//! Minimal async client for the tether protocol.

use std::io;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

use crate::error::{Field, ProtocolError};
use crate::protocol::{self, Incoming, ParseResult, Payload, ProtocolSpec};

/// Read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

pub struct Client {
    stream: TcpStream,
    buffer: BytesMut,
    spec: ProtocolSpec,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        debug!(peer = %stream.peer_addr()?, "Connected");
        Ok(Self::with_protocol(stream, ProtocolSpec::V1))
    }

    pub fn with_protocol(stream: TcpStream, spec: ProtocolSpec) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            spec,
        }
    }

    /// Send the initialization packet that opens every connection.
    pub async fn handshake(&mut self, ping_interval_ms: u16, n_retries: u16) -> io::Result<()> {
        self.send(&Payload::init(ping_interval_ms, n_retries)).await
    }

    pub async fn send(&mut self, payload: &Payload) -> io::Result<()> {
        protocol::write_payload(&self.spec, &mut self.stream, payload).await
    }

    /// Receive the next ping or frame. `None` means the server closed the
    /// connection cleanly.
    pub async fn recv(&mut self) -> Result<Option<Incoming>, ProtocolError> {
        loop {
            match protocol::parse(&self.spec, &self.buffer) {
                ParseResult::Complete(incoming, consumed) => {
                    self.buffer.advance(consumed);
                    return Ok(Some(incoming));
                }
                ParseResult::Error(e) => return Err(e),
                ParseResult::Incomplete => {}
            }

            let n = self
                .stream
                .read_buf(&mut self.buffer)
                .await
                .map_err(|e| ProtocolError::transport(Field::Frame, e))?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::transport(
                    Field::Frame,
                    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-frame"),
                ));
            }
        }
    }

    /// Receive the next frame, skipping pings.
    pub async fn recv_payload(&mut self) -> Result<Option<Payload>, ProtocolError> {
        loop {
            match self.recv().await? {
                Some(Incoming::Ping) => continue,
                Some(Incoming::Payload(payload)) => return Ok(Some(payload)),
                None => return Ok(None),
            }
        }
    }

    pub async fn close(mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}
