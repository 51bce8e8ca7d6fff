//! Connection session: handshake, read loop and response dispatch.
//!
//! A session moves through `Handshaking → Active → Closed`. The first frame
//! must be an initialization packet; anything else closes the connection
//! without a response. Once active, every decoded frame resets the liveness
//! timer, extends the I/O deadline and receives a canned acknowledgement.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::ProtocolError;
use crate::liveness::{effective_interval, LivenessManager, Reset, SharedWriter, Stopped};
use crate::protocol::{self, InitializationPacket, Payload, ProtocolSpec};

/// Acknowledgement for binary payloads.
pub const BINARY_RESPONSE: &str = "Give me all them bytes!";

/// Acknowledgement for string payloads.
pub const STRING_RESPONSE: &str = "Give me all them strings!";

/// Acknowledgement for an initialization packet received after the handshake.
pub const REPEATED_INIT_RESPONSE: &str =
    "Hey Ho Sailor, got an InitializationPacketType after connection has been initialized, I don't know how to respond to this";

/// Capacity of the reset channel between a session and its liveness task.
const RESET_CHANNEL_CAPACITY: usize = 8;

/// Settings shared by every session the server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub protocol: ProtocolSpec,
    /// Ping interval used when the peer asks for zero, and the base of the
    /// deadline grace window.
    pub default_ping_interval: Duration,
}

impl SessionConfig {
    pub fn new(default_ping_interval: Duration) -> Self {
        Self {
            protocol: ProtocolSpec::V1,
            default_ping_interval,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Read timeout for a connection pinging every `interval`.
///
/// Always at least 1.5x the default and always longer than the active ping
/// interval.
pub fn grace_window(interval: Duration, default: Duration) -> Duration {
    interval.max(default) + default / 2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Active,
    Closed,
}

/// One connection, owned by the worker running it.
pub struct Session<S> {
    peer: String,
    config: SessionConfig,
    state: SessionState,
    reader: ReadHalf<S>,
    writer: SharedWriter<WriteHalf<S>>,
    ping_interval: Duration,
    n_retries: u16,
    deadline: Instant,
    resets: Option<mpsc::Sender<Reset>>,
    cancel: CancellationToken,
    liveness: Option<JoinHandle<Stopped>>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S, peer: impl Into<String>, config: SessionConfig) -> Self {
        let (reader, writer) = split(stream);
        Self {
            peer: peer.into(),
            config,
            state: SessionState::Handshaking,
            reader,
            writer: Arc::new(Mutex::new(writer)),
            ping_interval: config.default_ping_interval,
            n_retries: 0,
            deadline: Instant::now() + Self::idle_window(&config),
            resets: None,
            cancel: CancellationToken::new(),
            liveness: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Retry count the peer announced during the handshake.
    pub fn n_retries(&self) -> u16 {
        self.n_retries
    }

    /// Drive the session to completion and release the connection.
    ///
    /// A peer that disconnects between frames ends the session cleanly.
    pub async fn run(mut self) -> Result<(), ProtocolError> {
        let result = self.drive().await;
        self.close().await;

        match result {
            Err(e) if e.is_disconnect() => {
                debug!(peer = %self.peer, "Connection closed by peer");
                Ok(())
            }
            other => other,
        }
    }

    async fn drive(&mut self) -> Result<(), ProtocolError> {
        let init = self.handshake().await?;
        self.activate(init);
        self.read_loop().await
    }

    /// Wait for the initialization packet. No retries, no defaults.
    async fn handshake(&mut self) -> Result<InitializationPacket, ProtocolError> {
        match self.read_payload().await? {
            Payload::InitializationPacket(init) => {
                debug!(
                    peer = %self.peer,
                    ping_interval_ms = init.ping_interval_ms,
                    n_retries = init.n_retries,
                    "Handshake complete"
                );
                Ok(init)
            }
            other => Err(ProtocolError::UnexpectedHandshakePayload(other.payload_type())),
        }
    }

    fn activate(&mut self, init: InitializationPacket) {
        let default = self.config.default_ping_interval;
        self.ping_interval = effective_interval(
            Duration::from_millis(u64::from(init.ping_interval_ms)),
            default,
        );
        self.n_retries = init.n_retries;
        self.deadline = Instant::now() + grace_window(self.ping_interval, default);

        let (tx, rx) = mpsc::channel(RESET_CHANNEL_CAPACITY);
        let manager = LivenessManager::new(
            Arc::clone(&self.writer),
            self.ping_interval,
            default,
            rx,
            self.cancel.clone(),
        );
        self.resets = Some(tx);
        self.liveness = Some(tokio::spawn(manager.run()));
        self.state = SessionState::Active;

        debug!(
            peer = %self.peer,
            interval_ms = self.ping_interval.as_millis() as u64,
            "Session active"
        );
    }

    async fn read_loop(&mut self) -> Result<(), ProtocolError> {
        loop {
            let payload = self.read_payload().await?;
            trace!(peer = %self.peer, %payload, "Received payload");

            self.suppress_ping();
            self.deadline = Instant::now() + Self::idle_window(&self.config);
            self.respond(payload).await?;
        }
    }

    async fn read_payload(&mut self) -> Result<Payload, ProtocolError> {
        let spec = self.config.protocol;
        match time::timeout_at(self.deadline, protocol::decode(&spec, &mut self.reader)).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::deadline_exceeded()),
        }
    }

    /// Traffic was just seen, so the next ping can wait a full interval.
    fn suppress_ping(&self) {
        if let Some(resets) = &self.resets {
            // A full channel already holds a pending reset with the same effect.
            let _ = resets.try_send(Reset::Suppress);
        }
    }

    async fn respond(&mut self, payload: Payload) -> Result<(), ProtocolError> {
        let response = match payload {
            Payload::InitializationPacket(init) => {
                warn!(
                    peer = %self.peer,
                    ping_interval_ms = init.ping_interval_ms,
                    "Initialization packet received after handshake"
                );
                self.renegotiate(init).await;
                REPEATED_INIT_RESPONSE
            }
            Payload::Binary(_) => BINARY_RESPONSE,
            Payload::String(_) => STRING_RESPONSE,
        };

        let spec = self.config.protocol;
        let writer = &self.writer;
        let write = async move {
            let mut writer = writer.lock().await;
            protocol::write_payload(&spec, &mut *writer, &Payload::string(response)).await
        };
        match time::timeout_at(self.deadline, write).await {
            Ok(written) => written.map_err(ProtocolError::Write),
            Err(_) => Err(ProtocolError::deadline_exceeded()),
        }
    }

    /// A repeated initialization packet with a non-zero interval changes the
    /// ping cadence for the rest of the session.
    ///
    /// Only the ping cadence changes. The read deadline keeps following the
    /// default interval's grace window after every frame.
    async fn renegotiate(&mut self, init: InitializationPacket) {
        if init.ping_interval_ms == 0 {
            return;
        }
        self.ping_interval = Duration::from_millis(u64::from(init.ping_interval_ms));
        if let Some(resets) = &self.resets {
            let _ = resets.send(Reset::Interval(self.ping_interval)).await;
        }
    }

    /// Stop the liveness task and release the connection. Idempotent.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.cancel.cancel();
        self.resets = None;

        if let Some(handle) = self.liveness.take() {
            match handle.await {
                Ok(stopped) => trace!(peer = %self.peer, ?stopped, "Liveness stopped"),
                Err(e) => warn!(peer = %self.peer, error = %e, "Liveness task failed"),
            }
        }

        let _ = self.writer.lock().await.shutdown().await;
    }

    fn idle_window(config: &SessionConfig) -> Duration {
        grace_window(config.default_ping_interval, config.default_ping_interval)
    }
}

impl<S> Drop for Session<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, encode, PING};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn config() -> SessionConfig {
        SessionConfig::new(Duration::from_secs(30))
    }

    async fn send(client: &mut DuplexStream, payload: Payload) {
        client
            .write_all(&encode(&ProtocolSpec::V1, &payload))
            .await
            .unwrap();
    }

    fn spawn_session(
        config: SessionConfig,
    ) -> (DuplexStream, JoinHandle<Result<(), ProtocolError>>) {
        let (server, client) = duplex(1024);
        let session = Session::new(server, "test-peer", config);
        (client, tokio::spawn(session.run()))
    }

    #[test]
    fn test_grace_window() {
        let default = Duration::from_secs(30);
        assert_eq!(grace_window(Duration::from_secs(1), default), Duration::from_secs(45));
        assert_eq!(grace_window(default, default), Duration::from_secs(45));
        assert_eq!(grace_window(Duration::from_secs(60), default), Duration::from_secs(75));
    }

    #[tokio::test]
    async fn test_handshake_rejects_binary_without_response() {
        let (mut client, handle) = spawn_session(config());
        send(&mut client, Payload::binary(&b"hello"[..])).await;

        match handle.await.unwrap() {
            Err(ProtocolError::UnexpectedHandshakePayload(kind)) => {
                assert_eq!(kind, protocol::PayloadType::Binary);
            }
            other => panic!("unexpected: {:?}", other),
        }

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_handshake_rejects_string() {
        let (mut client, handle) = spawn_session(config());
        send(&mut client, Payload::string("hello")).await;

        assert!(matches!(
            handle.await.unwrap(),
            Err(ProtocolError::UnexpectedHandshakePayload(
                protocol::PayloadType::String
            ))
        ));
    }

    #[tokio::test]
    async fn test_handshake_decode_error_terminates() {
        let (mut client, handle) = spawn_session(config());
        client.write_all(&[9, 9, 9]).await.unwrap();

        assert!(matches!(
            handle.await.unwrap(),
            Err(ProtocolError::VersionMismatch { found: 9, .. })
        ));
    }

    #[tokio::test]
    async fn test_string_acknowledged_after_handshake() {
        let (mut client, handle) = spawn_session(config());
        send(&mut client, Payload::init(300, 10)).await;
        send(&mut client, Payload::string("hello")).await;

        let response = decode(&ProtocolSpec::V1, &mut client).await.unwrap();
        assert_eq!(response, Payload::string(STRING_RESPONSE));

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_binary_and_repeated_init_acknowledged() {
        let (mut client, handle) = spawn_session(config());
        send(&mut client, Payload::init(5000, 1)).await;
        send(&mut client, Payload::binary(vec![1u8, 2, 3])).await;
        send(&mut client, Payload::init(5000, 1)).await;

        let first = decode(&ProtocolSpec::V1, &mut client).await.unwrap();
        assert_eq!(first, Payload::string(BINARY_RESPONSE));
        let second = decode(&ProtocolSpec::V1, &mut client).await.unwrap();
        assert_eq!(second, Payload::string(REPEATED_INIT_RESPONSE));

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_decode_error_after_handshake_ends_session() {
        let (mut client, handle) = spawn_session(config());
        send(&mut client, Payload::init(5000, 1)).await;
        client.write_all(&[1, 77, 0, 0, 0, 0]).await.unwrap();

        assert!(matches!(
            handle.await.unwrap(),
            Err(ProtocolError::UnexpectedType(77))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_after_handshake() {
        let (mut client, _handle) = spawn_session(config());
        send(&mut client, Payload::init(100, 0)).await;
        let start = Instant::now();

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, PING);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_millis(150));

        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, PING);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_peer_times_out() {
        let config = SessionConfig::new(Duration::from_millis(200));
        let (mut client, handle) = spawn_session(config);
        send(&mut client, Payload::init(100, 0)).await;

        // Drain pings so the liveness writes never block.
        tokio::spawn(async move {
            let mut sink = Vec::new();
            let _ = client.read_to_end(&mut sink).await;
        });

        let start = Instant::now();
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= grace_window(Duration::from_millis(100), config.default_ping_interval));
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_extends_deadline_and_suppresses_pings() {
        // Initial deadline is 300ms and pings are due every 100ms.
        let config = SessionConfig::new(Duration::from_millis(200));
        let (mut client, handle) = spawn_session(config);
        send(&mut client, Payload::init(100, 0)).await;

        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(800) {
            time::sleep(Duration::from_millis(80)).await;
            send(&mut client, Payload::string("hello")).await;
            // A ping ahead of the response fails to decode as a frame.
            let response = decode(&ProtocolSpec::V1, &mut client).await.unwrap();
            assert_eq!(response, Payload::string(STRING_RESPONSE));
        }

        let mut byte = [0u8; 1];
        let pending = time::timeout(Duration::from_millis(50), client.read(&mut byte)).await;
        assert!(pending.is_err(), "unexpected bytes after last response");
        assert!(!handle.is_finished());

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out_during_handshake() {
        let config = SessionConfig::new(Duration::from_millis(200));
        let (_client, handle) = spawn_session(config);

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (server, _client) = duplex(64);
        let mut session = Session::new(server, "test-peer", config());
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_n_retries_is_stored() {
        let (server, mut client) = duplex(64);
        let mut session = Session::new(server, "test-peer", config());
        send(&mut client, Payload::init(1000, 10)).await;

        let init = session.handshake().await.unwrap();
        session.activate(init);
        assert_eq!(session.n_retries(), 10);
        assert_eq!(session.state(), SessionState::Active);
        session.close().await;
    }
}
