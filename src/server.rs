//! TCP server for tether connections.
//!
//! Accepts incoming connections and hands them to the worker pool, which
//! runs the handshake and session for each one.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::pool::{Accepted, WorkerPool};

/// Pause after a failed accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server instance
pub struct Server {
    config: Config,
    listener: TcpListener,
    cancel: CancellationToken,
}

impl Server {
    /// Bind the listening socket. Must be called within a tokio runtime.
    pub fn bind(config: Config) -> io::Result<Self> {
        let addr = resolve(&config.listen)?;
        let backlog = i32::try_from(config.max_connections).unwrap_or(i32::MAX);
        let listener = bind_listener(addr, backlog)?;

        Ok(Server {
            config,
            listener,
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accept connections until the shutdown token is cancelled, then close
    /// everything still queued and wait for in-flight sessions to end.
    pub async fn run(self) -> io::Result<()> {
        info!(
            address = %self.local_addr()?,
            workers = self.config.workers,
            max_connections = self.config.max_connections,
            "Server listening"
        );

        let pool: WorkerPool<TcpStream> = WorkerPool::start(
            self.config.workers,
            self.config.max_connections,
            self.config.session(),
            self.cancel.clone(),
        );

        loop {
            let accepted = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");
                    let conn = Accepted::new(stream, addr.to_string());
                    if let Err(rejected) = pool.submit(conn).await {
                        debug!(peer = %rejected.peer, "Shutting down, dropping connection");
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    if !backoff(&self.cancel).await {
                        break;
                    }
                }
            }
        }

        info!("Listener stopped");
        drop(self.listener);
        pool.shutdown().await;
        pool.join().await;
        info!("Server stopped");
        Ok(())
    }
}

/// Wait before the next accept. Errors such as EMFILE persist, so retrying
/// at once would spin. Returns `false` if shutdown was requested meanwhile.
async fn backoff(cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = time::sleep(ACCEPT_BACKOFF) => true,
    }
}

fn resolve(listen: &str) -> io::Result<SocketAddr> {
    listen.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("listen address '{listen}' did not resolve"),
        )
    })
}

fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    TcpListener::from_std(socket.into())
}
