//! Bounded worker pool.
//!
//! A fixed set of workers pull accepted connections from a shared bounded
//! queue and run one session at a time. Submitting blocks while the queue is
//! full, which pushes backpressure onto the accept loop.
//!
//! Shutdown closes the queue and drops every connection that no worker has
//! claimed yet. Sessions already running are left to end on their own read
//! error or deadline.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::{Session, SessionConfig};

/// An accepted connection waiting for a worker.
pub struct Accepted<S> {
    pub stream: S,
    pub peer: String,
}

impl<S> Accepted<S> {
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream,
            peer: peer.into(),
        }
    }
}

type Queue<S> = Arc<Mutex<mpsc::Receiver<Accepted<S>>>>;

pub struct WorkerPool<S> {
    sender: mpsc::Sender<Accepted<S>>,
    queue: Queue<S>,
    capacity: usize,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl<S> WorkerPool<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Spawn `workers` workers sharing a queue of `capacity` connections.
    ///
    /// Cancelling `cancel` stops workers from claiming new connections.
    pub fn start(
        workers: usize,
        capacity: usize,
        config: SessionConfig,
        cancel: CancellationToken,
    ) -> Self {
        assert!(workers > 0, "worker pool needs at least one worker");
        assert!(capacity > 0, "worker queue needs a non-zero capacity");

        let (sender, receiver) = mpsc::channel(capacity);
        let queue = Arc::new(Mutex::new(receiver));

        let workers = (0..workers)
            .map(|_| {
                let worker = Worker {
                    id: Uuid::now_v7(),
                    queue: Arc::clone(&queue),
                    config,
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        Self {
            sender,
            queue,
            capacity,
            workers,
            cancel,
        }
    }

    /// Queue a connection, waiting while the queue is full.
    ///
    /// Once the pool is shutting down the connection is handed back so the
    /// caller can close it.
    pub async fn submit(&self, conn: Accepted<S>) -> Result<(), Accepted<S>> {
        let permit = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(conn),
            permit = self.sender.reserve() => permit,
        };

        match permit {
            Ok(permit) => {
                permit.send(conn);
                Ok(())
            }
            Err(_) => Err(conn),
        }
    }

    /// Connections waiting in the queue.
    pub fn queued(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop claiming work, close the queue and drop every unclaimed
    /// connection. Returns how many were dropped.
    pub async fn shutdown(&self) -> usize {
        self.cancel.cancel();

        let mut queue = self.queue.lock().await;
        queue.close();

        let mut discarded = 0;
        while let Ok(conn) = queue.try_recv() {
            debug!(peer = %conn.peer, "Closing queued connection on shutdown");
            drop(conn);
            discarded += 1;
        }

        if discarded > 0 {
            info!(discarded, "Closed unclaimed connections");
        }
        discarded
    }

    /// Wait for every worker to finish its current session and exit.
    pub async fn join(self) {
        for handle in self.workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task failed");
            }
        }
    }
}

struct Worker<S> {
    id: Uuid,
    queue: Queue<S>,
    config: SessionConfig,
    cancel: CancellationToken,
}

impl<S> Worker<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(self) {
        debug!(worker = %self.id, "Worker is ready to process connections");

        while let Some(conn) = self.next().await {
            debug!(worker = %self.id, peer = %conn.peer, "Processing connection");

            let session = Session::new(conn.stream, conn.peer.clone(), self.config);
            match session.run().await {
                Ok(()) => debug!(worker = %self.id, peer = %conn.peer, "Session ended"),
                Err(e) if e.is_timeout() => {
                    debug!(worker = %self.id, peer = %conn.peer, error = %e, "Session timed out");
                }
                Err(e) => {
                    warn!(
                        worker = %self.id,
                        peer = %conn.peer,
                        error = %e,
                        "Failed to process connection"
                    );
                }
            }
        }

        debug!(worker = %self.id, "Worker stopped");
    }

    /// Block until a connection is available or the pool shuts down.
    async fn next(&self) -> Option<Accepted<S>> {
        if self.cancel.is_cancelled() {
            return None;
        }

        let mut queue = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return None,
            queue = self.queue.lock() => queue,
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            conn = queue.recv() => conn,
        }
    }
}
