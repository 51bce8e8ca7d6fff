//! Per-connection liveness pings.
//!
//! A [`LivenessManager`] writes the raw `ping` marker to the peer every
//! interval. The owning session resets the timer whenever real traffic is
//! observed and may replace the interval when the peer renegotiates it.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::protocol::PING;

/// Write half shared between a session and its liveness task.
///
/// The mutex keeps a ping from landing in the middle of a response frame.
pub type SharedWriter<W> = Arc<Mutex<W>>;

/// Message from the session to its liveness task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reset {
    /// Traffic was just seen: restart the current interval.
    Suppress,
    /// Switch to a new interval and restart the timer.
    Interval(Duration),
}

/// Why a liveness task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stopped {
    Cancelled,
    /// The session dropped its reset sender.
    Detached,
    /// A ping could not be written; the connection is assumed dead.
    WriteFailed,
}

/// Interval actually used for pinging: zero falls back to `default`.
pub fn effective_interval(negotiated: Duration, default: Duration) -> Duration {
    if negotiated.is_zero() {
        default
    } else {
        negotiated
    }
}

pub struct LivenessManager<W> {
    writer: SharedWriter<W>,
    interval: Duration,
    resets: mpsc::Receiver<Reset>,
    cancel: CancellationToken,
}

impl<W> LivenessManager<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// `interval` is floored to `default_interval` when zero.
    pub fn new(
        writer: SharedWriter<W>,
        interval: Duration,
        default_interval: Duration,
        resets: mpsc::Receiver<Reset>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            writer,
            interval: effective_interval(interval, default_interval),
            resets,
            cancel,
        }
    }

    /// Run until cancelled, detached, or a ping write fails.
    ///
    /// Cancellation wins over any other ready event and never sends a final
    /// ping.
    pub async fn run(mut self) -> Stopped {
        let sleep = time::sleep(self.interval);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => return Stopped::Cancelled,

                reset = self.resets.recv() => match reset {
                    Some(Reset::Interval(interval)) if !interval.is_zero() => {
                        debug!(
                            interval_ms = interval.as_millis() as u64,
                            "Ping interval renegotiated"
                        );
                        self.interval = interval;
                    }
                    Some(_) => trace!("Ping suppressed by traffic"),
                    None => return Stopped::Detached,
                },

                () = &mut sleep => {
                    let written = tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return Stopped::Cancelled,
                        written = self.ping() => written,
                    };
                    if let Err(e) = written {
                        debug!(error = %e, "Failed to send ping, stopping liveness");
                        return Stopped::WriteFailed;
                    }
                    trace!("Ping sent");
                }
            }

            sleep.as_mut().reset(Instant::now() + self.interval);
        }
    }

    async fn ping(&self) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(PING).await?;
        writer.flush().await
    }
}
