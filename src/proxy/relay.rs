//! Duplex byte relay between a client and an upstream connection
//!
//! Each direction is a copy loop. When one loop finishes it half-closes its destination
//! and arms a read deadline on the other loop so a read blocked on an idle peer returns
//! after a bounded wait instead of holding the connection open forever.

use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

const BUF_SIZE: usize = 16 * 1024;

/// Default time the surviving direction may keep reading after its partner finished
pub const DEFAULT_RELAY_WAIT: Duration = Duration::from_secs(5);

/// Which endpoint of a relay an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The accepted client connection
    Left,
    /// The upstream connection
    Right,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => write!(f, "client"),
            Side::Right => write!(f, "upstream"),
        }
    }
}

/// A genuine transport failure observed while relaying
#[derive(Debug, Error)]
#[error("{side} side: {source}")]
pub struct RelayError {
    pub side: Side,
    #[source]
    pub source: io::Error,
}

/// Result of one relay session
#[derive(Debug)]
pub struct RelayOutcome {
    pub left_to_right: u64,
    pub right_to_left: u64,
    pub elapsed: Duration,
    pub error: Option<RelayError>,
}

/// How a copy loop ended
#[derive(Debug)]
pub(crate) enum PumpEnd {
    Eof,
    /// The armed deadline passed while waiting on a read
    Unblocked,
    Read(io::Error),
    Write(io::Error),
}

#[derive(Debug)]
pub(crate) struct Pumped {
    pub bytes: u64,
    pub end: PumpEnd,
    pub finished_at: Instant,
}

impl Pumped {
    pub fn failed(&self) -> bool {
        matches!(self.end, PumpEnd::Read(_) | PumpEnd::Write(_))
    }

    /// Turn a genuine failure into a relay error, attributing reads and writes to
    /// the given sides
    fn into_error(self, read_side: Side, write_side: Side) -> Option<(RelayError, Instant)> {
        let (side, source) = match self.end {
            PumpEnd::Eof | PumpEnd::Unblocked => return None,
            PumpEnd::Read(e) => (read_side, e),
            PumpEnd::Write(e) => (write_side, e),
        };
        Some((RelayError { side, source }, self.finished_at))
    }
}

/// Run `fut` until it completes or the deadline carried by `deadline` passes
///
/// While no deadline is set the future runs unbounded; once one is published it bounds
/// the remainder of the wait. Returns `None` when the deadline fired first.
pub(crate) async fn with_deadline<F: Future>(
    fut: F,
    deadline: &mut watch::Receiver<Option<Instant>>,
) -> Option<F::Output> {
    tokio::pin!(fut);

    loop {
        let armed = *deadline.borrow_and_update();
        if let Some(at) = armed {
            return tokio::time::timeout_at(at, &mut fut).await.ok();
        }

        tokio::select! {
            out = &mut fut => return Some(out),
            changed = deadline.changed() => {
                if changed.is_err() {
                    // Sender dropped without ever arming
                    return Some(fut.await);
                }
            }
        }
    }
}

/// Copy `reader` into `writer` until EOF, error or the read deadline passes
///
/// The writer is shut down when the loop ends so the peer sees the half-close.
pub(crate) async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    deadline: &mut watch::Receiver<Option<Instant>>,
) -> Pumped
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUF_SIZE];
    let mut bytes = 0u64;

    let end = loop {
        let n = match with_deadline(reader.read(&mut buf), deadline).await {
            None => break PumpEnd::Unblocked,
            Some(Ok(0)) => break PumpEnd::Eof,
            Some(Ok(n)) => n,
            Some(Err(e)) => break PumpEnd::Read(e),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            break PumpEnd::Write(e);
        }
        bytes += n as u64;
    };

    let _ = writer.shutdown().await;

    Pumped {
        bytes,
        end,
        finished_at: Instant::now(),
    }
}

/// Bidirectional relay with deadline-based unblocking
#[derive(Debug, Clone, Copy)]
pub struct DuplexRelay {
    wait: Duration,
}

impl DuplexRelay {
    pub fn new(wait: Duration) -> Self {
        Self { wait }
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Relay between two full-duplex streams until both directions are done
    pub async fn relay<L, R>(&self, left: L, right: R) -> RelayOutcome
    where
        L: AsyncRead + AsyncWrite + Send + 'static,
        R: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.relay_halves(tokio::io::split(left), tokio::io::split(right))
            .await
    }

    /// Relay between already split endpoints
    ///
    /// The left to right loop runs on its own task; the reverse loop runs inline.
    pub async fn relay_halves<LR, LW, RR, RW>(
        &self,
        (left_read, left_write): (LR, LW),
        (right_read, right_write): (RR, RW),
    ) -> RelayOutcome
    where
        LR: AsyncRead + Unpin + Send + 'static,
        LW: AsyncWrite + Unpin,
        RR: AsyncRead + Unpin,
        RW: AsyncWrite + Unpin + Send + 'static,
    {
        let started = Instant::now();
        let wait = self.wait;

        // Deadline for the left read (upload loop) and for the right read (download loop)
        let (upload_deadline_tx, mut upload_deadline_rx) = watch::channel(None);
        let (download_deadline_tx, mut download_deadline_rx) = watch::channel(None);

        let upload = tokio::spawn(async move {
            let pumped = pump(left_read, right_write, &mut upload_deadline_rx).await;
            download_deadline_tx.send_replace(Some(Instant::now() + wait));
            pumped
        });

        let download = pump(right_read, left_write, &mut download_deadline_rx).await;
        upload_deadline_tx.send_replace(Some(Instant::now() + wait));

        let upload = match upload.await {
            Ok(pumped) => pumped,
            Err(e) => Pumped {
                bytes: 0,
                end: PumpEnd::Read(io::Error::new(io::ErrorKind::Other, e)),
                finished_at: Instant::now(),
            },
        };

        let left_to_right = upload.bytes;
        let right_to_left = download.bytes;

        let error = match (
            upload.into_error(Side::Left, Side::Right),
            download.into_error(Side::Right, Side::Left),
        ) {
            (Some(up), Some(down)) => {
                if up.1 <= down.1 {
                    Some(up.0)
                } else {
                    Some(down.0)
                }
            }
            (Some(up), None) => Some(up.0),
            (None, Some(down)) => Some(down.0),
            (None, None) => None,
        };

        let elapsed = started.elapsed();
        debug!(
            left_to_right,
            right_to_left,
            elapsed_ms = elapsed.as_millis() as u64,
            failed = error.is_some(),
            "Relay finished"
        );

        RelayOutcome {
            left_to_right,
            right_to_left,
            elapsed,
            error,
        }
    }
}

impl Default for DuplexRelay {
    fn default() -> Self {
        Self::new(DEFAULT_RELAY_WAIT)
    }
}
