//! Bidirectional byte forwarding between two connected streams.
//!
//! For each session the forwarder:
//! 1. Splits both streams into read and write halves.
//! 2. Spawns two Tokio tasks: one copying client→backend, the other
//!    backend→client.
//! 3. When either direction ends (EOF or error), it cancels the other; both
//!    write halves are shut down and both streams are dropped.
//!
//! Bytes are forwarded opaquely, one fixed-size chunk at a time. Half-close is
//! not preserved: the first direction to finish closes the whole session.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Size of the buffer used for each read.
pub const COPY_CHUNK_SIZE: usize = 32 * 1024;

/// Bound on the best-effort shutdown of a write half.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Direction of one half of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToBackend => "client→backend",
            Direction::BackendToClient => "backend→client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How one direction stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The source reached end-of-stream.
    Eof,
    /// A read or write failed.
    Error(io::ErrorKind),
    /// The other direction finished first.
    Cancelled,
    /// The copy task panicked or was aborted.
    Aborted,
}

/// Outcome of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HalfSummary {
    pub direction: Direction,
    pub bytes: u64,
    pub termination: Termination,
}

/// Outcome of a whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardSummary {
    pub client_to_backend: HalfSummary,
    pub backend_to_client: HalfSummary,
}

impl ForwardSummary {
    /// Returns `true` if either direction ended abnormally.
    pub fn had_error(&self) -> bool {
        [self.client_to_backend, self.backend_to_client]
            .iter()
            .any(|h| matches!(h.termination, Termination::Error(_) | Termination::Aborted))
    }
}

/// Forward bytes between `client` and `backend` until either side ends.
///
/// Both streams are closed when this returns. Transport errors are logged
/// and reported in the summary, never returned.
pub async fn forward<C, B>(client: C, backend: B) -> ForwardSummary
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);
    let done = CancellationToken::new();

    let upstream = tokio::spawn(copy_half(
        client_read,
        backend_write,
        Direction::ClientToBackend,
        done.clone(),
    ));
    let downstream = tokio::spawn(copy_half(
        backend_read,
        client_write,
        Direction::BackendToClient,
        done,
    ));

    let (up, down) = tokio::join!(upstream, downstream);
    ForwardSummary {
        client_to_backend: joined(up, Direction::ClientToBackend),
        backend_to_client: joined(down, Direction::BackendToClient),
    }
}

fn joined(res: Result<HalfSummary, tokio::task::JoinError>, direction: Direction) -> HalfSummary {
    res.unwrap_or_else(|e| {
        error!(%direction, error = %e, "copy task failed");
        HalfSummary {
            direction,
            bytes: 0,
            termination: Termination::Aborted,
        }
    })
}

/// Copy `reader` into `writer` until EOF, error, or cancellation by the
/// opposite direction. Always cancels `done` when it stops.
async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    done: CancellationToken,
) -> HalfSummary
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Cancels on drop as well, so a panic below still releases the peer task.
    let guard = done.clone().drop_guard();
    let mut bytes = 0u64;

    let termination = tokio::select! {
        res = pump(&mut reader, &mut writer, &mut bytes) => match res {
            Ok(()) => Termination::Eof,
            Err(e) => {
                debug!(%direction, error = %e, "copy error");
                Termination::Error(e.kind())
            }
        },
        _ = done.cancelled() => Termination::Cancelled,
    };
    drop(guard);

    match timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(%direction, error = %e, "shutdown error"),
        Err(_) => debug!(%direction, "shutdown timed out"),
    }
    debug!(%direction, bytes, ?termination, "half closed");

    HalfSummary {
        direction,
        bytes,
        termination,
    }
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *total += n as u64;
    }
}
