//! Bidirectional byte relay.
//!
//! Once the upstream side is connected (and past any CONNECT handshake),
//! bytes are copied client → upstream and upstream → client concurrently.
//! Each direction stops on its own EOF or error and then half-closes its
//! destination; the opposite direction keeps draining until it terminates
//! too. The relay completes only when both have finished.
//!
//! The optional idle timeout covers the tunnel as a whole: traffic in
//! either direction keeps both alive, so a long download with a silent
//! client is not cut short. Once neither side has moved a byte for the
//! idle period, both directions end.
//!
//! Resets, broken pipes and EOFs are the normal way a relay ends, so they
//! are logged at debug level and never returned to the caller.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Size of the chunk read per iteration in each direction.
pub const RELAY_CHUNK_SIZE: usize = 16 * 1024;

/// Bytes moved by a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from the client to the upstream.
    pub client_to_upstream: u64,
    /// Bytes copied from the upstream to the client.
    pub upstream_to_client: u64,
}

impl RelayStats {
    /// Returns the total number of bytes relayed.
    pub fn total(&self) -> u64 {
        self.client_to_upstream + self.upstream_to_client
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToUpstream => "client->upstream",
            Direction::UpstreamToClient => "upstream->client",
        }
    }
}

/// Last time either direction moved data, shared by both pumps.
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.start + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// Relays bytes between `client` and `upstream` until both directions end.
///
/// `idle` bounds how long the tunnel may go without data in either
/// direction; `None` waits indefinitely.
pub async fn relay<C, U>(client: &mut C, upstream: &mut U, idle: Option<Duration>) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let activity = Activity::new();

    let client_to_upstream = pump(
        &mut client_read,
        &mut upstream_write,
        Direction::ClientToUpstream,
        idle,
        &activity,
    );
    let upstream_to_client = pump(
        &mut upstream_read,
        &mut client_write,
        Direction::UpstreamToClient,
        idle,
        &activity,
    );

    let (client_to_upstream, upstream_to_client) =
        tokio::join!(client_to_upstream, upstream_to_client);

    RelayStats {
        client_to_upstream,
        upstream_to_client,
    }
}

/// Copies one direction until EOF, error, or the whole tunnel going idle,
/// then shuts the writer down. Returns the number of bytes written.
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    idle: Option<Duration>,
    activity: &Activity,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let read = match idle {
            Some(limit) => match read_before_idle(reader, &mut buf, limit, activity).await {
                Some(read) => read,
                None => {
                    debug!(
                        direction = direction.as_str(),
                        idle_secs = limit.as_secs_f64(),
                        "relay idle timeout"
                    );
                    break;
                }
            },
            None => reader.read(&mut buf).await,
        };

        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                log_relay_error(direction, "read", &e);
                break;
            }
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            log_relay_error(direction, "write", &e);
            break;
        }
        total += n as u64;
        activity.touch();
    }

    // Half-close so the peer sees EOF; the other direction keeps running.
    if let Err(e) = writer.shutdown().await {
        log_relay_error(direction, "shutdown", &e);
    }

    debug!(
        direction = direction.as_str(),
        bytes = total,
        "relay direction finished"
    );
    total
}

/// Reads once, giving up only when neither direction has seen data for
/// `limit`. Returns `None` on idle timeout.
async fn read_before_idle<R>(
    reader: &mut R,
    buf: &mut [u8],
    limit: Duration,
    activity: &Activity,
) -> Option<io::Result<usize>>
where
    R: AsyncRead + Unpin,
{
    loop {
        let deadline = activity.last() + limit;
        match tokio::time::timeout_at(deadline, reader.read(buf)).await {
            Ok(read) => return Some(read),
            // The other direction moved data meanwhile; wait out the new deadline.
            Err(_) if activity.last() + limit > Instant::now() => continue,
            Err(_) => return None,
        }
    }
}

fn log_relay_error(direction: Direction, op: &'static str, err: &io::Error) {
    if is_expected_disconnect(err) {
        debug!(direction = direction.as_str(), op, error = %err, "peer disconnected");
    } else {
        warn!(direction = direction.as_str(), op, error = %err, "relay I/O error");
    }
}

/// Returns true for errors that just mean the other side went away.
pub fn is_expected_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}
