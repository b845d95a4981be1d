//! Relay engine
//!
//! Copies bytes in both directions between two connections with no framing
//! and no interpretation of the payload. The relay ends as soon as either
//! side closes or errors; the other side is then shut down and dropped, so
//! no half-open relay survives.

use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const BUFFER_SIZE: usize = 16 * 1024;

/// One end of a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => write!(f, "left"),
            Side::Right => write!(f, "right"),
        }
    }
}

/// Why a relay ended
#[derive(Debug)]
pub enum RelayEnd {
    /// The given side closed its connection cleanly
    Closed(Side),
    /// Reading from or writing to the given side failed
    Failed(Side, std::io::Error),
    /// The relay was torn down from outside (agent session ended)
    Cancelled,
}

impl fmt::Display for RelayEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayEnd::Closed(side) => write!(f, "{} side closed", side),
            RelayEnd::Failed(side, e) => write!(f, "{} side failed: {}", side, e),
            RelayEnd::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Byte counts and termination reason of a finished relay
#[derive(Debug)]
pub struct RelayStats {
    pub left_to_right: u64,
    pub right_to_left: u64,
    pub end: RelayEnd,
}

/// Copy from `reader` to `writer` until EOF, counting bytes.
///
/// Errors are attributed to the side they happened on.
async fn copy_counted<R, W>(
    reader: &mut R,
    writer: &mut W,
    total: &mut u64,
    from: Side,
    to: Side,
) -> RelayEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => return RelayEnd::Closed(from),
            Ok(n) => n,
            Err(e) => return RelayEnd::Failed(from, e),
        };

        if let Err(e) = writer.write_all(&buffer[..n]).await {
            return RelayEnd::Failed(to, e);
        }
        if let Err(e) = writer.flush().await {
            return RelayEnd::Failed(to, e);
        }
        *total += n as u64;
    }
}

/// Splice `left` and `right` together.
///
/// Returns once either side closes or errors, or `shutdown` is cancelled.
/// Both connections are closed when this returns.
pub async fn pair<L, R>(left: L, right: R, shutdown: CancellationToken) -> RelayStats
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut left_read, mut left_write) = tokio::io::split(left);
    let (mut right_read, mut right_write) = tokio::io::split(right);

    let mut left_to_right = 0u64;
    let mut right_to_left = 0u64;

    let end = tokio::select! {
        end = copy_counted(&mut left_read, &mut right_write, &mut left_to_right, Side::Left, Side::Right) => end,
        end = copy_counted(&mut right_read, &mut left_write, &mut right_to_left, Side::Right, Side::Left) => end,
        _ = shutdown.cancelled() => RelayEnd::Cancelled,
    };

    debug!("Relay ending: {}", end);

    // Pass the FIN along before dropping both ends
    match &end {
        RelayEnd::Closed(Side::Left) | RelayEnd::Failed(Side::Left, _) => {
            let _ = right_write.shutdown().await;
        }
        RelayEnd::Closed(Side::Right) | RelayEnd::Failed(Side::Right, _) => {
            let _ = left_write.shutdown().await;
        }
        RelayEnd::Cancelled => {}
    }

    drop(left_read.unsplit(left_write));
    drop(right_read.unsplit(right_write));

    RelayStats {
        left_to_right,
        right_to_left,
        end,
    }
}
