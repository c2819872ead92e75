use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, Instrument};

use crate::connection::TunnelConn;

pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Bytes moved by a finished relay, per direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    pub near_to_far: u64,
    pub far_to_near: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    NearToFar,
    FarToNear,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::NearToFar => write!(f, "near->far"),
            Direction::FarToNear => write!(f, "far->near"),
        }
    }
}

type PumpResult = (Direction, io::Result<u64>);

/// Copies bytes both ways between `near` and `far` until both directions end
/// or `cancel` fires.
///
/// When one source reaches end of stream the opposite endpoint is
/// half-closed, and the other direction keeps draining. Both endpoints are
/// closed when this returns. Copy errors are logged and end only their own
/// direction. On cancellation the counts are left at zero.
pub async fn relay(near: TunnelConn, far: TunnelConn, cancel: CancellationToken) -> Transfer {
    let near_half_close = near.supports_half_close();
    let far_half_close = far.supports_half_close();
    let (near_read, near_write) = tokio::io::split(near);
    let (far_read, far_write) = tokio::io::split(far);

    let (done_tx, mut done_rx) = mpsc::channel::<PumpResult>(2);
    // Dropping the set aborts whatever is still running, which drops the
    // halves and closes both endpoints.
    let mut pumps = JoinSet::new();
    pumps.spawn(
        pump(
            Direction::NearToFar,
            near_read,
            far_write,
            far_half_close,
            done_tx.clone(),
        )
        .in_current_span()
        .with_current_subscriber(),
    );
    pumps.spawn(
        pump(
            Direction::FarToNear,
            far_read,
            near_write,
            near_half_close,
            done_tx,
        )
        .in_current_span()
        .with_current_subscriber(),
    );

    let mut transfer = Transfer::default();
    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("tunnel cancelled");
            return transfer;
        }
        first = done_rx.recv() => record(&mut transfer, first),
    }
    let second = done_rx.recv().await;
    record(&mut transfer, second);

    debug!(
        near_to_far = transfer.near_to_far,
        far_to_near = transfer.far_to_near,
        "tunnel finished"
    );
    transfer
}

fn record(transfer: &mut Transfer, result: Option<PumpResult>) {
    match result {
        Some((Direction::NearToFar, Ok(n))) => transfer.near_to_far = n,
        Some((Direction::FarToNear, Ok(n))) => transfer.far_to_near = n,
        Some((direction, Err(e))) => debug!(%direction, "tunnel copy error: {}", e),
        None => {}
    }
}

async fn pump(
    direction: Direction,
    mut src: ReadHalf<TunnelConn>,
    mut dst: WriteHalf<TunnelConn>,
    half_close: bool,
    done: mpsc::Sender<PumpResult>,
) {
    let result = copy_until_eof(&mut src, &mut dst).await;
    // Pass the end of stream on so the peer can finish and close its side.
    if half_close {
        if let Err(e) = dst.shutdown().await {
            debug!(%direction, "half-close failed: {}", e);
        }
    }
    let _ = done.send((direction, result)).await;
}

/// Writes every chunk fully and flushes it before reading the next one.
async fn copy_until_eof<R, W>(src: &mut R, dst: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        dst.flush().await?;
        total += n as u64;
    }
}
