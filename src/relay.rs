//! Bidirectional byte relay between a tunnel client and its backend.

use crate::stats::SessionCounter;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

const BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend.
    Upstream,
    /// Backend to client.
    Downstream,
}

#[derive(Debug)]
pub struct RelayOutcome {
    /// Direction that finished first.
    pub first: Direction,
    /// First I/O error seen, if any.
    pub error: Option<io::Error>,
    /// Whether the second direction had to be cut after the grace period.
    pub cut: bool,
}

/// Copies `reader` into `writer` until EOF, counting every chunk once it is
/// fully written. Shuts `writer` down on clean EOF.
async fn pump<R, W, F>(reader: &mut R, writer: &mut W, mut count: F) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        count(n as u64);
    }
    writer.shutdown().await
}

/// Relays until one side ends, then lets the other drain for `grace`.
///
/// Counters stay exact whatever the outcome; the caller closes both streams
/// by dropping them.
pub async fn relay<C, B>(
    client: &mut C,
    backend: &mut B,
    counter: &SessionCounter,
    grace: Duration,
) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut backend_rd, mut backend_wr) = tokio::io::split(backend);

    let upstream = pump(&mut client_rd, &mut backend_wr, |n| counter.add_sent(n));
    let downstream = pump(&mut backend_rd, &mut client_wr, |n| counter.add_recv(n));
    tokio::pin!(upstream);
    tokio::pin!(downstream);

    let (first, first_result) = tokio::select! {
        r = &mut upstream => (Direction::Upstream, r),
        r = &mut downstream => (Direction::Downstream, r),
    };
    debug!("relay: {:?} finished first ({:?})", first, first_result.as_ref().err());

    let mut error = first_result.err();
    let mut cut = false;

    // A failed direction means a broken socket; no point in waiting.
    if error.is_none() {
        let rest = match first {
            Direction::Upstream => tokio::time::timeout(grace, &mut downstream).await,
            Direction::Downstream => tokio::time::timeout(grace, &mut upstream).await,
        };
        match rest {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error = Some(e),
            Err(_) => {
                trace!("relay: grace period elapsed, cutting");
                cut = true;
            }
        }
    }

    RelayOutcome { first, error, cut }
}
