//! Client side of the tunnel protocol: liveness checks, admin stats queries
//! and a local port forwarder.

use crate::protocol::{self, Command, HANDSHAKE_V1, RESPONSE_FORBIDDEN, RESPONSE_OK};
use crate::stats::StatsSnapshot;
use crate::ticket::Ticket;
use anyhow::{anyhow, bail, Context, Result};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info};

/// Largest reply the server sends outside of a relay.
const MAX_REPLY: u64 = 64 * 1024;

/// Admin stats: the summary line plus per-worker lines when detailed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsReport {
    pub total: StatsSnapshot,
    pub workers: Vec<StatsSnapshot>,
}

impl StatsReport {
    pub fn parse(text: &str) -> Option<Self> {
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let total = StatsSnapshot::parse_line(lines.next()?)?;
        let workers = lines
            .map(|line| {
                let rest = line.strip_prefix("worker")?;
                let (_, values) = rest.split_once(';')?;
                StatsSnapshot::parse_line(values)
            })
            .collect::<Option<Vec<_>>>()?;
        Some(Self { total, workers })
    }
}

#[derive(Clone)]
pub struct TunnelClient {
    server: String,
    connector: TlsConnector,
    server_name: ServerName<'static>,
    handshake: bool,
    timeout: Duration,
}

impl TunnelClient {
    pub fn new(server: impl Into<String>, connector: TlsConnector, server_name: ServerName<'static>) -> Self {
        Self {
            server: server.into(),
            connector,
            server_name,
            handshake: true,
            timeout: Duration::from_secs(10),
        }
    }

    /// Whether to send the magic prefix before TLS.
    pub fn with_handshake(mut self, handshake: bool) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// TCP connect, optional handshake prefix, TLS.
    pub async fn connect(&self) -> Result<TlsStream<TcpStream>> {
        let mut tcp = tokio::time::timeout(self.timeout, TcpStream::connect(&self.server))
            .await
            .map_err(|_| anyhow!("Timed out connecting to {}", self.server))?
            .with_context(|| format!("Failed to connect to {}", self.server))?;
        tcp.set_nodelay(true)?;
        if self.handshake {
            tcp.write_all(HANDSHAKE_V1)
                .await
                .context("Failed to send handshake")?;
        }
        tokio::time::timeout(
            self.timeout,
            self.connector.connect(self.server_name.clone(), tcp),
        )
        .await
        .map_err(|_| anyhow!("TLS handshake with {} timed out", self.server))?
        .context("TLS handshake failed")
    }

    /// Sends `TEST` and expects `OK`.
    pub async fn check(&self) -> Result<()> {
        let mut tls = self.connect().await?;
        tls.write_all(Command::Test.as_bytes()).await?;
        tls.flush().await?;
        let reply = self.read_reply(&mut tls).await?;
        if reply != RESPONSE_OK {
            bail!("Unexpected answer to TEST: {}", String::from_utf8_lossy(&reply));
        }
        Ok(())
    }

    /// Queries `INFO`, or `STAT` when `detailed`.
    pub async fn stats(&self, secret: &str, detailed: bool) -> Result<StatsReport> {
        let command = if detailed { Command::Stat } else { Command::Info };
        let mut tls = self.connect().await?;
        tls.write_all(command.as_bytes()).await?;
        tls.write_all(&protocol::encode_secret(secret)).await?;
        tls.flush().await?;

        let reply = self.read_reply(&mut tls).await?;
        if reply == RESPONSE_FORBIDDEN {
            bail!("Server refused {command}: FORBIDDEN");
        }
        let text = String::from_utf8_lossy(&reply);
        StatsReport::parse(&text).ok_or_else(|| anyhow!("Malformed stats reply: {text:?}"))
    }

    /// Opens a tunnel for `ticket`. On success the returned stream is the
    /// byte pipe to the backend.
    pub async fn open(&self, ticket: &Ticket) -> Result<TlsStream<TcpStream>> {
        let mut tls = self.connect().await?;
        tls.write_all(Command::Open.as_bytes()).await?;
        tls.write_all(ticket.as_bytes()).await?;
        tls.flush().await?;

        // Error codes are longer than OK, so two bytes are enough to decide;
        // anything after OK already belongs to the backend.
        let mut head = [0u8; 2];
        let read = tokio::time::timeout(self.timeout, tls.read_exact(&mut head)).await;
        match read {
            Ok(Ok(_)) if head == RESPONSE_OK => Ok(tls),
            Ok(Ok(_)) => {
                let mut rest = Vec::new();
                let _ = read_to_end_lenient(&mut tls, &mut rest).await;
                let mut reply = head.to_vec();
                reply.extend(rest);
                bail!("Tunnel refused: {}", String::from_utf8_lossy(&reply))
            }
            Ok(Err(e)) => Err(e).context("Server closed before answering OPEN"),
            Err(_) => bail!("No answer to OPEN within {:?}", self.timeout),
        }
    }

    /// Accepts local connections forever, relaying each through its own tunnel.
    pub async fn forward(self: Arc<Self>, listener: TcpListener, ticket: Ticket) -> Result<()> {
        info!("Forwarding {} through {}", listener.local_addr()?, self.server);
        loop {
            let (local, peer) = listener.accept().await.context("Accept failed")?;
            debug!("local connection from {}", peer);
            let client = Arc::clone(&self);
            let ticket = ticket.clone();
            tokio::spawn(async move {
                match client.forward_one(local, &ticket).await {
                    Ok((sent, recv)) => info!("{} closed, s:{}, r:{}", peer, sent, recv),
                    Err(e) => error!("{}: {:#}", peer, e),
                }
            });
        }
    }

    async fn forward_one(&self, mut local: TcpStream, ticket: &Ticket) -> Result<(u64, u64)> {
        local.set_nodelay(true)?;
        let mut tunnel = self.open(ticket).await?;
        let counts = tokio::io::copy_bidirectional(&mut local, &mut tunnel)
            .await
            .context("Relay failed")?;
        Ok(counts)
    }

    async fn read_reply<R>(&self, reader: &mut R) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let mut reply = Vec::new();
        tokio::time::timeout(self.timeout, read_to_end_lenient(reader, &mut reply))
            .await
            .map_err(|_| anyhow!("No reply within {:?}", self.timeout))??;
        Ok(reply)
    }
}

/// Reads until the server closes. A missing TLS close_notify after some
/// data still counts as a complete reply.
async fn read_to_end_lenient<R>(reader: &mut R, out: &mut Vec<u8>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match (&mut *reader).take(MAX_REPLY).read_to_end(out).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && !out.is_empty() => Ok(()),
        Err(e) => Err(e).context("Failed to read reply"),
    }
}
