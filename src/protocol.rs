//! Wire format spoken between tunnel clients and the tunnel server.
//!
//! A connection starts with an optional magic handshake on the raw socket,
//! then TLS, then a fixed-width 4 byte command. Replies are short fixed
//! byte strings; after `OK` on `OPEN` the stream carries opaque relayed bytes.

use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout_at, Instant};

/// Magic bytes sent in clear before the TLS handshake.
pub const HANDSHAKE_V1: &[u8] = b"\x5AMGB\xA5\x01\x00";

pub const COMMAND_LENGTH: usize = 4;
pub const TICKET_LENGTH: usize = 48;
/// Width of the secret field following `STAT` and `INFO`.
pub const SECRET_LENGTH: usize = 64;

pub const RESPONSE_OK: &[u8] = b"OK";
pub const RESPONSE_ERROR_COMMAND: &[u8] = b"ERROR_COMMAND";
pub const RESPONSE_ERROR_TIMEOUT: &[u8] = b"ERROR_TIMEOUT";
pub const RESPONSE_ERROR_TICKET: &[u8] = b"ERROR_TICKET";
pub const RESPONSE_FORBIDDEN: &[u8] = b"FORBIDDEN";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start a relay; a ticket follows.
    Open,
    /// Liveness probe, answered with `OK`.
    Test,
    /// Detailed stats (admin).
    Stat,
    /// Summary stats (admin).
    Info,
}

impl Command {
    pub fn parse(raw: &[u8; COMMAND_LENGTH]) -> Option<Self> {
        match raw {
            b"OPEN" => Some(Command::Open),
            b"TEST" => Some(Command::Test),
            b"STAT" => Some(Command::Stat),
            b"INFO" => Some(Command::Info),
            _ => None,
        }
    }

    pub fn as_bytes(self) -> &'static [u8; COMMAND_LENGTH] {
        match self {
            Command::Open => b"OPEN",
            Command::Test => b"TEST",
            Command::Stat => b"STAT",
            Command::Info => b"INFO",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Command::Open => "OPEN",
            Command::Test => "TEST",
            Command::Stat => "STAT",
            Command::Info => "INFO",
        })
    }
}

/// Result of reading a fixed-size field against a deadline.
#[derive(Debug)]
pub enum ReadOutcome {
    Complete,
    /// Peer closed after sending this many bytes.
    Eof(usize),
    /// Deadline reached with this many bytes buffered.
    TimedOut(usize),
    Failed(std::io::Error),
}

/// Fills `buf` completely unless the peer closes, errors or `deadline` passes.
///
/// Never reads past `buf.len()`, so bytes of the next field stay in the stream.
pub async fn read_field<R>(reader: &mut R, buf: &mut [u8], deadline: Instant) -> ReadOutcome
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match timeout_at(deadline, reader.read(&mut buf[filled..])).await {
            Err(_) => return ReadOutcome::TimedOut(filled),
            Ok(Ok(0)) => return ReadOutcome::Eof(filled),
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => return ReadOutcome::Failed(e),
        }
    }
    ReadOutcome::Complete
}

/// Reads and checks the magic handshake. `false` on mismatch, EOF or timeout.
pub async fn expect_handshake<R>(reader: &mut R, wait: Duration) -> bool
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_V1.len()];
    match read_field(reader, &mut buf, Instant::now() + wait).await {
        ReadOutcome::Complete => buf == HANDSHAKE_V1,
        _ => false,
    }
}

/// Encodes the admin secret into its fixed-width, NUL padded field.
pub fn encode_secret(secret: &str) -> [u8; SECRET_LENGTH] {
    let mut field = [0u8; SECRET_LENGTH];
    let bytes = secret.as_bytes();
    let len = bytes.len().min(SECRET_LENGTH);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

/// Strips the NUL/space padding of a received secret field.
pub fn decode_secret(field: &[u8]) -> &[u8] {
    let end = field
        .iter()
        .rposition(|b| *b != 0 && *b != b' ')
        .map_or(0, |i| i + 1);
    &field[..end]
}
