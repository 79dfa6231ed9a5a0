//! Per-connection protocol handling.
//!
//! A session walks `AwaitHandshake → AwaitCommand → AwaitTicketPayload →
//! Resolving → ConnectingBackend → Relaying → Closed`, or ends in `Error`
//! from any non-terminal state. Admin commands branch off `AwaitCommand`
//! into `AwaitAdminSecret`. Every failure stays inside the session: the peer
//! gets at most one fixed response and the worker moves on.

use crate::broker::{Broker, BrokerError, ResolvedDestination};
use crate::config::Config;
use crate::protocol::{
    self, Command, ReadOutcome, COMMAND_LENGTH, RESPONSE_ERROR_COMMAND, RESPONSE_ERROR_TICKET,
    RESPONSE_ERROR_TIMEOUT, RESPONSE_FORBIDDEN, RESPONSE_OK, SECRET_LENGTH, TICKET_LENGTH,
};
use crate::relay::relay;
use crate::stats::{GlobalStats, SessionCounter, SessionGuard, WorkerStats};
use crate::ticket::{Ticket, TicketError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitHandshake,
    AwaitCommand,
    AwaitTicketPayload,
    AwaitAdminSecret,
    Resolving,
    ConnectingBackend,
    Relaying,
    Closed,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error)
    }

    /// Legal forward edges of the state machine.
    fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed | Error, _) => false,
            (_, Closed | Error) => true,
            (AwaitHandshake, AwaitCommand) => true,
            (AwaitCommand, AwaitTicketPayload | AwaitAdminSecret) => true,
            (AwaitTicketPayload, Resolving) => true,
            (Resolving, ConnectingBackend) => true,
            (ConnectingBackend, Relaying) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("HANDSHAKE invalid")]
    Handshake,

    #[error("TLS negotiation failed: {0}")]
    Tls(io::Error),

    #[error("TIMEOUT with {received} bytes received")]
    Timeout { received: usize },

    #[error("peer closed after {received} bytes")]
    ClientClosed { received: usize },

    #[error("invalid command {0:02x?}")]
    InvalidCommand([u8; COMMAND_LENGTH]),

    #[error("invalid ticket: {0}")]
    InvalidTicket(#[from] TicketError),

    #[error("ticket resolution failed: {0}")]
    Resolution(#[from] BrokerError),

    #[error("connection to {address} failed: {source}")]
    Backend { address: String, source: io::Error },

    #[error("admin request refused")]
    Forbidden,

    #[error("relay broken: {0}")]
    Relay(io::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("illegal transition {from:?} -> {to:?}")]
    IllegalTransition { from: SessionState, to: SessionState },
}

impl SessionError {
    /// Wire response owed to the peer, if any.
    pub fn response(&self) -> Option<&'static [u8]> {
        match self {
            SessionError::Timeout { .. } => Some(RESPONSE_ERROR_TIMEOUT),
            SessionError::InvalidCommand(_)
            | SessionError::InvalidTicket(_)
            | SessionError::Resolution(BrokerError::InvalidTicket(_)) => Some(RESPONSE_ERROR_COMMAND),
            SessionError::Resolution(_) | SessionError::Backend { .. } => Some(RESPONSE_ERROR_TICKET),
            SessionError::Forbidden => Some(RESPONSE_FORBIDDEN),
            SessionError::Handshake
            | SessionError::Tls(_)
            | SessionError::ClientClosed { .. }
            | SessionError::Relay(_)
            | SessionError::Io(_)
            | SessionError::IllegalTransition { .. } => None,
        }
    }
}

/// Shared, read-only dependencies of every session.
pub struct SessionContext {
    pub config: Arc<Config>,
    pub broker: Arc<dyn Broker>,
    pub stats: Arc<GlobalStats>,
}

/// How a session ended.
#[derive(Debug)]
pub struct SessionOutcome {
    pub state: SessionState,
    pub sent: u64,
    pub recv: u64,
    pub error: Option<SessionError>,
}

pub struct TunnelSession {
    ctx: Arc<SessionContext>,
    worker: Arc<WorkerStats>,
    caller: SocketAddr,
    state: SessionState,
    destination: Option<ResolvedDestination>,
    counter: SessionCounter,
    started: Instant,
    _live: SessionGuard,
}

impl TunnelSession {
    pub fn new(ctx: Arc<SessionContext>, worker: Arc<WorkerStats>, caller: SocketAddr) -> Self {
        Self {
            counter: SessionCounter::new(worker.clone()),
            _live: worker.session(),
            ctx,
            worker,
            caller,
            state: SessionState::AwaitHandshake,
            destination: None,
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn advance(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_advance_to(next) {
            debug_assert!(false, "illegal transition {:?} -> {:?}", self.state, next);
            return Err(SessionError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        trace!("{}: {:?} -> {:?}", self.caller, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Full lifecycle of an accepted TCP connection: handshake, TLS, then
    /// the tunnel protocol.
    pub async fn serve<R>(mut self, mut raw: R, acceptor: &TlsAcceptor) -> SessionOutcome
    where
        R: AsyncRead + AsyncWrite + Unpin,
    {
        if let Err(e) = self.accept_handshake(&mut raw).await {
            error!("HANDSHAKE invalid from {}", self.caller);
            return self.finish(Err(e));
        }

        let negotiation = self.ctx.config.tunnel.handshake_timeout();
        let accepted = match tokio::time::timeout(negotiation, acceptor.accept(raw)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "TLS negotiation timed out",
            )),
        };
        let tls = match accepted {
            Ok(tls) => tls,
            Err(e) => {
                error!("NEGOTIATION ERROR from {}: {}", self.caller, e);
                return self.finish(Err(SessionError::Tls(e)));
            }
        };

        let (_, conn) = tls.get_ref();
        info!(
            "CONNECT FROM {} ({:?}/{:?})",
            self.caller,
            conn.protocol_version(),
            conn.negotiated_cipher_suite().map(|s| s.suite())
        );
        self.run(tls).await
    }

    /// `AwaitHandshake`: checks the magic prefix when the listener requires it.
    pub async fn accept_handshake<R>(&mut self, raw: &mut R) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let tunnel = &self.ctx.config.tunnel;
        if tunnel.handshake && !protocol::expect_handshake(raw, tunnel.handshake_timeout()).await {
            return Err(SessionError::Handshake);
        }
        self.advance(SessionState::AwaitCommand)
    }

    /// Runs the protocol over an established (TLS) stream and tears down.
    pub async fn run<S>(mut self, mut stream: S) -> SessionOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.process(&mut stream).await;

        if let Err(e) = &result {
            match e {
                SessionError::Timeout { .. } => error!("TIMEOUT FROM {}", self.caller),
                SessionError::ClientClosed { .. } => debug!("{}: {}", self.caller, e),
                SessionError::Relay(_) => error!("CONNECTION LOST from {}: {}", self.caller, e),
                _ => error!("ERROR from {}: {}", self.caller, e),
            }
            if let Some(code) = e.response() {
                if let Err(we) = send_response(&mut stream, code).await {
                    debug!("could not answer {}: {}", self.caller, we);
                }
            }
        }
        // Best effort; the peer may already be gone.
        let _ = stream.shutdown().await;
        drop(stream);

        self.finish(result)
    }

    async fn process<S>(&mut self, stream: &mut S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut raw = [0u8; COMMAND_LENGTH];
        self.read_within(stream, &mut raw).await?;
        let command = Command::parse(&raw).ok_or(SessionError::InvalidCommand(raw))?;

        match command {
            Command::Open => self.open(stream).await,
            Command::Test => {
                info!("COMMAND: TEST");
                send_response(stream, RESPONSE_OK).await?;
                Ok(())
            }
            Command::Stat | Command::Info => self.admin(stream, command).await,
        }
    }

    async fn open<S>(&mut self, stream: &mut S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.advance(SessionState::AwaitTicketPayload)?;
        let mut raw = [0u8; TICKET_LENGTH];
        self.read_within(stream, &mut raw).await?;
        let ticket = Ticket::parse(&raw)?;

        self.advance(SessionState::Resolving)?;
        let destination = self
            .ctx
            .broker
            .resolve(ticket.as_bytes(), self.caller.ip())
            .await?;
        let address = destination.address();
        info!("OPEN TUNNEL FROM {} to {}", self.caller, address);
        // From here the broker expects a stop notification, whatever happens.
        self.destination = Some(destination);

        self.advance(SessionState::ConnectingBackend)?;
        let connect_timeout = self.ctx.config.tunnel.connect_timeout();
        let mut backend = match tokio::time::timeout(connect_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(s)) => s,
            Ok(Err(source)) => return Err(SessionError::Backend { address, source }),
            Err(_) => {
                return Err(SessionError::Backend {
                    address,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };
        if let Err(e) = backend.set_nodelay(true) {
            warn!("TCP_NODELAY on {}: {}", address, e);
        }

        let _connection = self.worker.connection();
        write_all_flush(stream, RESPONSE_OK).await?;
        self.advance(SessionState::Relaying)?;

        let grace = self.ctx.config.tunnel.relay_grace();
        let outcome = relay(stream, &mut backend, &self.counter, grace).await;
        debug!(
            "{}: relay ended, {:?} first, cut: {}",
            self.caller, outcome.first, outcome.cut
        );
        match outcome.error {
            Some(e) => Err(SessionError::Relay(e)),
            None => Ok(()),
        }
    }

    async fn admin<S>(&mut self, stream: &mut S, command: Command) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.advance(SessionState::AwaitAdminSecret)?;
        let mut field = [0u8; SECRET_LENGTH];
        self.read_within(stream, &mut field).await?;
        info!("COMMAND: {}", command);

        let admin = &self.ctx.config.admin;
        let allowed = admin.is_allowed(self.caller.ip())
            && !admin.secret.is_empty()
            && protocol::decode_secret(&field) == admin.secret.as_bytes();
        if !allowed {
            return Err(SessionError::Forbidden);
        }

        let report = self.ctx.stats.report(command == Command::Stat);
        write_all_flush(stream, report.as_bytes()).await?;
        Ok(())
    }

    async fn read_within<S>(&self, stream: &mut S, buf: &mut [u8]) -> Result<(), SessionError>
    where
        S: AsyncRead + Unpin,
    {
        let deadline = Instant::now() + self.command_timeout();
        match protocol::read_field(stream, buf, deadline).await {
            ReadOutcome::Complete => Ok(()),
            ReadOutcome::TimedOut(received) => Err(SessionError::Timeout { received }),
            ReadOutcome::Eof(received) => Err(SessionError::ClientClosed { received }),
            ReadOutcome::Failed(e) => Err(SessionError::Io(e)),
        }
    }

    fn command_timeout(&self) -> Duration {
        self.ctx.config.tunnel.command_timeout()
    }

    /// Enters the terminal state and reports counters to the broker, once.
    fn finish(mut self, result: Result<(), SessionError>) -> SessionOutcome {
        let terminal = if result.is_ok() {
            SessionState::Closed
        } else {
            SessionState::Error
        };
        if !self.state.is_terminal() {
            self.state = terminal;
        }

        let sent = self.counter.sent();
        let recv = self.counter.recv();
        match self.destination.take() {
            Some(destination) => {
                info!(
                    "TERMINATED {} to {}, s:{}, r:{}, t:{}",
                    self.caller,
                    destination.address(),
                    sent,
                    recv,
                    self.started.elapsed().as_secs()
                );
                let broker = Arc::clone(&self.ctx.broker);
                let pending = self.worker.notify();
                tokio::spawn(async move {
                    broker
                        .notify_end(&destination.notify_ticket, sent, recv)
                        .await;
                    drop(pending);
                });
            }
            None => info!("TERMINATED {}", self.caller),
        }

        SessionOutcome {
            state: self.state,
            sent,
            recv,
            error: result.err(),
        }
    }
}

async fn write_all_flush<S>(stream: &mut S, data: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(data).await?;
    stream.flush().await
}

/// Writes a complete response; the caller closes afterwards.
async fn send_response<S>(stream: &mut S, code: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_all_flush(stream, code).await
}
