//! Connection supervisor.
//!
//! Owns one accepted connection from accept to close: idle deadline,
//! line loop, per-host log lease, fault containment and lifecycle logs.

use bytes::Bytes;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinError;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::chatlog::{host_key, ChatLog, HostLease};
use crate::config::Config;
use crate::protocol::{trim, Command, FrameError, LineFramer, Next};

const LINE_TOO_LONG_NOTICE: &[u8] = b"[!] Line too long, closing connection\n";

/// Per-connection protocol limits
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub idle_timeout: Duration,
    pub max_message_size: usize,
    pub max_line_bytes: usize,
}

impl From<&Config> for Limits {
    fn from(config: &Config) -> Self {
        Limits {
            idle_timeout: config.idle_timeout,
            max_message_size: config.max_message_size,
            max_line_bytes: config.max_line_bytes,
        }
    }
}

/// I/O direction, for error reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Read => write!(f, "read"),
            Op::Write => write!(f, "write"),
        }
    }
}

/// How a session ended cleanly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its side of the stream
    PeerClosed,
    /// `/quit` or `bye`
    Terminated,
}

/// How a session ended badly
#[derive(Debug)]
pub enum SessionError {
    /// Idle deadline passed during a read or write
    Timeout(Op),
    /// Socket failure
    Io(Op, std::io::Error),
    /// Peer sent more than the line bound without a newline
    LineTooLong(usize),
}

impl SessionError {
    /// Reset, broken pipe and friends: the peer is already gone.
    pub fn is_peer_gone(&self) -> bool {
        use std::io::ErrorKind;

        match self {
            SessionError::Io(_, e) => matches!(
                e.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Timeout(op) => write!(f, "{} timeout", op),
            SessionError::Io(op, e) => write!(f, "{} error: {}", op, e),
            SessionError::LineTooLong(limit) => {
                write!(f, "line exceeds {} bytes without a newline", limit)
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Io(_, e) => Some(e),
            _ => None,
        }
    }
}

/// A panic caught at the connection boundary
#[derive(Debug)]
pub struct Fault(String);

impl From<JoinError> for Fault {
    fn from(e: JoinError) -> Self {
        if !e.is_panic() {
            return Fault(e.to_string());
        }

        let payload = e.into_panic();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Fault(message)
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for Fault {}

/// Run `fut` as its own task so a panic inside it stops only that task.
pub async fn contain<F>(fut: F) -> Result<F::Output, Fault>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(fut).await.map_err(Fault::from)
}

/// Supervise one accepted connection until it closes.
///
/// Never fails: every error is classified and logged here.
pub async fn supervise(stream: TcpStream, peer: SocketAddr, log: Arc<ChatLog>, limits: Limits) {
    let started = std::time::Instant::now();
    info!(peer = %peer, "Connection opened");

    let lease = log.acquire(&host_key(&peer));
    let result = contain(serve(stream, peer, lease, limits)).await;

    match result {
        Ok(Ok(CloseReason::PeerClosed)) => debug!(peer = %peer, "Peer closed connection"),
        Ok(Ok(CloseReason::Terminated)) => debug!(peer = %peer, "Session ended by command"),
        Ok(Err(SessionError::Timeout(op))) => info!(peer = %peer, %op, "Idle timeout"),
        Ok(Err(e)) if e.is_peer_gone() => info!(peer = %peer, error = %e, "Connection closed"),
        Ok(Err(e)) => warn!(peer = %peer, error = %e, "Connection error"),
        Err(fault) => error!(peer = %peer, fault = %fault, "Recovered from fault in connection"),
    }

    let duration_ms = round_millis(started.elapsed());
    info!(peer = %peer, duration_ms, "Disconnected");
}

/// Whole milliseconds, rounded half up.
fn round_millis(elapsed: Duration) -> u64 {
    (elapsed + Duration::from_micros(500)).as_millis() as u64
}

/// Socket-owning body of a supervised connection.
async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    lease: HostLease,
    limits: Limits,
) -> Result<CloseReason, SessionError> {
    let (reader, writer) = stream.into_split();
    Session::new(peer, reader, writer, lease, limits).run().await
}

/// The line loop over one connection's halves
pub struct Session<R, W> {
    peer: SocketAddr,
    framer: LineFramer<R>,
    writer: W,
    lease: HostLease,
    limits: Limits,
    deadline: Instant,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(peer: SocketAddr, reader: R, writer: W, lease: HostLease, limits: Limits) -> Self {
        Session {
            peer,
            framer: LineFramer::new(reader, limits.max_line_bytes),
            writer,
            lease,
            limits,
            deadline: Instant::now() + limits.idle_timeout,
        }
    }

    /// Serve lines until the peer leaves, a command ends the session, or an
    /// error occurs. The write half is shut down on clean exits.
    pub async fn run(mut self) -> Result<CloseReason, SessionError> {
        let result = self.serve_lines().await;

        match &result {
            Ok(_) => {
                if let Err(e) = self.writer.shutdown().await {
                    debug!(peer = %self.peer, error = %e, "Error closing connection");
                }
            }
            Err(SessionError::LineTooLong(_)) => {
                // Best effort; the connection is going away either way.
                let _ = self.write(LINE_TOO_LONG_NOTICE).await;
            }
            Err(_) => {}
        }

        result
    }

    async fn serve_lines(&mut self) -> Result<CloseReason, SessionError> {
        loop {
            let Some(raw) = self.read_line().await? else {
                return Ok(CloseReason::PeerClosed);
            };
            let line = trim(&raw);

            let command = Command::parse(line, self.limits.max_message_size);
            trace!(peer = %self.peer, ?command, "Processing line");
            if let Command::Chat { truncated: true, .. } = command {
                warn!(peer = %self.peer, len = line.len(), "Truncated message");
            }
            let outcome = command.execute();

            if let Err(e) = self.lease.append(line).await {
                warn!(peer = %self.peer, error = %e, "Failed to log message");
            }

            if let Some(reply) = outcome.reply {
                self.write(&reply).await?;
            }

            if outcome.next == Next::Terminate {
                return Ok(CloseReason::Terminated);
            }
        }
    }

    async fn read_line(&mut self) -> Result<Option<Bytes>, SessionError> {
        match timeout_at(self.deadline, self.framer.next_line()).await {
            Err(_) => Err(SessionError::Timeout(Op::Read)),
            Ok(Err(FrameError::Io(e))) => Err(SessionError::Io(Op::Read, e)),
            Ok(Err(FrameError::LineTooLong { limit })) => Err(SessionError::LineTooLong(limit)),
            Ok(Ok(line)) => {
                self.touch();
                Ok(line)
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), SessionError> {
        match timeout_at(self.deadline, self.writer.write_all(data)).await {
            Err(_) => Err(SessionError::Timeout(Op::Write)),
            Ok(Err(e)) => Err(SessionError::Io(Op::Write, e)),
            Ok(Ok(())) => {
                self.touch();
                Ok(())
            }
        }
    }

    /// Push the idle deadline out after successful I/O.
    fn touch(&mut self) {
        self.deadline = Instant::now() + self.limits.idle_timeout;
    }
}
