//! Per-connection session: buffering, delimiter detection and dispatch.
//!
//! [`Session`] is a synchronous state machine fed with raw chunks. It never
//! touches the socket; it only reports whether a framed response is due.
//! [`handle_connection`] drives it from an async stream.
//!
//! Two dispatch strategies exist:
//! - `Sequential`: respond each time the delimiter shows up in the stream.
//! - `Parallel`: respond once, to the first chunk received, regardless of
//!   the delimiter.

use crate::response::{write_framed, PayloadReadError, PayloadSource};
use crate::scanner;
use bytes::{Buf, Bytes, BytesMut};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, trace};

/// Read chunk size
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// When a connection gets its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Respond after the delimiter has been received.
    Sequential,
    /// Respond to the first received bytes, once per connection.
    Parallel,
}

impl Strategy {
    pub fn is_parallel(self) -> bool {
        matches!(self, Strategy::Parallel)
    }
}

/// What the driver should do after feeding a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep reading.
    Wait,
    /// Write one framed response, then call [`Session::responded`].
    Respond,
}

/// Buffer and dispatch state for one connection.
#[derive(Debug)]
pub struct Session {
    buffer: BytesMut,
    capacity: usize,
    delimiter: Bytes,
    strategy: Strategy,
    /// Parallel mode only: a response has gone out on this connection.
    sent: bool,
    responses: u64,
    bytes_received: u64,
    /// Overflow deferred so an owed parallel response goes out first.
    overflowed: Option<usize>,
}

impl Session {
    pub fn new(strategy: Strategy, delimiter: Bytes, capacity: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            capacity,
            delimiter,
            strategy,
            sent: false,
            responses: 0,
            bytes_received: 0,
            overflowed: None,
        }
    }

    /// Feed one inbound chunk.
    ///
    /// Every complete delimiter is consumed from the buffer together with
    /// the bytes before it; whatever follows the last one stays buffered as
    /// the start of the next message. If the retained bytes exceed the
    /// capacity the chunk fails with [`SessionError::BufferOverflow`]. A
    /// parallel session that still owes its response gets `Respond` first
    /// and the overflow is reported on the next chunk.
    pub fn on_chunk(&mut self, chunk: &[u8]) -> Result<Action, SessionError> {
        if let Some(attempted) = self.overflowed.take() {
            return Err(SessionError::BufferOverflow {
                capacity: self.capacity,
                attempted,
            });
        }

        self.bytes_received += chunk.len() as u64;
        self.buffer.extend_from_slice(chunk);

        let mut found = false;
        let mut next = scanner::find_appended(&self.buffer, chunk.len(), &self.delimiter);
        while let Some(pos) = next {
            found = true;
            self.buffer.advance(pos + self.delimiter.len());
            next = scanner::find(&self.buffer, &self.delimiter);
        }
        if found {
            trace!(strategy = ?self.strategy, pending = self.buffer.len(), "Delimiter received");
        }

        if self.buffer.len() > self.capacity {
            let attempted = self.buffer.len();
            self.buffer.clear();
            if self.strategy.is_parallel() && !self.sent {
                self.overflowed = Some(attempted);
                return Ok(Action::Respond);
            }
            return Err(SessionError::BufferOverflow {
                capacity: self.capacity,
                attempted,
            });
        }

        let action = match self.strategy {
            Strategy::Sequential if found => Action::Respond,
            Strategy::Sequential => Action::Wait,
            Strategy::Parallel if !self.sent => Action::Respond,
            Strategy::Parallel => Action::Wait,
        };
        Ok(action)
    }

    /// Record that a framed response was written.
    pub fn responded(&mut self) {
        self.sent = true;
        self.responses += 1;
    }

    /// Bytes currently buffered.
    #[allow(dead_code)]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            bytes_received: self.bytes_received,
            responses: self.responses,
        }
    }
}

/// Totals for a finished connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSummary {
    pub bytes_received: u64,
    pub responses: u64,
}

/// Everything a connection task needs, shared by all connections.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub strategy: Strategy,
    pub delimiter: Bytes,
    pub buffer_size: usize,
    pub idle_timeout: Option<Duration>,
    pub payload: PayloadSource,
}

impl SessionContext {
    fn new_session(&self) -> Session {
        Session::new(self.strategy, self.delimiter.clone(), self.buffer_size)
    }
}

/// Serve one client until it closes the stream or a fault occurs.
pub async fn handle_connection<S>(
    mut stream: S,
    ctx: &SessionContext,
) -> Result<SessionSummary, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = ctx.new_session();
    let mut chunk = BytesMut::with_capacity(READ_CHUNK_SIZE);

    loop {
        chunk.clear();
        let n = within(ctx.idle_timeout, stream.read_buf(&mut chunk)).await?;
        if n == 0 {
            trace!("Connection closed by client");
            return Ok(session.summary());
        }

        if session.on_chunk(&chunk)? == Action::Respond {
            let payload = ctx.payload.load().await?;
            let written = within(ctx.idle_timeout, write_framed(&mut stream, payload)).await?;
            session.responded();
            debug!(bytes = written, strategy = ?session.strategy(), "Sent framed response");
        }
    }
}

/// Run one socket operation under the idle limit, if any.
async fn within<F, T>(limit: Option<Duration>, op: F) -> Result<T, SessionError>
where
    F: Future<Output = std::io::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, op)
            .await
            .map_err(|_| SessionError::IdleTimeout(limit))?
            .map_err(SessionError::from),
        None => Ok(op.await?),
    }
}

/// Per-connection failures.
#[derive(Debug)]
pub enum SessionError {
    /// Socket-level read or write failure.
    Io(std::io::Error),
    /// The response payload could not be loaded.
    PayloadRead(PayloadReadError),
    /// The client sent more undelimited bytes than the buffer holds.
    BufferOverflow { capacity: usize, attempted: usize },
    /// A read or a response write made no progress within the idle timeout.
    IdleTimeout(Duration),
}

impl SessionError {
    /// Socket-level faults, the ones a fail-fast supervisor escalates.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, SessionError::Io(_))
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Io(e) => write!(f, "Connection error: {e}"),
            SessionError::PayloadRead(e) => write!(f, "{e}"),
            SessionError::BufferOverflow {
                capacity,
                attempted,
            } => write!(
                f,
                "Receive buffer overflow: {attempted} bytes exceeds capacity of {capacity}"
            ),
            SessionError::IdleTimeout(limit) => {
                write!(f, "Connection idle for {}s", limit.as_secs_f64())
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Io(e) => Some(e),
            SessionError::PayloadRead(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e)
    }
}

impl From<PayloadReadError> for SessionError {
    fn from(e: PayloadReadError) -> Self {
        SessionError::PayloadRead(e)
    }
}
