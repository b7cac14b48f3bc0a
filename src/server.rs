//! TCP server supervisor.
//!
//! Accepts connections, runs one session task per connection, keeps the
//! aggregate statistics and performs the orderly shutdown: stop accepting,
//! drain in-flight connections, stamp the end time, append the log record.
//!
//! Lifecycle: `Stopped -> Listening -> Draining -> Stopped`.

use crate::config::Config;
use crate::response::PayloadSource;
use crate::session::{handle_connection, SessionContext, SessionError, Strategy};
use crate::stats::{append_record, LogRecord, Outcome, ServerStats};
use bytes::Bytes;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Listen backlog
const LISTEN_BACKLOG: i32 = 1024;

/// Supervisor lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Stopped = 0,
    Listening = 1,
    Draining = 2,
}

impl Phase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Phase::Listening,
            2 => Phase::Draining,
            _ => Phase::Stopped,
        }
    }
}

/// Server instance, not yet bound
pub struct Server {
    config: Config,
    payload: PayloadSource,
}

impl Server {
    /// Create a server answering with the configured payload file
    pub fn new(config: Config) -> Self {
        let payload = PayloadSource::File(config.payload_path.clone());
        Self::with_payload(config, payload)
    }

    /// Create a server answering with an explicit payload source
    pub fn with_payload(config: Config, payload: PayloadSource) -> Self {
        Server { config, payload }
    }

    /// Bind the listener and begin accepting connections.
    ///
    /// Every connection accepted by this instance uses `strategy`.
    pub async fn start(&self, strategy: Strategy) -> std::io::Result<RunningServer> {
        let listen = self.config.listen_addr();
        let addr = tokio::net::lookup_host(&listen).await?.next().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no address found for {listen}"),
            )
        })?;
        let listener = create_listener(addr)?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            ctx: SessionContext {
                strategy,
                delimiter: Bytes::from(self.config.delimiter.clone()),
                buffer_size: self.config.buffer_size,
                idle_timeout: self.config.idle_timeout,
                payload: self.payload.clone(),
            },
            stats: ServerStats::new(),
            phase: AtomicU8::new(Phase::Listening as u8),
            shutdown_tx,
            connection_limit: Arc::new(Semaphore::new(self.config.max_connections)),
            fail_fast: self.config.fail_fast,
            drain_timeout: self.config.drain_timeout,
            stats_file: self.config.stats_file.clone(),
        });

        info!(address = %local_addr, strategy = ?strategy, "Server listening");

        let handle = tokio::spawn(supervise(listener, Arc::clone(&shared), shutdown_rx));

        Ok(RunningServer {
            local_addr,
            shared,
            handle,
        })
    }
}

/// State shared by the accept loop, connection tasks and the handle
struct Shared {
    ctx: SessionContext,
    stats: Arc<ServerStats>,
    phase: AtomicU8,
    shutdown_tx: watch::Sender<bool>,
    connection_limit: Arc<Semaphore>,
    fail_fast: bool,
    drain_timeout: Option<Duration>,
    stats_file: Option<PathBuf>,
}

impl Shared {
    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }
}

/// Handle to a listening server
pub struct RunningServer {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    handle: JoinHandle<LogRecord>,
}

#[allow(dead_code)] // Accessors are used by tests
impl RunningServer {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.shared.stats
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.shared.phase.load(Ordering::SeqCst))
    }

    /// Resolves once shutdown has been requested, either by [`stop`] or by
    /// a fail-fast connection error.
    ///
    /// [`stop`]: RunningServer::stop
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shared.shutdown_tx.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Stop accepting, drain in-flight connections and return the record
    /// that was appended to the log.
    pub async fn stop(self) -> Result<LogRecord, JoinError> {
        self.shared.shutdown_tx.send_replace(true);
        self.handle.await
    }
}

/// Accept loop and shutdown sequence
async fn supervise(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> LogRecord {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.wait_for(|stop| *stop) => break,

            Some(res) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = res {
                    error!(error = %e, "Connection task failed");
                }
            }

            accepted = accept(&listener, &shared.connection_limit) => match accepted {
                Ok((stream, addr, permit)) => {
                    spawn_connection(&mut connections, &shared, stream, addr, permit);
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            },
        }
    }

    drop(listener);
    shared.set_phase(Phase::Draining);

    let in_flight = shared.stats.snapshot().active;
    info!(in_flight, "Stopped accepting connections");

    drain(&mut connections, shared.drain_timeout).await;

    let end = shared.stats.mark_end();
    shared.set_phase(Phase::Stopped);

    let snapshot = shared.stats.snapshot();
    let record = LogRecord::new(
        shared.stats.start(),
        end,
        snapshot.accepted,
        in_flight,
        shared.ctx.strategy.is_parallel(),
    );

    if let Some(path) = &shared.stats_file {
        if let Err(e) = append_record(path, &record).await {
            error!(error = %e, "Failed to persist shutdown record");
        }
    }

    info!(
        total_conns = snapshot.accepted,
        closed = snapshot.closed,
        errored = snapshot.errored,
        "Server stopped"
    );
    record
}

async fn accept(
    listener: &TcpListener,
    limit: &Arc<Semaphore>,
) -> std::io::Result<(TcpStream, SocketAddr, OwnedSemaphorePermit)> {
    // Wait for a connection slot
    let permit = Arc::clone(limit)
        .acquire_owned()
        .await
        .map_err(std::io::Error::other)?;
    let (stream, addr) = listener.accept().await?;
    Ok((stream, addr, permit))
}

fn spawn_connection(
    connections: &mut JoinSet<()>,
    shared: &Arc<Shared>,
    stream: TcpStream,
    addr: SocketAddr,
    permit: OwnedSemaphorePermit,
) {
    let guard = shared.stats.connection_opened();
    debug!(peer = %addr, "New connection");

    let shared = Arc::clone(shared);
    connections.spawn(async move {
        let _permit = permit;
        match handle_connection(stream, &shared.ctx).await {
            Ok(summary) => {
                debug!(
                    peer = %addr,
                    bytes = summary.bytes_received,
                    responses = summary.responses,
                    "Connection closed"
                );
                guard.finish(Outcome::Closed);
            }
            Err(e) => {
                match &e {
                    SessionError::PayloadRead(_) => error!(peer = %addr, error = %e, "Response failed"),
                    _ => warn!(peer = %addr, error = %e, "Connection error"),
                }
                guard.finish(Outcome::Errored);

                if shared.fail_fast && e.is_connection_error() {
                    warn!(peer = %addr, "Stopping server after connection error");
                    shared.shutdown_tx.send_replace(true);
                }
            }
        }
    });
}

/// Wait for in-flight connections, aborting them once `limit` elapses.
async fn drain(connections: &mut JoinSet<()>, limit: Option<Duration>) {
    let wait_all = async {
        while let Some(res) = connections.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "Connection task failed");
            }
        }
    };

    match limit {
        None => wait_all.await,
        Some(limit) => {
            if tokio::time::timeout(limit, wait_all).await.is_err() {
                warn!(
                    remaining = connections.len(),
                    "Drain timeout elapsed, closing remaining connections"
                );
                connections.shutdown().await;
            }
        }
    }
}

fn create_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::parse_framed;
    use chrono::DateTime;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const DELIMITER: &[u8] = b"$::_$";
    const PAYLOAD: &[u8] = b"the quick brown payload";

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            delimiter: DELIMITER.to_vec(),
            buffer_size: 64 * 1024,
            strategy: Strategy::Sequential,
            workers: 1,
            max_connections: 100,
            idle_timeout: None,
            fail_fast: false,
            drain_timeout: None,
            payload_path: PathBuf::from("/nonexistent/payload.bin"),
            stats_file: None,
            log_level: "info".to_string(),
        }
    }

    async fn start(config: Config, strategy: Strategy) -> RunningServer {
        Server::with_payload(config, PayloadSource::Static(Bytes::from_static(PAYLOAD)))
            .start(strategy)
            .await
            .unwrap()
    }

    async fn wait_for_idle(server: &RunningServer) {
        for _ in 0..100 {
            if server.stats().snapshot().active == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connections did not finish");
    }

    fn framed_len(payload: &[u8]) -> usize {
        format!("Content-Length: {}\r\n\r\n", payload.len()).len() + payload.len()
    }

    #[tokio::test]
    async fn test_start_stop() {
        let server = start(test_config(), Strategy::Sequential).await;
        assert_eq!(server.phase(), Phase::Listening);
        let stats = Arc::clone(server.stats());

        let record = server.stop().await.unwrap();
        assert_eq!(record.total_conns, 0);
        assert_eq!(record.conns_until_shutdown, 0);
        assert!(!record.parallel_progress);
        assert_eq!(stats.snapshot().accepted, 0);

        let start = DateTime::parse_from_rfc3339(&record.start).unwrap();
        let end = DateTime::parse_from_rfc3339(&record.end).unwrap();
        assert!(end >= start);
        assert_eq!(stats.end().map(|e| e >= stats.start()), Some(true));
    }

    #[tokio::test]
    async fn test_sequential_without_delimiter_sends_nothing() {
        let server = start(test_config(), Strategy::Sequential).await;
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

        client.write_all(b"any example data").await.unwrap();
        let mut buf = [0u8; 64];
        let read = tokio::time::timeout(Duration::from_millis(100), client.read(&mut buf)).await;
        assert!(read.is_err(), "server must not respond without a delimiter");

        drop(client);
        wait_for_idle(&server).await;
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_sequential_with_delimiter() {
        let server = start(test_config(), Strategy::Sequential).await;
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

        client.write_all(b"any example data").await.unwrap();
        client.write_all(DELIMITER).await.unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"Content-Length: "));
        assert_eq!(response.len(), framed_len(PAYLOAD));
        assert_eq!(parse_framed(&response), Some((PAYLOAD.len(), PAYLOAD)));

        wait_for_idle(&server).await;
        let record = server.stop().await.unwrap();
        assert_eq!(record.total_conns, 1);
    }

    #[tokio::test]
    async fn test_sequential_delimiter_split_across_writes() {
        let server = start(test_config(), Strategy::Sequential).await;
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.set_nodelay(true).unwrap();

        client.write_all(b"data$::").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"_$").await.unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response.len(), framed_len(PAYLOAD));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_parallel_responds_once() {
        let server = start(test_config(), Strategy::Parallel).await;
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

        client.write_all(b"a").await.unwrap();
        let mut first = vec![0u8; framed_len(PAYLOAD)];
        client.read_exact(&mut first).await.unwrap();
        assert_eq!(parse_framed(&first), Some((PAYLOAD.len(), PAYLOAD)));

        client.write_all(b"second chunk").await.unwrap();
        client.write_all(DELIMITER).await.unwrap();
        client.shutdown().await.unwrap();

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "parallel mode responds once per connection");

        wait_for_idle(&server).await;
        let record = server.stop().await.unwrap();
        assert!(record.parallel_progress);
    }

    #[tokio::test]
    async fn test_file_payload_round_trip() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&payload).unwrap();
        file.flush().unwrap();

        let mut config = test_config();
        config.payload_path = file.path().to_path_buf();
        let server = Server::new(config).start(Strategy::Sequential).await.unwrap();

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(DELIMITER).await.unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let separator = response
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .unwrap();
        assert_eq!(&response[separator + 4..], &payload[..]);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_counters_track_connections() {
        let server = start(test_config(), Strategy::Sequential).await;

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect(server.local_addr()).await.unwrap());
        }
        for _ in 0..100 {
            if server.stats().snapshot().accepted == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let s = server.stats().snapshot();
        assert_eq!(s.accepted, 3);
        assert_eq!(s.active, 3);

        clients.clear();
        wait_for_idle(&server).await;

        let s = server.stats().snapshot();
        assert_eq!(s.accepted, 3);
        assert_eq!(s.closed, 3);
        assert_eq!(s.active, s.accepted - s.closed - s.errored);

        let record = server.stop().await.unwrap();
        assert_eq!(record.total_conns, 3);
        assert_eq!(record.conns_until_shutdown, 0);
    }

    #[tokio::test]
    async fn test_shutdown_record_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log").join("logs.log");

        let mut config = test_config();
        config.stats_file = Some(path.clone());
        let server = start(config, Strategy::Parallel).await;
        server.stop().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let line: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(line["totalConns"], 0);
        assert_eq!(line["connsUntilShutdown"], 0);
        assert_eq!(line["parallelProgress"], true);
    }

    #[tokio::test]
    async fn test_unwritable_log_does_not_block_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.stats_file = Some(dir.path().to_path_buf());

        let server = start(config, Strategy::Sequential).await;
        let record = server.stop().await.unwrap();
        assert_eq!(record.total_conns, 0);
    }

    #[tokio::test]
    async fn test_payload_failure_closes_only_that_connection() {
        let server = Server::new(test_config())
            .start(Strategy::Sequential)
            .await
            .unwrap();

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(DELIMITER).await.unwrap();
        let mut response = Vec::new();
        let _ = client.read_to_end(&mut response).await;
        assert!(response.is_empty());

        wait_for_idle(&server).await;
        assert_eq!(server.phase(), Phase::Listening);
        assert_eq!(server.stats().snapshot().errored, 1);

        // Still accepting
        TcpStream::connect(server.local_addr()).await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_overflow_closes_connection() {
        let mut config = test_config();
        config.buffer_size = 16;
        let server = start(config, Strategy::Sequential).await;

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        let _ = client.write_all(&[b'x'; 64]).await;
        let mut response = Vec::new();
        let _ = client.read_to_end(&mut response).await;
        assert!(response.is_empty());

        wait_for_idle(&server).await;
        assert_eq!(server.stats().snapshot().errored, 1);
        server.stop().await.unwrap();
    }

    fn reset(stream: TcpStream) {
        socket2::SockRef::from(&stream)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(stream);
    }

    #[tokio::test]
    async fn test_connection_error_isolated_by_default() {
        let server = start(test_config(), Strategy::Sequential).await;

        let client = TcpStream::connect(server.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        reset(client);
        wait_for_idle(&server).await;

        assert_eq!(server.phase(), Phase::Listening);
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(DELIMITER).await.unwrap();
        let mut first = vec![0u8; framed_len(PAYLOAD)];
        client.read_exact(&mut first).await.unwrap();

        drop(client);
        wait_for_idle(&server).await;
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_fast_stops_server() {
        let mut config = test_config();
        config.fail_fast = true;
        let server = start(config, Strategy::Sequential).await;

        let client = TcpStream::connect(server.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        reset(client);

        tokio::time::timeout(Duration::from_secs(2), server.shutdown_requested())
            .await
            .expect("connection error should request shutdown");

        let stats = Arc::clone(server.stats());
        let record = server.stop().await.unwrap();
        assert_eq!(record.total_conns, 1);
        assert_eq!(stats.snapshot().errored, 1);
    }

    #[tokio::test]
    async fn test_drain_timeout_aborts_idle_connections() {
        let mut config = test_config();
        config.drain_timeout = Some(Duration::from_millis(50));
        let server = start(config, Strategy::Sequential).await;

        let _client = TcpStream::connect(server.local_addr()).await.unwrap();
        for _ in 0..100 {
            if server.stats().snapshot().active == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stats = Arc::clone(server.stats());
        let record = server.stop().await.unwrap();
        assert_eq!(record.conns_until_shutdown, 1);
        assert_eq!(stats.snapshot().active, 0);
    }
}
