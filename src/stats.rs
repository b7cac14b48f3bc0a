//! Server statistics and the shutdown log record.
//!
//! Counters live behind one mutex so a snapshot always satisfies
//! `active == accepted - closed - errored`, whichever runtime flavor runs
//! the connection tasks.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counters {
    accepted: u64,
    active: u64,
    closed: u64,
    errored: u64,
}

/// Process-wide connection statistics
#[derive(Debug)]
pub struct ServerStats {
    start: DateTime<Local>,
    end: OnceLock<DateTime<Local>>,
    counters: Mutex<Counters>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub active: u64,
    pub closed: u64,
    pub errored: u64,
}

/// How a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Closed,
    Errored,
}

impl ServerStats {
    /// Create stats with the start timestamp set to now
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start: Local::now(),
            end: OnceLock::new(),
            counters: Mutex::new(Counters::default()),
        })
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count a newly accepted connection.
    ///
    /// The returned guard records the outcome when finished or dropped; an
    /// unfinished guard counts as closed.
    pub fn connection_opened(self: &Arc<Self>) -> ConnectionGuard {
        let mut counters = self.counters();
        counters.accepted += 1;
        counters.active += 1;
        ConnectionGuard {
            stats: Arc::clone(self),
            outcome: None,
        }
    }

    fn connection_finished(&self, outcome: Outcome) {
        let mut counters = self.counters();
        counters.active = counters.active.saturating_sub(1);
        match outcome {
            Outcome::Closed => counters.closed += 1,
            Outcome::Errored => counters.errored += 1,
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = *self.counters();
        StatsSnapshot {
            accepted: c.accepted,
            active: c.active,
            closed: c.closed,
            errored: c.errored,
        }
    }

    pub fn start(&self) -> DateTime<Local> {
        self.start
    }

    #[allow(dead_code)]
    pub fn end(&self) -> Option<DateTime<Local>> {
        self.end.get().copied()
    }

    /// Set the end timestamp. Only the first call has an effect.
    pub fn mark_end(&self) -> DateTime<Local> {
        *self.end.get_or_init(Local::now)
    }
}

/// Tracks one live connection in [`ServerStats`]
#[derive(Debug)]
pub struct ConnectionGuard {
    stats: Arc<ServerStats>,
    outcome: Option<Outcome>,
}

impl ConnectionGuard {
    pub fn finish(mut self, outcome: Outcome) {
        self.outcome = Some(outcome);
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats
            .connection_finished(self.outcome.unwrap_or(Outcome::Closed));
    }
}

/// One line of the shutdown log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub start: String,
    pub end: String,
    pub total_conns: u64,
    pub conns_until_shutdown: u64,
    pub parallel_progress: bool,
}

impl LogRecord {
    pub fn new(
        start: DateTime<Local>,
        end: DateTime<Local>,
        total_conns: u64,
        conns_until_shutdown: u64,
        parallel_progress: bool,
    ) -> Self {
        Self {
            start: start.to_rfc3339(),
            end: end.to_rfc3339(),
            total_conns,
            conns_until_shutdown,
            parallel_progress,
        }
    }
}

/// Append `record` as one JSON line, creating the file and its directory
/// when missing.
pub async fn append_record(path: &Path, record: &LogRecord) -> Result<(), LogPersistError> {
    let mut line = serde_json::to_vec(record).map_err(LogPersistError::Serialize)?;
    line.push(b'\n');

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| LogPersistError::Io(path.to_path_buf(), e))?;
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| LogPersistError::Io(path.to_path_buf(), e))?;
    file.write_all(&line)
        .await
        .map_err(|e| LogPersistError::Io(path.to_path_buf(), e))?;
    file.flush()
        .await
        .map_err(|e| LogPersistError::Io(path.to_path_buf(), e))?;

    debug!(path = %path.display(), "Shutdown record written");
    Ok(())
}

/// Shutdown record persistence errors
#[derive(Debug)]
pub enum LogPersistError {
    Serialize(serde_json::Error),
    Io(PathBuf, std::io::Error),
}

impl std::fmt::Display for LogPersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogPersistError::Serialize(e) => write!(f, "Failed to encode log record: {e}"),
            LogPersistError::Io(path, e) => {
                write!(f, "Failed to write log file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for LogPersistError {}
