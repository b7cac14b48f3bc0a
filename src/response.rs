//! Framed payload responses.
//!
//! Wire format:
//!
//! ```text
//! Content-Length: <decimal length>\r\n
//! \r\n
//! <payload bytes>
//! ```
//!
//! There is no status line and no other header. The payload is loaded
//! again for every response so that edits to the file are picked up
//! without a restart.

use bytes::Bytes;
use std::path::PathBuf;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Header prefix of every framed response.
pub const CONTENT_LENGTH: &str = "Content-Length: ";

/// Line terminator used by the header and the blank separator line.
pub const CRLF: &[u8] = b"\r\n";

/// Where response bytes come from.
#[derive(Debug, Clone)]
pub enum PayloadSource {
    /// Read from disk on every response.
    File(PathBuf),
    /// Fixed in-memory bytes.
    Static(Bytes),
}

impl PayloadSource {
    /// Load the payload bytes.
    pub async fn load(&self) -> Result<Bytes, PayloadReadError> {
        match self {
            PayloadSource::File(path) => tokio::fs::read(path)
                .await
                .map(Bytes::from)
                .map_err(|e| PayloadReadError {
                    path: path.clone(),
                    source: e,
                }),
            PayloadSource::Static(bytes) => Ok(bytes.clone()),
        }
    }
}

/// The payload could not be loaded.
#[derive(Debug)]
pub struct PayloadReadError {
    pub path: PathBuf,
    pub source: std::io::Error,
}

impl std::fmt::Display for PayloadReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Failed to read payload '{}': {}",
            self.path.display(),
            self.source
        )
    }
}

impl std::error::Error for PayloadReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Split a payload into the three chunks written to the client, in order.
pub fn frame(payload: Bytes) -> [Bytes; 3] {
    let header = format!("{CONTENT_LENGTH}{}\r\n", payload.len());
    [Bytes::from(header), Bytes::from_static(CRLF), payload]
}

/// Write one framed response and flush it.
///
/// Returns the total number of bytes written.
pub async fn write_framed<W>(writer: &mut W, payload: Bytes) -> std::io::Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    for chunk in frame(payload) {
        writer.write_all(&chunk).await?;
        written += chunk.len();
    }
    writer.flush().await?;
    Ok(written)
}

/// Split a complete framed response into its declared length and payload.
///
/// Returns `None` if the header is malformed or the body is shorter than
/// declared. Used by tests and diagnostic clients.
#[allow(dead_code)]
pub fn parse_framed(input: &[u8]) -> Option<(usize, &[u8])> {
    let rest = input.strip_prefix(CONTENT_LENGTH.as_bytes())?;
    let line_end = rest.windows(2).position(|w| w == CRLF)?;
    let length: usize = std::str::from_utf8(&rest[..line_end]).ok()?.parse().ok()?;
    let body = rest[line_end + 2..].strip_prefix(CRLF)?;
    if body.len() < length {
        return None;
    }
    Some((length, &body[..length]))
}
