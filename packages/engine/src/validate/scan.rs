use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use common::storage::BoxReader;

use crate::config::VirusScanConfig;

/// Result of a completed scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    /// Scanner matched a signature; carries the threat name.
    Infected(String),
}

/// Scanner-side failure: unreachable daemon, timeout, protocol surprise.
///
/// Distinct from a verdict so the caller can apply its fail-open policy:
/// warn and proceed, rather than block the upload.
#[derive(Debug)]
pub struct ScanError(pub String);

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "virus scan failed: {}", self.0)
    }
}

impl std::error::Error for ScanError {}

/// Stream content through a clamd-compatible daemon.
///
/// Wire protocol: send `nINSTREAM\n`, then chunks as a 4-byte big-endian
/// length prefix followed by the bytes, terminated by a zero-length chunk;
/// the daemon answers with a single line.
pub async fn scan_stream(
    config: &VirusScanConfig,
    reader: BoxReader,
) -> Result<ScanVerdict, ScanError> {
    let timeout = Duration::from_secs(config.timeout_secs);
    tokio::time::timeout(timeout, scan_inner(config, reader))
        .await
        .map_err(|_| ScanError(format!("scanner timed out after {}s", config.timeout_secs)))?
}

async fn scan_inner(
    config: &VirusScanConfig,
    mut reader: BoxReader,
) -> Result<ScanVerdict, ScanError> {
    let addr = format!("{}:{}", config.host, config.port);
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|e| ScanError(format!("cannot reach scanner at {addr}: {e}")))?;
    let (read_half, mut write_half) = stream.into_split();

    write_half
        .write_all(b"nINSTREAM\n")
        .await
        .map_err(|e| ScanError(format!("command write failed: {e}")))?;

    let mut buf = vec![0u8; 8192];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| ScanError(format!("content read failed: {e}")))?;
        if n == 0 {
            break;
        }
        write_half
            .write_all(&(n as u32).to_be_bytes())
            .await
            .map_err(|e| ScanError(format!("chunk write failed: {e}")))?;
        write_half
            .write_all(&buf[..n])
            .await
            .map_err(|e| ScanError(format!("chunk write failed: {e}")))?;
    }

    // Zero-length chunk ends the stream.
    write_half
        .write_all(&0u32.to_be_bytes())
        .await
        .map_err(|e| ScanError(format!("terminator write failed: {e}")))?;
    write_half
        .flush()
        .await
        .map_err(|e| ScanError(format!("flush failed: {e}")))?;

    let mut response = Vec::new();
    let mut buffered = BufReader::new(read_half);
    buffered
        .read_to_end(&mut response)
        .await
        .map_err(|e| ScanError(format!("response read failed: {e}")))?;

    let line = String::from_utf8_lossy(&response);
    let line = line.trim_end_matches(['\0', '\n', '\r']).trim();
    debug!(response = line, "scanner response");

    parse_response(line)
}

/// Parse one clamd response line.
///
/// `stream: OK` is clean; `stream: <Threat> FOUND` is infected; anything
/// else is a scanner error.
fn parse_response(line: &str) -> Result<ScanVerdict, ScanError> {
    if line.ends_with("FOUND") {
        let threat = line
            .rsplit_once(": ")
            .map(|(_, rest)| rest.trim_end_matches("FOUND").trim())
            .filter(|t| !t.is_empty())
            .unwrap_or("unknown")
            .to_string();
        return Ok(ScanVerdict::Infected(threat));
    }
    if line.ends_with("OK") {
        return Ok(ScanVerdict::Clean);
    }
    Err(ScanError(format!("unexpected scanner response: {line}")))
}
