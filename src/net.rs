//! One-shot line exchange with a peer.
//!
//! The whole control plane speaks the same shape: connect, send one line,
//! read one line, close. Runners, the observer and the assigner all go
//! through this helper.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Connects to `addr`, sends `line` (newline appended) and reads one reply
/// line. The deadline applies separately to connect, write and read.
///
/// An empty string means the peer closed without replying.
pub async fn send_line(addr: &str, line: &str, deadline: Duration) -> Result<String> {
    let stream = timeout(deadline, TcpStream::connect(addr))
        .await
        .with_context(|| format!("timed out connecting to {}", addr))?
        .with_context(|| format!("failed to connect to {}", addr))?;
    let (reader, mut writer) = stream.into_split();

    timeout(
        deadline,
        writer.write_all(format!("{}\n", line.trim_end()).as_bytes()),
    )
    .await
    .with_context(|| format!("timed out sending to {}", addr))?
    .with_context(|| format!("failed to send to {}", addr))?;

    let mut reply = String::new();
    let mut reader = BufReader::new(reader);
    timeout(deadline, reader.read_line(&mut reply))
        .await
        .with_context(|| format!("timed out waiting for reply from {}", addr))?
        .with_context(|| format!("failed to read reply from {}", addr))?;
    Ok(reply.trim().to_string())
}
