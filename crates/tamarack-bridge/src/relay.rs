//! Relay handshake toward the isolated daemon.
//!
//! The daemon listens on a vsock port inside the isolated environment;
//! the hypervisor exposes it through a forwarding unix socket with a
//! small line protocol: write `CONNECT <port>\n`, read back `OK <port>\n`.
//! After the acknowledgment the socket carries raw worker-protocol
//! bytes with no further envelope.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::time::timeout;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;

use crate::error::BridgeError;
use crate::error::Result;

/// Timeout for the unix-socket dial itself.
pub const DIAL_TIMEOUT: Duration = Duration::from_millis(100);

/// Timeout for writing the `CONNECT` line.
pub const CONNECT_WRITE_TIMEOUT: Duration = Duration::from_millis(100);

/// Timeout for the forwarder's acknowledgment line.
pub const ACK_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause between attempts while the environment is still coming up.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Overall deadline across all attempts.
pub const RETRY_DEADLINE: Duration = Duration::from_secs(20);

/// Longest acknowledgment line we will buffer.
const MAX_ACK_LINE: usize = 256;

/// Connect to the daemon's vsock port, retrying temporary failures
/// until [`RETRY_DEADLINE`] elapses.
///
/// The returned stream is positioned just past the acknowledgment;
/// everything on it from here on is worker-protocol traffic.
pub async fn connect(socket: &Path, port: u32) -> Result<UnixStream> {
    let start = Instant::now();
    loop {
        match try_connect(socket, port).await {
            Ok(stream) => return Ok(stream),
            Err(e) if e.is_temporary() => {
                if start.elapsed() >= RETRY_DEADLINE {
                    return Err(BridgeError::Unreachable {
                        waited: start.elapsed(),
                        source: Box::new(e),
                    });
                }
                trace!(error = %e, "relay not ready, retrying");
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// One handshake attempt: dial, `CONNECT`, acknowledgment.
async fn try_connect(socket: &Path, port: u32) -> Result<UnixStream> {
    let mut stream = timeout(DIAL_TIMEOUT, UnixStream::connect(socket))
        .await
        .map_err(|_| BridgeError::DialTimeout {
            path: socket.display().to_string(),
        })?
        .map_err(|source| BridgeError::Dial {
            path: socket.display().to_string(),
            source,
        })?;

    let request = format!("CONNECT {port}\n");
    timeout(CONNECT_WRITE_TIMEOUT, stream.write_all(request.as_bytes()))
        .await
        .map_err(|_| BridgeError::SendConnectTimeout)?
        .map_err(|source| BridgeError::SendConnect { source })?;

    let line = timeout(ACK_READ_TIMEOUT, read_ack_line(&mut stream))
        .await
        .map_err(|_| BridgeError::AckTimeout)??;

    // The remainder of the line is the assigned host-side port;
    // informational only.
    if !line.starts_with("OK ") {
        return Err(BridgeError::Refused { line });
    }
    debug!(port, ack = %line, "relay handshake complete");
    Ok(stream)
}

/// Read up to the first `\n`, exclusive.
///
/// Byte-at-a-time so nothing past the newline is consumed; the bytes
/// after it already belong to the daemon conversation.
async fn read_ack_line(stream: &mut UnixStream) -> Result<String> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let n = stream.read(&mut byte).await.map_err(|source| BridgeError::AckRead { source })?;
        if n == 0 {
            return Err(BridgeError::AckRead {
                source: io::Error::new(io::ErrorKind::UnexpectedEof, "closed before acknowledgment"),
            });
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_ACK_LINE {
            return Err(BridgeError::AckTooLong { limit: MAX_ACK_LINE });
        }
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}
