//! Serving an accepted channel against a backend.

use std::path::PathBuf;

use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tracing::debug;

use tamarack_daemon::ResponseMode;
use tamarack_daemon::Session;

use crate::error::BridgeError;
use crate::error::Result;
use crate::relay;

/// Where the bytes of an accepted channel go.
#[derive(Debug, Clone)]
pub enum Backend {
    /// Pump raw bytes to the real daemon behind the forwarding socket.
    Relay { socket: PathBuf, port: u32 },
    /// Speak the worker protocol in-process.
    Builtin { mode: ResponseMode },
}

/// Drive one channel to completion against the configured backend.
///
/// Errors are scoped to this channel; the caller logs them and keeps
/// serving its siblings.
pub async fn serve_channel<S>(mut stream: S, backend: Backend) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match backend {
        Backend::Relay { socket, port } => {
            let mut upstream = relay::connect(&socket, port).await?;
            let (to_daemon, to_client) = tokio::io::copy_bidirectional(&mut stream, &mut upstream)
                .await
                .map_err(|source| BridgeError::Pump { source })?;
            debug!(to_daemon, to_client, "relay channel finished");
            Ok(())
        }
        Backend::Builtin { mode } => Session::new(stream, mode).run().await.map_err(|source| BridgeError::Session { source }),
    }
}
