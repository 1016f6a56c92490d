//! Error types for the front door and relay.

use std::io;
use std::time::Duration;

use snafu::Snafu;
use tamarack_daemon::DaemonError;

/// Errors raised while accepting clients or reaching the daemon.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BridgeError {
    #[snafu(display("failed to dial forwarding socket {path}: {source}"))]
    Dial {
        path: String,
        source: io::Error,
    },

    #[snafu(display("timed out dialing forwarding socket {path}"))]
    DialTimeout {
        path: String,
    },

    #[snafu(display("failed to send connect request: {source}"))]
    SendConnect {
        source: io::Error,
    },

    #[snafu(display("timed out sending connect request"))]
    SendConnectTimeout,

    #[snafu(display("failed to read relay acknowledgment: {source}"))]
    AckRead {
        source: io::Error,
    },

    #[snafu(display("timed out waiting for relay acknowledgment"))]
    AckTimeout,

    #[snafu(display("relay acknowledgment exceeded {limit} bytes"))]
    AckTooLong {
        limit: usize,
    },

    /// The forwarder answered with something other than `OK <port>`.
    #[snafu(display("relay refused connection: {line:?}"))]
    Refused {
        line: String,
    },

    /// Retries ran out; carries the last attempt's failure.
    #[snafu(display("relay unreachable after {:?}: {}", waited, source))]
    Unreachable {
        waited: Duration,
        source: Box<BridgeError>,
    },

    #[snafu(display("failed to generate host key: {message}"))]
    HostKey {
        message: String,
    },

    #[snafu(display("ssh listener failed: {source}"))]
    Listen {
        source: io::Error,
    },

    #[snafu(display("relay pump failed: {source}"))]
    Pump {
        source: io::Error,
    },

    #[snafu(display("worker session failed: {source}"))]
    Session {
        source: DaemonError,
    },
}

impl BridgeError {
    /// Whether retrying the relay handshake can plausibly succeed.
    ///
    /// The forwarding socket appears on disk and the guest port starts
    /// listening some time after the isolated environment boots, so
    /// absent sockets, refused dials, handshake timeouts, and hang-ups
    /// while awaiting the ack are all expected to clear. A failed
    /// `CONNECT` write and an explicit refusal line are decisions, not
    /// races.
    pub fn is_temporary(&self) -> bool {
        match self {
            Self::Dial { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::NotFound
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            Self::AckRead { source } => {
                matches!(source.kind(), io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset)
            }
            Self::DialTimeout { .. } | Self::SendConnectTimeout | Self::AckTimeout => true,
            _ => false,
        }
    }
}

/// Result type for bridge operations.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_socket_is_temporary() {
        let err = BridgeError::Dial {
            path: "vsock.sock".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        };
        assert!(err.is_temporary());
    }

    #[test]
    fn hangup_awaiting_the_ack_is_temporary() {
        let err = BridgeError::AckRead {
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "closed before acknowledgment"),
        };
        assert!(err.is_temporary());
    }

    #[test]
    fn connect_write_failure_is_permanent() {
        let err = BridgeError::SendConnect {
            source: io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"),
        };
        assert!(!err.is_temporary());
    }

    #[test]
    fn refusal_is_permanent() {
        let err = BridgeError::Refused {
            line: "ERR no listener".to_string(),
        };
        assert!(!err.is_temporary());

        let err = BridgeError::Dial {
            path: "vsock.sock".to_string(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(!err.is_temporary());
    }
}
