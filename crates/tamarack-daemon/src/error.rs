//! Error types for the protocol state machine.

use snafu::Snafu;
use tamarack_proto::ProtocolError;
use tamarack_proto::ProtocolVersion;
use tamarack_proto::WorkerOp;

/// Errors that end a worker-protocol session.
///
/// The wire has no resynchronization markers, so every variant tears
/// the connection down. `Unimplemented` is deliberate and distinct
/// from genuine protocol corruption.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DaemonError {
    /// Client opened with something other than the worker magic.
    #[snafu(display("protocol mismatch: expected client magic, got {got:#x}"))]
    BadMagic {
        got: u64,
    },

    /// Client version below the accepted minimum.
    #[snafu(display("client too old: version {version} (minimum {minimum})"))]
    ClientTooOld {
        version: ProtocolVersion,
        minimum: ProtocolVersion,
    },

    /// Opcode integer outside the protocol table.
    #[snafu(display("invalid op: unknown opcode {code}"))]
    UnknownOp {
        code: u64,
    },

    /// A known opcode this daemon deliberately does not service.
    #[snafu(display("not implemented: {op}"))]
    Unimplemented {
        op: WorkerOp,
    },

    /// The negotiated version is too old for the requested operation.
    #[snafu(display("unsupported client version {version} for {op} (needs minor >= {required_minor})"))]
    VersionGate {
        op: WorkerOp,
        version: ProtocolVersion,
        required_minor: u64,
    },

    /// The magic string preceding an imported archive did not match.
    #[snafu(display("archive magic mismatch: got {got:?}"))]
    NarMagicMismatch {
        got: String,
    },

    /// Wire-level decode/encode failure.
    #[snafu(context(false), display("{source}"))]
    Wire {
        source: ProtocolError,
    },
}

/// Result type for session operations.
pub type Result<T, E = DaemonError> = std::result::Result<T, E>;
