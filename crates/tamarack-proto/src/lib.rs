//! Wire primitives for the Nix worker protocol.
//!
//! This crate is the leaf of the bridge: little-endian integer and
//! padded-string codecs, the length-prefixed framed-stream adapter used
//! by the bulk store-import operation, the NAR archive grammar
//! validator, and the opcode/record tables shared by everything that
//! speaks the protocol.
//!
//! ## Wire Format
//! ```text
//! u64:    8 bytes, little endian
//! string: u64 length | payload | zero padding to a multiple of 8
//! list:   u64 count  | count strings
//! ```
//!
//! All codec functions are generic over `AsyncRead`/`AsyncWrite` so
//! they behave identically on a live connection and on a
//! [`FramedReader`] wrapping one.

mod codec;
mod error;
mod framed;
mod nar;
mod ops;
mod types;

pub use codec::padded_len;
pub use codec::read_bytes;
pub use codec::read_string;
pub use codec::read_strings;
pub use codec::read_u64;
pub use codec::write_string;
pub use codec::write_strings;
pub use codec::write_u64;
pub use codec::MAX_STRING_LEN;
pub use error::ProtocolError;
pub use error::Result;
pub use framed::FramedReader;
pub use framed::MAX_FRAME_LEN;
pub use nar::validate_archive;
pub use nar::MAX_NAR_DEPTH;
pub use nar::NAR_VERSION_MAGIC;
pub use ops::BuildStatus;
pub use ops::WorkerOp;
pub use types::BuildResult;
pub use types::DerivationOutput;
pub use types::DerivationRequest;
pub use types::PathInfo;
pub use types::ProtocolVersion;

/// Magic the client sends to open a worker-protocol session.
pub const WORKER_MAGIC_1: u64 = 0x6e697863;

/// Magic the server sends back.
pub const WORKER_MAGIC_2: u64 = 0x6478696f;

/// Sentinel ending the log-stream framing before a reply payload.
pub const STDERR_LAST: u64 = 0x616c7473;
