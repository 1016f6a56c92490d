//! Worker-protocol state machine.
//!
//! Drives one connection through the daemon side of the Nix worker
//! protocol: magic exchange, version negotiation, then a strict
//! request/response op loop. A handful of operations get
//! fabricated-but-conformant replies; everything else fails the
//! session loudly, because a silently misparsed stream can never be
//! resynchronized.
//!
//! The session is connection-local: construct one per accepted
//! channel, run it to completion, drop it. Nothing is shared.

mod error;
mod session;

pub use error::DaemonError;
pub use error::Result;
pub use session::ResponseMode;
pub use session::Session;
