//! SSH front door and relay for an isolated Nix build daemon.
//!
//! An untrusted client connects over SSH (no authentication, exact
//! exec-command whitelist) and its channel bytes are either relayed to
//! the real daemon behind a vsock forwarding socket, or answered
//! in-process by the worker-protocol state machine in
//! `tamarack-daemon`.

pub mod bridge;
pub mod cli;
pub mod error;
pub mod front_door;
pub mod relay;

pub use bridge::Backend;
pub use error::BridgeError;
pub use error::Result;
