//! Command-line arguments.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;

/// Relay and protocol bridge for an isolated Nix build daemon.
#[derive(Debug, Parser)]
#[command(name = "tamarack-bridge")]
#[command(version)]
#[command(about = "SSH front door for an isolated Nix build daemon")]
pub struct Cli {
    /// Address to listen on for SSH connections.
    #[arg(long, default_value = "127.0.0.1:2022")]
    pub listen: SocketAddr,

    /// Forwarding unix socket that reaches the isolated daemon.
    #[arg(long, default_value = "vsock.sock")]
    pub vsock_socket: PathBuf,

    /// Guest-side vsock port the daemon listens on.
    #[arg(long, default_value_t = 1)]
    pub vsock_port: u32,

    /// How accepted channels are served.
    #[arg(long, value_enum, default_value_t = BackendKind::Builtin)]
    pub backend: BackendKind,

    /// Decode and log client traffic without answering (builtin backend only).
    #[arg(long)]
    pub observe: bool,

    /// Exec command accepted by the front door. Repeatable.
    #[arg(
        long = "command",
        default_values_t = [
            "nix-daemon --stdio".to_string(),
            "nix-store --serve --write".to_string(),
        ]
    )]
    pub commands: Vec<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Channel backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Forward raw bytes to the real daemon over the vsock relay.
    Relay,
    /// Answer the worker protocol in-process.
    Builtin,
}
