//! tamarack-bridge binary.

use clap::Parser;
use tracing::error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tamarack_bridge::cli::BackendKind;
use tamarack_bridge::cli::Cli;
use tamarack_bridge::front_door;
use tamarack_bridge::Backend;
use tamarack_daemon::ResponseMode;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %cli.listen,
        backend = ?cli.backend,
        "starting tamarack-bridge"
    );

    let backend = match cli.backend {
        BackendKind::Relay => Backend::Relay {
            socket: cli.vsock_socket.clone(),
            port: cli.vsock_port,
        },
        BackendKind::Builtin => Backend::Builtin {
            mode: if cli.observe {
                ResponseMode::Observe
            } else {
                ResponseMode::Respond
            },
        },
    };

    if let Err(e) = front_door::run(cli.listen, cli.commands, backend).await {
        error!("front door failed: {e}");
        std::process::exit(1);
    }
}
