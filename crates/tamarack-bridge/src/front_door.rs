//! SSH front door.
//!
//! Accepts TCP connections and runs an SSH server over them with a
//! host key generated fresh at startup. Client authentication is
//! accepted unconditionally: the listener is only reachable on an
//! isolated network, and the exec-command filter is the actual
//! admission decision. Each session channel whose exec request matches
//! an allowed command verbatim is bridged to the backend; everything
//! else gets a failure reply and the channel stays open.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use rand_core::OsRng;
use russh::keys::Algorithm;
use russh::keys::PrivateKey;
use russh::server::Auth;
use russh::server::Config;
use russh::server::Handler;
use russh::server::Msg;
use russh::server::Server;
use russh::server::Session;
use russh::Channel;
use russh::ChannelId;
use russh::Pty;
use tokio::net::TcpListener;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::bridge::serve_channel;
use crate::bridge::Backend;
use crate::error::BridgeError;
use crate::error::Result;

/// Listen for SSH connections and serve channels until the process is
/// stopped. Only returns on listener failure.
pub async fn run(listen: SocketAddr, commands: Vec<String>, backend: Backend) -> Result<()> {
    let listener = TcpListener::bind(listen).await.map_err(|source| BridgeError::Listen { source })?;
    serve(listener, commands, backend).await
}

/// Serve SSH on an already-bound listener.
pub async fn serve(listener: TcpListener, commands: Vec<String>, backend: Backend) -> Result<()> {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| BridgeError::HostKey { message: e.to_string() })?;

    let config = Arc::new(Config {
        keys: vec![key],
        ..Config::default()
    });

    let listen = listener.local_addr().map_err(|source| BridgeError::Listen { source })?;
    info!(%listen, commands = ?commands, "front door listening");

    let mut server = FrontDoor {
        commands: Arc::from(commands),
        backend,
    };
    server
        .run_on_socket(config, &listener)
        .await
        .map_err(|source| BridgeError::Listen { source })
}

/// Exact-match filter over the exec payload. No shell parsing, no
/// prefix matching.
pub fn command_allowed(allowed: &[String], command: &str) -> bool {
    allowed.iter().any(|c| c == command)
}

struct FrontDoor {
    commands: Arc<[String]>,
    backend: Backend,
}

impl Server for FrontDoor {
    type Handler = ClientSession;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> ClientSession {
        debug!(?peer, "client connected");
        ClientSession {
            peer,
            commands: self.commands.clone(),
            backend: self.backend.clone(),
            channels: HashMap::new(),
        }
    }
}

/// Per-connection SSH state. Channels are parked here between being
/// opened and receiving their exec request.
pub struct ClientSession {
    peer: Option<SocketAddr>,
    commands: Arc<[String]>,
    backend: Backend,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

impl Handler for ClientSession {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        debug!(peer = ?self.peer, user, "accepting unauthenticated client");
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data);
        if !command_allowed(&self.commands, &command) {
            warn!(peer = ?self.peer, %command, "rejecting exec request");
            session.channel_failure(channel_id)?;
            return Ok(());
        }

        let Some(channel) = self.channels.remove(&channel_id) else {
            // Exec on a channel we never parked; refuse it.
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        info!(peer = ?self.peer, %command, "bridging channel");
        session.channel_success(channel_id)?;

        let backend = self.backend.clone();
        // One task per channel; a failure here must not touch siblings.
        tokio::spawn(async move {
            if let Err(e) = serve_channel(channel.into_stream(), backend).await {
                warn!(error = %e, "channel bridge failed");
            }
        });
        Ok(())
    }

    // Non-exec channel requests are refused but leave the channel open
    // for a later exec. The failure packet is dropped by russh when the
    // client did not ask for a reply.

    async fn shell_request(&mut self, channel_id: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        debug!(peer = ?self.peer, "refusing shell request");
        session.channel_failure(channel_id)?;
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = ?self.peer, "refusing pty request");
        session.channel_failure(channel_id)?;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = ?self.peer, name, "refusing subsystem request");
        session.channel_failure(channel_id)?;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        _value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(peer = ?self.peer, name, "refusing env request");
        session.channel_failure(channel_id)?;
        Ok(())
    }
}
