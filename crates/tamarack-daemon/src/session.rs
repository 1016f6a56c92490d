//! One worker-protocol connection, from magic exchange to teardown.

use std::io;

use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use tamarack_proto::read_string;
use tamarack_proto::read_strings;
use tamarack_proto::read_u64;
use tamarack_proto::validate_archive;
use tamarack_proto::write_string;
use tamarack_proto::write_u64;
use tamarack_proto::BuildResult;
use tamarack_proto::BuildStatus;
use tamarack_proto::DerivationRequest;
use tamarack_proto::FramedReader;
use tamarack_proto::PathInfo;
use tamarack_proto::ProtocolError;
use tamarack_proto::ProtocolVersion;
use tamarack_proto::WorkerOp;
use tamarack_proto::NAR_VERSION_MAGIC;
use tamarack_proto::STDERR_LAST;
use tamarack_proto::WORKER_MAGIC_1;
use tamarack_proto::WORKER_MAGIC_2;

use crate::error::DaemonError;
use crate::error::Result;

/// Placeholder hash reported for every queried path. Valid base32
/// shape, deliberately worthless content.
const FAKE_NAR_HASH: &str = "0sg9f58l1jj88w6pdrfdpj5x9b1zrwszk84j81zvby36q9whhhqa";

/// Placeholder archive size reported alongside the fake hash.
const FAKE_NAR_SIZE: u64 = 120;

/// Whether the session answers on the wire or only decodes and logs.
///
/// `Observe` runs the identical read path against a live daemon
/// conversation flowing past on some other transport; writing anything
/// would corrupt it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    Respond,
    Observe,
}

/// Daemon side of one worker-protocol connection.
pub struct Session<S> {
    stream: S,
    mode: ResponseMode,
    version: ProtocolVersion,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, mode: ResponseMode) -> Self {
        Self {
            stream,
            mode,
            // Replaced during the handshake; until then assume our own.
            version: ProtocolVersion::SERVER,
        }
    }

    /// Negotiated client version. Meaningful once `run` is past the
    /// handshake.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Drive the session to completion.
    ///
    /// Returns `Ok(())` when the client hangs up cleanly at an opcode
    /// boundary. Any error means the stream is in an unknown state and
    /// the connection must be dropped.
    pub async fn run(mut self) -> Result<()> {
        self.handshake().await?;

        loop {
            let code = match read_u64(&mut self.stream, "opcode").await {
                Ok(code) => code,
                // EOF between operations is the normal way out.
                Err(ProtocolError::Read { source, .. }) if source.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("client closed the session");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            let op = WorkerOp::from_code(code).ok_or(DaemonError::UnknownOp { code })?;
            debug!(%op, "dispatching operation");

            match op {
                WorkerOp::Nop => {}
                WorkerOp::QueryPathInfo => self.query_path_info().await?,
                WorkerOp::QueryValidPaths => self.query_valid_paths().await?,
                WorkerOp::BuildDerivation => self.build_derivation().await?,
                WorkerOp::NarFromPath => self.nar_from_path().await?,
                WorkerOp::AddMultipleToStore => self.add_multiple_to_store().await?,
                other => {
                    warn!(op = %other, "refusing unimplemented operation");
                    return Err(DaemonError::Unimplemented { op: other });
                }
            }
        }
    }

    async fn handshake(&mut self) -> Result<()> {
        let magic = read_u64(&mut self.stream, "client magic").await?;
        if magic != WORKER_MAGIC_1 {
            return Err(DaemonError::BadMagic { got: magic });
        }

        self.put_u64(WORKER_MAGIC_2, "server magic").await?;
        self.put_u64(ProtocolVersion::SERVER.raw(), "server version").await?;
        self.flush().await?;

        let raw = read_u64(&mut self.stream, "client version").await?;
        let version = ProtocolVersion::from_raw(raw);
        if version < ProtocolVersion::MINIMUM {
            return Err(DaemonError::ClientTooOld {
                version,
                minimum: ProtocolVersion::MINIMUM,
            });
        }
        self.version = version;

        // Clients at minor >= 14 send two extra words before waiting on
        // us: a reserved flag and a CPU affinity value. Consume both
        // unconditionally so the opcode stream stays aligned.
        if version.minor() >= 14 {
            let _reserved = read_u64(&mut self.stream, "reserved word").await?;
            let affinity = read_u64(&mut self.stream, "cpu affinity").await?;
            debug!(affinity, "client sent scheduling hint");
        }

        info!(version = %version, mode = ?self.mode, "worker session negotiated");

        self.put_u64(STDERR_LAST, "log sentinel").await?;
        self.flush().await
    }

    async fn query_path_info(&mut self) -> Result<()> {
        if self.version.minor() < 17 {
            return Err(DaemonError::VersionGate {
                op: WorkerOp::QueryPathInfo,
                version: self.version,
                required_minor: 17,
            });
        }

        let path = read_string(&mut self.stream, "store path").await?;
        info!(%path, "answering path-info query");

        self.put_u64(STDERR_LAST, "log sentinel").await?;
        // Validity flag, then the info record without the echoed path.
        self.put_u64(1, "validity flag").await?;
        if self.responding() {
            let info = PathInfo {
                path,
                nar_hash: FAKE_NAR_HASH.to_string(),
                nar_size: FAKE_NAR_SIZE,
                ..PathInfo::default()
            };
            info.write_to(&mut self.stream).await?;
        }
        self.flush().await
    }

    async fn query_valid_paths(&mut self) -> Result<()> {
        let paths = read_strings(&mut self.stream, "queried paths").await?;
        if self.version.minor() >= 27 {
            let _substitute = read_u64(&mut self.stream, "substitute flag").await?;
        }
        info!(queried = paths.len(), "reporting no valid paths");

        self.put_u64(STDERR_LAST, "log sentinel").await?;
        // Empty list: nothing is ever already present, so the client
        // imports everything.
        self.put_u64(0, "valid path count").await?;
        self.flush().await
    }

    async fn build_derivation(&mut self) -> Result<()> {
        let request = DerivationRequest::read_from(&mut self.stream).await?;
        info!(
            drv = %request.drv_path,
            platform = %request.platform,
            builder = %request.builder,
            outputs = request.outputs.len(),
            env = request.env.len(),
            "acknowledging build request"
        );

        self.put_u64(STDERR_LAST, "log sentinel").await?;
        if self.responding() {
            let result = BuildResult {
                status: BuildStatus::Built,
                error_message: "built".to_string(),
                times_built: 0,
                is_non_deterministic: false,
                start_time: 0,
                stop_time: 0,
                output_map: Vec::new(),
            };
            result.write_to(&mut self.stream, self.version).await?;
        }
        self.flush().await
    }

    async fn nar_from_path(&mut self) -> Result<()> {
        let path = read_string(&mut self.stream, "store path").await?;
        info!(%path, "serving canned archive");

        self.put_u64(STDERR_LAST, "log sentinel").await?;
        // A minimal well-formed archive: one regular file.
        for token in [NAR_VERSION_MAGIC, "(", "type", "regular", "contents", "hello", ")"] {
            self.put_string(token, "archive token").await?;
        }
        self.flush().await
    }

    async fn add_multiple_to_store(&mut self) -> Result<()> {
        let repair = read_u64(&mut self.stream, "repair flag").await?;
        let dont_check_sigs = read_u64(&mut self.stream, "check-sigs flag").await?;
        info!(repair, dont_check_sigs, "validating store import");

        // The import payload arrives framed; everything inside the
        // frames uses the ordinary codec.
        let mut framed = FramedReader::new(&mut self.stream);
        let count = read_u64(&mut framed, "import path count").await?;
        for index in 0..count {
            let info = PathInfo::read_from(&mut framed).await?;
            debug!(index, path = %info.path, nar_size = info.nar_size, "validating imported path");

            let magic = read_string(&mut framed, "archive magic").await?;
            if magic != NAR_VERSION_MAGIC {
                return Err(DaemonError::NarMagicMismatch { got: magic });
            }
            validate_archive(&mut framed).await?;
        }
        drop(framed);
        info!(count, "import payload validated");

        self.put_u64(STDERR_LAST, "log sentinel").await?;
        self.flush().await
    }

    fn responding(&self) -> bool {
        self.mode == ResponseMode::Respond
    }

    async fn put_u64(&mut self, value: u64, what: &'static str) -> Result<()> {
        if self.responding() {
            write_u64(&mut self.stream, value, what).await?;
        }
        Ok(())
    }

    async fn put_string(&mut self, value: &str, what: &'static str) -> Result<()> {
        if self.responding() {
            write_string(&mut self.stream, value, what).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.responding() {
            self.stream.flush().await.map_err(|e| ProtocolError::Write {
                what: "flush",
                source: e,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;
    use tokio::io::AsyncReadExt;
    use tokio::io::AsyncWriteExt;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    use tamarack_proto::padded_len;
    use tamarack_proto::write_strings;

    use super::*;

    const CLIENT_V32: u64 = (1 << 8) | 32;

    fn spawn_session(mode: ResponseMode) -> (DuplexStream, JoinHandle<Result<()>>) {
        let (client, server) = duplex(1 << 16);
        let handle = tokio::spawn(Session::new(server, mode).run());
        (client, handle)
    }

    async fn handshake(client: &mut DuplexStream, raw_version: u64) {
        write_u64(client, WORKER_MAGIC_1, "magic").await.unwrap();
        assert_eq!(read_u64(client, "server magic").await.unwrap(), WORKER_MAGIC_2);
        assert_eq!(
            read_u64(client, "server version").await.unwrap(),
            ProtocolVersion::SERVER.raw()
        );

        write_u64(client, raw_version, "client version").await.unwrap();
        if (raw_version & 0xff) >= 14 {
            write_u64(client, 0, "reserved").await.unwrap();
            write_u64(client, 0, "affinity").await.unwrap();
        }
        assert_eq!(read_u64(client, "sentinel").await.unwrap(), STDERR_LAST);
    }

    #[tokio::test]
    async fn bad_client_magic_tears_down() {
        let (mut client, handle) = spawn_session(ResponseMode::Respond);
        write_u64(&mut client, 0xdeadbeef, "magic").await.unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, DaemonError::BadMagic { got: 0xdeadbeef }));
    }

    #[tokio::test]
    async fn client_below_minimum_version_is_rejected() {
        let (mut client, handle) = spawn_session(ResponseMode::Respond);
        write_u64(&mut client, WORKER_MAGIC_1, "magic").await.unwrap();
        read_u64(&mut client, "server magic").await.unwrap();
        read_u64(&mut client, "server version").await.unwrap();
        write_u64(&mut client, 0x109, "client version").await.unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, DaemonError::ClientTooOld { .. }));
    }

    #[tokio::test]
    async fn minimum_version_handshakes_without_extra_words() {
        // Minor 10 sends no reserved/affinity words.
        let (mut client, handle) = spawn_session(ResponseMode::Respond);
        handshake(&mut client, 0x10a).await;

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn modern_handshake_consumes_exactly_two_extra_words() {
        let (mut client, handle) = spawn_session(ResponseMode::Respond);
        handshake(&mut client, CLIENT_V32).await;

        // If the handshake over- or under-read, this opcode would land
        // misaligned and the session would not end cleanly.
        write_u64(&mut client, WorkerOp::Nop.code(), "opcode").await.unwrap();
        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn query_path_info_returns_the_fabricated_record() {
        let (mut client, handle) = spawn_session(ResponseMode::Respond);
        handshake(&mut client, CLIENT_V32).await;

        write_u64(&mut client, WorkerOp::QueryPathInfo.code(), "opcode").await.unwrap();
        write_string(&mut client, "/nix/store/abc-pkg", "path").await.unwrap();

        assert_eq!(read_u64(&mut client, "sentinel").await.unwrap(), STDERR_LAST);
        assert_eq!(read_u64(&mut client, "validity").await.unwrap(), 1);
        assert_eq!(read_string(&mut client, "deriver").await.unwrap(), "");
        assert_eq!(read_string(&mut client, "nar hash").await.unwrap(), FAKE_NAR_HASH);
        assert_eq!(read_u64(&mut client, "ref count").await.unwrap(), 0);
        assert_eq!(read_u64(&mut client, "reg time").await.unwrap(), 0);
        assert_eq!(read_u64(&mut client, "nar size").await.unwrap(), FAKE_NAR_SIZE);
        assert_eq!(read_u64(&mut client, "ultimate").await.unwrap(), 0);
        assert_eq!(read_u64(&mut client, "sig count").await.unwrap(), 0);
        assert_eq!(read_string(&mut client, "ca").await.unwrap(), "");

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn query_path_info_is_version_gated() {
        // Minor 10 predates the validity-flag reply shape.
        let (mut client, handle) = spawn_session(ResponseMode::Respond);
        handshake(&mut client, 0x10a).await;

        write_u64(&mut client, WorkerOp::QueryPathInfo.code(), "opcode").await.unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, DaemonError::VersionGate { required_minor: 17, .. }));
    }

    #[tokio::test]
    async fn query_valid_paths_always_answers_empty() {
        let (mut client, handle) = spawn_session(ResponseMode::Respond);
        handshake(&mut client, CLIENT_V32).await;

        write_u64(&mut client, WorkerOp::QueryValidPaths.code(), "opcode").await.unwrap();
        let paths = vec!["/nix/store/one".to_string(), "/nix/store/two".to_string()];
        write_strings(&mut client, &paths, "paths").await.unwrap();
        write_u64(&mut client, 1, "substitute flag").await.unwrap();

        assert_eq!(read_u64(&mut client, "sentinel").await.unwrap(), STDERR_LAST);
        assert_eq!(read_u64(&mut client, "valid count").await.unwrap(), 0);

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn build_derivation_reports_success() {
        let (mut client, handle) = spawn_session(ResponseMode::Respond);
        handshake(&mut client, CLIENT_V32).await;

        write_u64(&mut client, WorkerOp::BuildDerivation.code(), "opcode").await.unwrap();
        write_string(&mut client, "/nix/store/abc.drv", "drv path").await.unwrap();
        write_u64(&mut client, 1, "output count").await.unwrap();
        for field in ["out", "/nix/store/abc-out", "", ""] {
            write_string(&mut client, field, "output field").await.unwrap();
        }
        write_strings(&mut client, &[], "input sources").await.unwrap();
        write_string(&mut client, "x86_64-linux", "platform").await.unwrap();
        write_string(&mut client, "/bin/sh", "builder").await.unwrap();
        write_strings(&mut client, &["-c".to_string()], "args").await.unwrap();
        write_u64(&mut client, 1, "env count").await.unwrap();
        write_string(&mut client, "PATH", "env key").await.unwrap();
        write_string(&mut client, "/bin", "env value").await.unwrap();
        write_u64(&mut client, 0, "build mode").await.unwrap();

        assert_eq!(read_u64(&mut client, "sentinel").await.unwrap(), STDERR_LAST);
        assert_eq!(read_u64(&mut client, "status").await.unwrap(), BuildStatus::Built.code());
        assert_eq!(read_string(&mut client, "message").await.unwrap(), "built");
        // Minor 32: four numeric fields, then an empty output map.
        for what in ["times built", "non-det", "start", "stop"] {
            assert_eq!(read_u64(&mut client, "numeric").await.unwrap(), 0, "{what}");
        }
        assert_eq!(read_u64(&mut client, "output map count").await.unwrap(), 0);

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn nar_from_path_streams_a_wellformed_archive() {
        let (mut client, handle) = spawn_session(ResponseMode::Respond);
        handshake(&mut client, CLIENT_V32).await;

        write_u64(&mut client, WorkerOp::NarFromPath.code(), "opcode").await.unwrap();
        write_string(&mut client, "/nix/store/abc", "path").await.unwrap();

        assert_eq!(read_u64(&mut client, "sentinel").await.unwrap(), STDERR_LAST);
        assert_eq!(read_string(&mut client, "magic").await.unwrap(), NAR_VERSION_MAGIC);
        validate_archive(&mut client).await.unwrap();

        drop(client);
        handle.await.unwrap().unwrap();
    }

    /// Wire-encode a token the way the string codec does.
    fn push_token(out: &mut Vec<u8>, token: &[u8]) {
        out.extend_from_slice(&(token.len() as u64).to_le_bytes());
        out.extend_from_slice(token);
        let pad = (padded_len(token.len() as u64) - token.len() as u64) as usize;
        out.extend_from_slice(&[0u8; 8][..pad]);
    }

    #[tokio::test]
    async fn add_multiple_to_store_validates_a_framed_import() {
        let (mut client, handle) = spawn_session(ResponseMode::Respond);
        handshake(&mut client, CLIENT_V32).await;

        write_u64(&mut client, WorkerOp::AddMultipleToStore.code(), "opcode").await.unwrap();
        write_u64(&mut client, 0, "repair").await.unwrap();
        write_u64(&mut client, 0, "check sigs").await.unwrap();

        // Inner payload: count, path info, magic, one-file archive.
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u64.to_le_bytes());
        push_token(&mut payload, b"/nix/store/abc-pkg");
        push_token(&mut payload, b""); // deriver
        push_token(&mut payload, FAKE_NAR_HASH.as_bytes());
        payload.extend_from_slice(&0u64.to_le_bytes()); // references
        payload.extend_from_slice(&0u64.to_le_bytes()); // registration time
        payload.extend_from_slice(&42u64.to_le_bytes()); // nar size
        payload.extend_from_slice(&0u64.to_le_bytes()); // ultimate
        payload.extend_from_slice(&0u64.to_le_bytes()); // signatures
        push_token(&mut payload, b""); // content address
        push_token(&mut payload, NAR_VERSION_MAGIC.as_bytes());
        for token in [&b"("[..], b"type", b"regular", b"contents", b"hello", b")"] {
            push_token(&mut payload, token);
        }

        // Deliver it split across two frames, with an empty frame in
        // between, followed by the terminating zero frame.
        let split = payload.len() / 2;
        for chunk in [&payload[..split], &[][..], &payload[split..], &[][..]] {
            write_u64(&mut client, chunk.len() as u64, "frame len").await.unwrap();
            client.write_all(chunk).await.unwrap();
        }

        assert_eq!(read_u64(&mut client, "sentinel").await.unwrap(), STDERR_LAST);

        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn add_multiple_to_store_rejects_wrong_archive_magic() {
        let (mut client, handle) = spawn_session(ResponseMode::Respond);
        handshake(&mut client, CLIENT_V32).await;

        write_u64(&mut client, WorkerOp::AddMultipleToStore.code(), "opcode").await.unwrap();
        write_u64(&mut client, 0, "repair").await.unwrap();
        write_u64(&mut client, 0, "check sigs").await.unwrap();

        let mut payload = Vec::new();
        payload.extend_from_slice(&1u64.to_le_bytes());
        push_token(&mut payload, b"/nix/store/abc-pkg");
        push_token(&mut payload, b"");
        push_token(&mut payload, b"hash");
        for _ in 0..4 {
            payload.extend_from_slice(&0u64.to_le_bytes());
        }
        payload.extend_from_slice(&0u64.to_le_bytes());
        push_token(&mut payload, b"");
        push_token(&mut payload, b"not-an-archive");

        write_u64(&mut client, payload.len() as u64, "frame len").await.unwrap();
        client.write_all(&payload).await.unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, DaemonError::NarMagicMismatch { .. }));
    }

    #[tokio::test]
    async fn unknown_opcode_tears_down_but_new_sessions_work() {
        let (mut client, handle) = spawn_session(ResponseMode::Respond);
        handshake(&mut client, CLIENT_V32).await;

        write_u64(&mut client, 255, "opcode").await.unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, DaemonError::UnknownOp { code: 255 }));

        // Sessions are connection-local; a fresh one is unaffected.
        let (mut client, handle) = spawn_session(ResponseMode::Respond);
        handshake(&mut client, CLIENT_V32).await;
        write_u64(&mut client, WorkerOp::Nop.code(), "opcode").await.unwrap();
        drop(client);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn known_but_unserviced_opcode_fails_loudly() {
        let (mut client, handle) = spawn_session(ResponseMode::Respond);
        handshake(&mut client, CLIENT_V32).await;

        write_u64(&mut client, WorkerOp::IsValidPath.code(), "opcode").await.unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            DaemonError::Unimplemented {
                op: WorkerOp::IsValidPath
            }
        ));
    }

    #[tokio::test]
    async fn observe_mode_reads_everything_and_writes_nothing() {
        let (mut client, handle) = spawn_session(ResponseMode::Observe);

        // No server bytes to read in observe mode; just feed the
        // client half of the conversation.
        write_u64(&mut client, WORKER_MAGIC_1, "magic").await.unwrap();
        write_u64(&mut client, CLIENT_V32, "version").await.unwrap();
        write_u64(&mut client, 0, "reserved").await.unwrap();
        write_u64(&mut client, 0, "affinity").await.unwrap();
        write_u64(&mut client, WorkerOp::QueryPathInfo.code(), "opcode").await.unwrap();
        write_string(&mut client, "/nix/store/abc", "path").await.unwrap();
        client.shutdown().await.unwrap();

        handle.await.unwrap().unwrap();

        // The session wrote nothing back.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "observe mode leaked {} bytes", rest.len());
    }
}
