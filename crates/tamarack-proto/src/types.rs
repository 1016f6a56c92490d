//! Protocol version and the composite wire records.

use std::fmt;

use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;

use crate::codec::read_string;
use crate::codec::read_strings;
use crate::codec::read_u64;
use crate::codec::write_string;
use crate::codec::write_strings;
use crate::codec::write_u64;
use crate::error::Result;
use crate::ops::BuildStatus;

/// A worker-protocol version, encoded on the wire as `major << 8 | minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion(u64);

impl ProtocolVersion {
    /// The version this implementation speaks: 1.32.
    pub const SERVER: Self = Self((1 << 8) | 32);

    /// Oldest client accepted: 1.10.
    pub const MINIMUM: Self = Self(0x10a);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn major(self) -> u64 {
        (self.0 >> 8) & 0xff
    }

    pub const fn minor(self) -> u64 {
        self.0 & 0xff
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

/// Metadata for one store path.
///
/// Read in the bulk-import field order (path first); written in the
/// path-info query reply order (the queried path is not echoed).
#[derive(Debug, Clone, Default)]
pub struct PathInfo {
    pub path: String,
    pub deriver: String,
    pub nar_hash: String,
    pub references: Vec<String>,
    pub registration_time: u64,
    pub nar_size: u64,
    pub ultimate: bool,
    pub signatures: Vec<String>,
    pub content_address: String,
}

impl PathInfo {
    /// Decode one record as laid out in the bulk store-import payload.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let path = read_string(reader, "store path").await?;
        let deriver = read_string(reader, "deriver").await?;
        let nar_hash = read_string(reader, "nar hash").await?;
        let references = read_strings(reader, "references").await?;
        let registration_time = read_u64(reader, "registration time").await?;
        let nar_size = read_u64(reader, "nar size").await?;
        let ultimate = read_u64(reader, "ultimate flag").await? != 0;
        let signatures = read_strings(reader, "signatures").await?;
        let content_address = read_string(reader, "content address").await?;

        Ok(Self {
            path,
            deriver,
            nar_hash,
            references,
            registration_time,
            nar_size,
            ultimate,
            signatures,
            content_address,
        })
    }

    /// Encode the path-info reply fields, in declared order.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        write_string(writer, &self.deriver, "deriver").await?;
        write_string(writer, &self.nar_hash, "nar hash").await?;
        write_strings(writer, &self.references, "references").await?;
        write_u64(writer, self.registration_time, "registration time").await?;
        write_u64(writer, self.nar_size, "nar size").await?;
        write_u64(writer, self.ultimate as u64, "ultimate flag").await?;
        write_strings(writer, &self.signatures, "signatures").await?;
        write_string(writer, &self.content_address, "content address").await
    }
}

/// One declared output of a derivation.
#[derive(Debug, Clone)]
pub struct DerivationOutput {
    pub name: String,
    pub path: String,
    pub hash_algo: String,
    pub hash: String,
}

/// A build request, in the fixed wire field order.
#[derive(Debug, Clone)]
pub struct DerivationRequest {
    pub drv_path: String,
    pub outputs: Vec<DerivationOutput>,
    pub input_sources: Vec<String>,
    pub platform: String,
    pub builder: String,
    pub args: Vec<String>,
    /// Ordered key/value pairs; the wire preserves insertion order.
    pub env: Vec<(String, String)>,
    pub build_mode: u64,
}

impl DerivationRequest {
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let drv_path = read_string(reader, "derivation path").await?;

        let output_count = read_u64(reader, "output count").await?;
        let mut outputs = Vec::with_capacity(output_count.min(1024) as usize);
        for _ in 0..output_count {
            outputs.push(DerivationOutput {
                name: read_string(reader, "output name").await?,
                path: read_string(reader, "output path").await?,
                hash_algo: read_string(reader, "output hash algo").await?,
                hash: read_string(reader, "output hash").await?,
            });
        }

        let input_sources = read_strings(reader, "input sources").await?;
        let platform = read_string(reader, "platform").await?;
        let builder = read_string(reader, "builder").await?;
        let args = read_strings(reader, "builder args").await?;

        let env_count = read_u64(reader, "env count").await?;
        let mut env = Vec::with_capacity(env_count.min(1024) as usize);
        for _ in 0..env_count {
            let key = read_string(reader, "env key").await?;
            let value = read_string(reader, "env value").await?;
            env.push((key, value));
        }

        let build_mode = read_u64(reader, "build mode").await?;

        Ok(Self {
            drv_path,
            outputs,
            input_sources,
            platform,
            builder,
            args,
            env,
            build_mode,
        })
    }
}

/// A build outcome reply. Trailing fields are gated on the negotiated
/// minor version.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub status: BuildStatus,
    pub error_message: String,
    pub times_built: u64,
    pub is_non_deterministic: bool,
    pub start_time: u64,
    pub stop_time: u64,
    pub output_map: Vec<(String, String)>,
}

impl BuildResult {
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W, version: ProtocolVersion) -> Result<()> {
        write_u64(writer, self.status.code(), "build status").await?;
        write_string(writer, &self.error_message, "build error message").await?;

        if version.minor() >= 29 {
            write_u64(writer, self.times_built, "times built").await?;
            write_u64(writer, self.is_non_deterministic as u64, "non-deterministic flag").await?;
            write_u64(writer, self.start_time, "start time").await?;
            write_u64(writer, self.stop_time, "stop time").await?;
        }

        if version.minor() >= 28 {
            write_u64(writer, self.output_map.len() as u64, "output map count").await?;
            for (name, path) in &self.output_map {
                write_string(writer, name, "output map name").await?;
                write_string(writer, path, "output map path").await?;
            }
        }
        Ok(())
    }
}
