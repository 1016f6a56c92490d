//! Primitive encode/decode for the worker protocol.

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::error::ProtocolError;
use crate::error::Result;

/// Maximum declared length for a single wire string (16 MB).
/// Prevents memory exhaustion from a hostile length prefix.
pub const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;

/// Round a byte count up to the next multiple of 8.
pub const fn padded_len(n: u64) -> u64 {
    (n + 7) & !7
}

/// Read a little-endian u64. `what` names the field for error context.
pub async fn read_u64<R: AsyncRead + Unpin>(reader: &mut R, what: &'static str) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).await.map_err(|e| ProtocolError::Read { what, source: e })?;
    Ok(u64::from_le_bytes(buf))
}

/// Write a little-endian u64.
pub async fn write_u64<W: AsyncWrite + Unpin>(writer: &mut W, value: u64, what: &'static str) -> Result<()> {
    writer
        .write_all(&value.to_le_bytes())
        .await
        .map_err(|e| ProtocolError::Write { what, source: e })
}

/// Read a length-prefixed, zero-padded byte string.
///
/// The padded region is consumed in full but only the declared length
/// is returned; padding content is never trusted.
pub async fn read_bytes<R: AsyncRead + Unpin>(reader: &mut R, what: &'static str) -> Result<Vec<u8>> {
    let len = read_u64(reader, what).await?;
    if len > MAX_STRING_LEN {
        return Err(ProtocolError::StringTooLong {
            what,
            len,
            max: MAX_STRING_LEN,
        });
    }

    let mut buf = vec![0u8; padded_len(len) as usize];
    reader.read_exact(&mut buf).await.map_err(|e| ProtocolError::Read { what, source: e })?;
    buf.truncate(len as usize);
    Ok(buf)
}

/// Read a wire string that must be UTF-8 (paths, hashes, names).
pub async fn read_string<R: AsyncRead + Unpin>(reader: &mut R, what: &'static str) -> Result<String> {
    let bytes = read_bytes(reader, what).await?;
    String::from_utf8(bytes).map_err(|e| ProtocolError::InvalidUtf8 { what, source: e })
}

/// Write a length-prefixed byte string, zero-padded to a multiple of 8.
pub async fn write_string<W: AsyncWrite + Unpin>(writer: &mut W, value: &str, what: &'static str) -> Result<()> {
    let bytes = value.as_bytes();
    let len = bytes.len() as u64;
    write_u64(writer, len, what).await?;
    writer.write_all(bytes).await.map_err(|e| ProtocolError::Write { what, source: e })?;

    let padding = (padded_len(len) - len) as usize;
    if padding > 0 {
        writer
            .write_all(&[0u8; 7][..padding])
            .await
            .map_err(|e| ProtocolError::Write { what, source: e })?;
    }
    Ok(())
}

/// Read a count-prefixed string list, order preserved.
pub async fn read_strings<R: AsyncRead + Unpin>(reader: &mut R, what: &'static str) -> Result<Vec<String>> {
    let count = read_u64(reader, what).await?;
    if count > MAX_STRING_LEN {
        return Err(ProtocolError::StringTooLong {
            what,
            len: count,
            max: MAX_STRING_LEN,
        });
    }

    let mut values = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        values.push(read_string(reader, what).await?);
    }
    Ok(values)
}

/// Write a count-prefixed string list.
pub async fn write_strings<W: AsyncWrite + Unpin>(writer: &mut W, values: &[String], what: &'static str) -> Result<()> {
    write_u64(writer, values.len() as u64, what).await?;
    for value in values {
        write_string(writer, value, what).await?;
    }
    Ok(())
}
