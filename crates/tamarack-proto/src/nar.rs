//! NAR archive grammar validator.
//!
//! Validates the recursive archive structure embedded in the worker
//! protocol and advances the stream exactly past it. Nothing is
//! materialized: file contents are consumed and discarded, entry names
//! are checked and dropped. Persisting bytes to a real store is a
//! collaborator's job, not this crate's.
//!
//! ## Grammar
//! ```text
//! Node  := "(" Field* ")"
//! Field := "type" ("regular" | "directory" | "symlink")
//!        | "contents" <u64 length + padded bytes>       (regular)
//!        | "executable" ""                              (regular)
//!        | "target" <string>                            (symlink)
//!        | "entry" "(" "name" <string> "node" Node ")"  (directory)
//! ```

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;

use crate::codec::padded_len;
use crate::codec::read_bytes;
use crate::codec::read_u64;
use crate::error::ProtocolError;
use crate::error::Result;

/// Magic string opening every NAR archive on the wire.
pub const NAR_VERSION_MAGIC: &str = "nix-archive-1";

/// Maximum directory nesting the validator will follow.
pub const MAX_NAR_DEPTH: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq)]
enum NodeType {
    Unknown,
    Regular,
    Directory,
    Symlink,
}

/// Validate one archive, leaving the stream positioned exactly after
/// the root node's closing `")"`.
///
/// The caller is expected to have consumed the [`NAR_VERSION_MAGIC`]
/// string already; the protocol carries it separately from the archive
/// body.
pub async fn validate_archive<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<()> {
    validate_node(reader, 0).await
}

async fn validate_node<R: AsyncRead + Unpin + Send>(reader: &mut R, depth: usize) -> Result<()> {
    if depth > MAX_NAR_DEPTH {
        return Err(ProtocolError::NarTooDeep { max: MAX_NAR_DEPTH });
    }

    let open = read_bytes(reader, "archive tag").await?;
    if open != b"(" {
        return Err(ProtocolError::NarOpenTag {
            got: String::from_utf8_lossy(&open).into_owned(),
        });
    }

    let mut node_type = NodeType::Unknown;
    // Previous entry name in this directory, for the strict ordering check.
    let mut prev_name: Vec<u8> = Vec::new();

    loop {
        let field = read_bytes(reader, "archive field").await?;
        match field.as_slice() {
            b")" => return Ok(()),

            b"type" => {
                if node_type != NodeType::Unknown {
                    return Err(ProtocolError::NarMultipleType);
                }
                let value = read_bytes(reader, "archive type").await?;
                node_type = match value.as_slice() {
                    b"regular" => NodeType::Regular,
                    b"directory" => NodeType::Directory,
                    b"symlink" => NodeType::Symlink,
                    other => {
                        return Err(ProtocolError::NarInvalidType {
                            value: String::from_utf8_lossy(other).into_owned(),
                        });
                    }
                };
            }

            b"contents" => {
                if node_type != NodeType::Regular {
                    return Err(misplaced(&field));
                }
                let len = read_u64(reader, "contents length").await?;
                discard(reader, padded_len(len)).await?;
            }

            b"executable" => {
                if node_type != NodeType::Regular {
                    return Err(misplaced(&field));
                }
                let marker = read_bytes(reader, "executable marker").await?;
                if !marker.is_empty() {
                    return Err(ProtocolError::NarExecutableMarker { len: marker.len() });
                }
            }

            b"target" => {
                if node_type != NodeType::Symlink {
                    return Err(misplaced(&field));
                }
                // Link target is arbitrary bytes, taken verbatim.
                read_bytes(reader, "symlink target").await?;
            }

            b"entry" => {
                if node_type != NodeType::Directory {
                    return Err(misplaced(&field));
                }
                validate_entry(reader, depth, &mut prev_name).await?;
            }

            other => {
                return Err(ProtocolError::NarUnknownField {
                    field: String::from_utf8_lossy(other).into_owned(),
                });
            }
        }
    }
}

/// Validate one `"(" "name" <string> "node" Node ")"` entry block.
async fn validate_entry<R: AsyncRead + Unpin + Send>(
    reader: &mut R,
    depth: usize,
    prev_name: &mut Vec<u8>,
) -> Result<()> {
    let open = read_bytes(reader, "entry tag").await?;
    if open != b"(" {
        return Err(ProtocolError::NarOpenTag {
            got: String::from_utf8_lossy(&open).into_owned(),
        });
    }

    let mut name: Vec<u8> = Vec::new();
    loop {
        let field = read_bytes(reader, "entry field").await?;
        match field.as_slice() {
            b")" => return Ok(()),

            b"name" => {
                name = read_bytes(reader, "entry name").await?;
                check_entry_name(&name)?;
                if name.as_slice() <= prev_name.as_slice() {
                    return Err(ProtocolError::NarUnsortedEntry {
                        name: String::from_utf8_lossy(&name).into_owned(),
                        prev: String::from_utf8_lossy(prev_name).into_owned(),
                    });
                }
                prev_name.clear();
                prev_name.extend_from_slice(&name);
            }

            b"node" => {
                if name.is_empty() {
                    return Err(ProtocolError::NarNodeBeforeName);
                }
                Box::pin(validate_node(reader, depth + 1)).await?;
            }

            other => {
                return Err(ProtocolError::NarUnknownField {
                    field: String::from_utf8_lossy(other).into_owned(),
                });
            }
        }
    }
}

fn misplaced(field: &[u8]) -> ProtocolError {
    ProtocolError::NarMisplacedField {
        field: String::from_utf8_lossy(field).into_owned(),
    }
}

/// Entry names must be non-empty, not `.`/`..`, and free of `/` and NUL.
fn check_entry_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name == b"." || name == b".." || name.contains(&b'/') || name.contains(&0) {
        return Err(ProtocolError::NarBadEntryName {
            name: String::from_utf8_lossy(name).into_owned(),
        });
    }
    Ok(())
}

/// Consume and discard exactly `len` bytes; a short read is fatal.
async fn discard<R: AsyncRead + Unpin>(reader: &mut R, len: u64) -> Result<()> {
    let mut scratch = [0u8; 8192];
    let mut remaining = len;
    while remaining > 0 {
        let take = remaining.min(scratch.len() as u64) as usize;
        reader
            .read_exact(&mut scratch[..take])
            .await
            .map_err(|e| ProtocolError::Read {
                what: "archive contents",
                source: e,
            })?;
        remaining -= take as u64;
    }
    Ok(())
}
