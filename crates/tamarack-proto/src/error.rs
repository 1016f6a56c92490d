//! Error types for wire decoding and archive validation.

use snafu::Snafu;

/// Errors produced while encoding or decoding worker-protocol data.
///
/// Every variant is fatal to the connection it occurred on: the wire
/// format has no resynchronization markers, so a misparse leaves the
/// stream in an unknown state.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProtocolError {
    /// Failed to read from the underlying stream.
    #[snafu(display("failed to read {what}: {source}"))]
    Read {
        what: &'static str,
        source: std::io::Error,
    },

    /// Failed to write to the underlying stream.
    #[snafu(display("failed to write {what}: {source}"))]
    Write {
        what: &'static str,
        source: std::io::Error,
    },

    /// A declared string length exceeded the decoder bound.
    #[snafu(display("string length {len} for {what} exceeds maximum {max}"))]
    StringTooLong {
        what: &'static str,
        len: u64,
        max: u64,
    },

    /// A string field that must be UTF-8 was not.
    #[snafu(display("{what} is not valid UTF-8"))]
    InvalidUtf8 {
        what: &'static str,
        source: std::string::FromUtf8Error,
    },

    /// Archive node did not start with the `"("` open tag.
    #[snafu(display("expected archive open tag, got {got:?}"))]
    NarOpenTag {
        got: String,
    },

    /// More than one `"type"` field in a single archive node.
    #[snafu(display("multiple type fields in archive node"))]
    NarMultipleType,

    /// The `"type"` field named something other than regular/directory/symlink.
    #[snafu(display("invalid archive node type {value:?}"))]
    NarInvalidType {
        value: String,
    },

    /// A field appeared on a node type it does not belong to,
    /// or before the node's type was declared.
    #[snafu(display("archive field {field:?} not valid for this node type"))]
    NarMisplacedField {
        field: String,
    },

    /// A field name outside the archive grammar.
    #[snafu(display("unknown archive field {field:?}"))]
    NarUnknownField {
        field: String,
    },

    /// The `"executable"` marker must decode as an empty string.
    #[snafu(display("executable marker must be empty, got {len} bytes"))]
    NarExecutableMarker {
        len: usize,
    },

    /// Entry name was empty, `.`, `..`, or contained `/` or NUL.
    #[snafu(display("invalid archive entry name {name:?}"))]
    NarBadEntryName {
        name: String,
    },

    /// Entry names within a directory must be strictly increasing.
    #[snafu(display("archive entry {name:?} not sorted after {prev:?}"))]
    NarUnsortedEntry {
        name: String,
        prev: String,
    },

    /// An entry's `"node"` field appeared before its `"name"`.
    #[snafu(display("archive entry node before entry name"))]
    NarNodeBeforeName,

    /// Directory nesting exceeded the validator bound.
    #[snafu(display("archive nesting deeper than {max} levels"))]
    NarTooDeep {
        max: usize,
    },
}

/// Result type for protocol operations.
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;
