//! Error types for BML decoding, encoding and XML bridging.

use thiserror::Error;

use crate::pool::Pool;

/// Errors that can occur when converting BML files.
///
/// Every variant is terminal for the conversion that raised it: no partial
/// tree or byte buffer is ever handed back alongside an error.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Low-level read error (truncated data, bad UTF-8 in a pool, ...).
    #[error("{0}")]
    Common(#[from] bml_common::Error),

    /// Bad magic or inconsistent block boundaries.
    #[error("malformed BML header: {0}")]
    MalformedHeader(String),

    /// Structural problem in the node tree.
    #[error("malformed BML tree: {0}")]
    MalformedTree(String),

    /// A header was about to be written with an unset (zero) boundary.
    #[error("block boundary `{field}` was never fixed up")]
    UnsetBlockBoundary { field: &'static str },

    /// Element has more attributes than the 8-bit count field can hold.
    #[error("element <{element}> has {count} attributes (maximum is 255)")]
    TooManyAttributes { element: String, count: usize },

    /// Node has more children than the 21-bit count field can hold.
    #[error("node <{element}> has {count} children (maximum is 2097151)")]
    TooManyChildren { element: String, count: usize },

    /// Markup node kind with no BML representation.
    #[error("unsupported {kind} inside element <{element}>")]
    UnsupportedNodeType { element: String, kind: &'static str },

    /// The XML text could not be parsed.
    #[error("XML parse error: {0}")]
    MarkupParseFailure(String),

    /// XML could not be written.
    #[error("XML write error: {0}")]
    Xml(String),

    /// String reference points outside its pool region.
    #[error("string offset {offset} is outside the {pool} pool ({start}..{end})")]
    StringOffsetOutOfBounds {
        offset: u32,
        pool: Pool,
        start: u32,
        end: u32,
    },

    /// A string was resolved before it was interned.
    #[error("string {value:?} was never interned into the {pool} pool")]
    UninternedString { value: String, pool: Pool },

    /// The encoder wrote a record whose size differs from the size pass.
    #[error("record at offset {position} wrote {actual} bytes, layout expected {expected}")]
    RecordSizeMismatch {
        position: u32,
        expected: u32,
        actual: u32,
    },

    /// UTF-8 decoding error.
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Result type for BML operations.
pub type Result<T> = std::result::Result<T, Error>;
