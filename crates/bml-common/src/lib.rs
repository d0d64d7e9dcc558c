//! Common utilities for the BML tools.
//!
//! This crate provides the low-level pieces shared by the codec crates:
//!
//! - [`BinaryReader`] - Zero-copy, seekable reading from byte slices
//! - [`Error`] - Errors raised by truncated or malformed raw data

mod error;
mod reader;

pub use error::{Error, Result};
pub use reader::BinaryReader;

/// Re-export zerocopy traits for convenience
pub use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Re-export memchr for null-terminator searching
pub use memchr;
