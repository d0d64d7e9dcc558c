//! BML binary XML codec for Alien: Isolation files.
//!
//! BML stores an XML document as a flat table of node records followed by
//! two null-terminated string pools: one for element and attribute names
//! and values, one for inner text and whitespace literals. This crate reads
//! those files into a [`BmlTree`], writes trees back out byte-for-byte in
//! the layout the game expects, and bridges to plain XML.
//!
//! # Example
//!
//! ```no_run
//! use bml_codec::BmlTree;
//!
//! let data = std::fs::read("ENGINE_SETTINGS.BML")?;
//!
//! if BmlTree::is_bml(&data) {
//!     let tree = BmlTree::parse(&data)?;
//!     println!("{}", tree.to_xml_string()?);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod attribute;
mod decoder;
mod encoder;
mod error;
mod flags;
mod header;
mod node;
mod pool;

#[cfg(feature = "xml")]
pub mod bridge;
#[cfg(feature = "xml")]
pub mod markup;

pub use attribute::Attribute;
pub use decoder::{Decoder, MAX_DEPTH};
pub use encoder::{Encoder, Placement};
pub use error::{Error, Result};
pub use flags::{FlagWord, Shape};
pub use header::BmlHeader;
pub use node::{BmlTree, Node, NodeId, Trailer, DECLARATION_TAG};
pub use pool::{Pool, PoolBases, PoolRegions, StringPool, StringPools, StringRef};

#[cfg(feature = "xml")]
pub use bridge::ImportOptions;
