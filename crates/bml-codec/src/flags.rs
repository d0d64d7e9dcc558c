//! Per-node flag word.
//!
//! Every node record carries one little-endian `u32` packing three fields:
//!
//! ```text
//! bit  31                          11 10  8 7        0
//!      cccc cccc cccc cccc cccc c     iii   aaaa aaaa
//!      child count (21 bits)          shape attribute count
//! ```

use crate::{Error, Result};

const ATTRIBUTE_MASK: u32 = 0xFF;
const SHAPE_SHIFT: u32 = 8;
const SHAPE_MASK: u32 = 0x7;
const CHILD_SHIFT: u32 = 11;
const CHILD_MASK: u32 = 0x1F_FFFF;

/// Shape tag: selects the trailing fields of a node record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Shape {
    /// Declaration root without attributes; one spacing reference.
    BareDeclaration = 0,
    /// Declaration root with attributes; spacing plus a mandatory offset.
    Declaration = 1,
    /// Closing spacing; offset only when there are children.
    Spacing = 2,
    /// Inner text and line ending; offset only when there are children.
    InnerText = 3,
    /// Variant of [`Shape::Spacing`] seen in game files.
    SpacingAlt = 6,
    /// Variant of [`Shape::InnerText`] seen in game files.
    InnerTextAlt = 7,
}

impl Shape {
    /// Derive the shape the encoder writes for a node.
    pub fn derive(is_root: bool, has_inner_text: bool, attribute_count: usize) -> Self {
        match (is_root, has_inner_text) {
            (true, _) if attribute_count == 0 => Shape::BareDeclaration,
            (true, _) => Shape::Declaration,
            (false, true) => Shape::InnerText,
            (false, false) => Shape::Spacing,
        }
    }

    /// Number of string references after the attributes.
    pub fn text_fields(self) -> u32 {
        match self {
            Shape::InnerText | Shape::InnerTextAlt => 2,
            _ => 1,
        }
    }

    /// Whether a record of this shape stores a forward offset.
    pub fn has_offset(self, child_count: u32) -> bool {
        match self {
            Shape::BareDeclaration => false,
            Shape::Declaration => true,
            _ => child_count > 0,
        }
    }

    /// Whether the record carries inner text.
    pub fn has_inner_text(self) -> bool {
        self.text_fields() == 2
    }

    /// Serialized size of a record with this shape.
    ///
    /// Decoder and encoder both go through this table.
    pub fn record_size(self, attribute_count: u32, child_count: u32) -> u32 {
        let offset = if self.has_offset(child_count) { 4 } else { 0 };
        4 + FlagWord::SIZE + attribute_count * crate::Attribute::SIZE + 4 * self.text_fields() + offset
    }
}

impl TryFrom<u8> for Shape {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Shape::BareDeclaration,
            1 => Shape::Declaration,
            2 => Shape::Spacing,
            3 => Shape::InnerText,
            6 => Shape::SpacingAlt,
            7 => Shape::InnerTextAlt,
            other => {
                return Err(Error::MalformedTree(format!(
                    "unsupported shape tag {}",
                    other
                )))
            }
        })
    }
}

/// Unpacked per-node flag word.
///
/// Fields are truncated to their bit width on decode; the shape tag is kept
/// raw so malformed values reach the caller for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FlagWord {
    pub attribute_count: u8,
    pub shape: u8,
    pub child_count: u32,
}

impl FlagWord {
    /// Encoded size in bytes.
    pub const SIZE: u32 = 4;

    /// Largest attribute count the word can carry.
    pub const MAX_ATTRIBUTES: usize = ATTRIBUTE_MASK as usize;

    /// Largest child count the word can carry.
    pub const MAX_CHILDREN: usize = CHILD_MASK as usize;

    /// Child counts above this are legal but unusually large.
    pub const LARGE_CHILD_COUNT: u32 = 0xFFFF;

    pub fn new(attribute_count: u8, shape: Shape, child_count: u32) -> Self {
        Self {
            attribute_count,
            shape: shape as u8,
            child_count: child_count & CHILD_MASK,
        }
    }

    pub fn decode(word: u32) -> Self {
        Self {
            attribute_count: (word & ATTRIBUTE_MASK) as u8,
            shape: ((word >> SHAPE_SHIFT) & SHAPE_MASK) as u8,
            child_count: (word >> CHILD_SHIFT) & CHILD_MASK,
        }
    }

    pub fn encode(&self) -> u32 {
        (self.attribute_count as u32)
            | ((self.shape as u32 & SHAPE_MASK) << SHAPE_SHIFT)
            | ((self.child_count & CHILD_MASK) << CHILD_SHIFT)
    }

    /// The shape tag, if it is one of the meaningful values.
    pub fn shape(&self) -> Result<Shape> {
        Shape::try_from(self.shape)
    }

    /// Whether the child count needs more than 16 bits.
    pub fn is_unusually_large(&self) -> bool {
        self.child_count > Self::LARGE_CHILD_COUNT
    }

    /// Size of the record this word describes.
    pub fn record_size(&self) -> Result<u32> {
        Ok(self
            .shape()?
            .record_size(self.attribute_count as u32, self.child_count))
    }
}
