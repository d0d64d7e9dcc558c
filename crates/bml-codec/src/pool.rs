//! String references and the two deduplicated string pools.
//!
//! Nodes and attributes never store text inline. Each text field is a
//! 4-byte absolute file offset pointing into one of two pools that follow
//! the node block:
//!
//! - [`Pool::Names`] (pool A): element names, attribute names and values.
//! - [`Pool::Text`] (pool B): inner text and line-ending literals.
//!
//! A [`StringRef`] keeps the literal itself; offsets only exist once the
//! encoder has laid out the file and asks [`StringPools::resolve`] for them.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;

use bml_common::BinaryReader;
use byteorder::{LittleEndian, WriteBytesExt};

use crate::{BmlHeader, Error, Result};

/// Selects which pool owns a literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pool {
    /// Pool A: names, attribute values, declaration attributes.
    Names,
    /// Pool B: inner text and line endings.
    Text,
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pool::Names => f.write_str("names"),
            Pool::Text => f.write_str("text"),
        }
    }
}

/// A literal owned by one of the pools.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StringRef {
    pool: Pool,
    value: String,
}

impl StringRef {
    pub fn new(pool: Pool, value: impl Into<String>) -> Self {
        Self {
            pool,
            value: value.into(),
        }
    }

    /// A literal for the names pool.
    pub fn name(value: impl Into<String>) -> Self {
        Self::new(Pool::Names, value)
    }

    /// A literal for the text pool.
    pub fn text(value: impl Into<String>) -> Self {
        Self::new(Pool::Text, value)
    }

    pub fn pool(&self) -> Pool {
        self.pool
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Read a 4-byte reference at the cursor and resolve its literal.
    ///
    /// The offset must land inside `pool`'s region. The literal is read in
    /// place, so the cursor only advances past the reference itself.
    pub fn read(reader: &mut BinaryReader<'_>, pool: Pool, regions: &PoolRegions) -> Result<Self> {
        let offset = reader.read_u32()?;
        let region = regions.region(pool);

        if !region.contains(&offset) {
            return Err(Error::StringOffsetOutOfBounds {
                offset,
                pool,
                start: region.start,
                end: region.end,
            });
        }

        let value = reader.cstring_at(offset as usize)?;
        Ok(Self::new(pool, value))
    }
}

impl fmt::Display for StringRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Byte ranges the pools occupy in a decoded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolRegions {
    names: Range<u32>,
    text: Range<u32>,
}

impl PoolRegions {
    pub fn from_header(header: &BmlHeader) -> Self {
        Self {
            names: header.names_region(),
            text: header.text_region(),
        }
    }

    pub fn region(&self, pool: Pool) -> Range<u32> {
        match pool {
            Pool::Names => self.names.clone(),
            Pool::Text => self.text.clone(),
        }
    }
}

/// Absolute file offsets where each pool starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBases {
    pub names: u32,
    pub text: u32,
}

impl PoolBases {
    pub fn base(&self, pool: Pool) -> u32 {
        match pool {
            Pool::Names => self.names,
            Pool::Text => self.text,
        }
    }
}

/// One deduplicated, null-terminated string pool.
///
/// Literals keep the offset they were first interned at; the pool only grows.
#[derive(Debug, Default)]
pub struct StringPool {
    strings: Vec<String>,
    offsets: HashMap<String, u32>,
    current_offset: u32,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a string if not already present and return its relative offset.
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&offset) = self.offsets.get(s) {
            return offset;
        }

        let offset = self.current_offset;
        self.offsets.insert(s.to_string(), offset);
        self.current_offset += s.len() as u32 + 1; // +1 for null terminator
        self.strings.push(s.to_string());
        offset
    }

    /// Relative offset of an interned string.
    pub fn get(&self, s: &str) -> Option<u32> {
        self.offsets.get(s).copied()
    }

    /// Size of the exported pool in bytes.
    pub fn byte_len(&self) -> u32 {
        self.current_offset
    }

    /// Number of distinct literals.
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn clear(&mut self) {
        self.strings.clear();
        self.offsets.clear();
        self.current_offset = 0;
    }

    /// Serialize the pool in first-intern order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.current_offset as usize);
        for s in &self.strings {
            bytes.extend_from_slice(s.as_bytes());
            bytes.push(0);
        }
        bytes
    }
}

/// Both pools of one conversion.
#[derive(Debug, Default)]
pub struct StringPools {
    names: StringPool,
    text: StringPool,
}

impl StringPools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool(&self, pool: Pool) -> &StringPool {
        match pool {
            Pool::Names => &self.names,
            Pool::Text => &self.text,
        }
    }

    fn pool_mut(&mut self, pool: Pool) -> &mut StringPool {
        match pool {
            Pool::Names => &mut self.names,
            Pool::Text => &mut self.text,
        }
    }

    /// Intern a reference into its pool, returning the relative offset.
    pub fn intern(&mut self, reference: &StringRef) -> u32 {
        self.pool_mut(reference.pool).intern(&reference.value)
    }

    /// Absolute file offset of an interned reference.
    pub fn resolve(&self, reference: &StringRef, bases: PoolBases) -> Result<u32> {
        let relative = self
            .pool(reference.pool)
            .get(&reference.value)
            .ok_or_else(|| Error::UninternedString {
                value: reference.value.clone(),
                pool: reference.pool,
            })?;

        Ok(bases.base(reference.pool) + relative)
    }

    /// Resolve a reference and append its offset to `out`.
    pub fn write_ref(&self, out: &mut Vec<u8>, reference: &StringRef, bases: PoolBases) -> Result<()> {
        let offset = self.resolve(reference, bases)?;
        out.write_u32::<LittleEndian>(offset)?;
        Ok(())
    }

    /// Serialized bytes of one pool.
    pub fn export(&self, pool: Pool) -> Vec<u8> {
        self.pool(pool).to_bytes()
    }

    /// Clear both pools before an unrelated conversion.
    pub fn reset(&mut self) {
        self.names.clear();
        self.text.clear();
    }
}
