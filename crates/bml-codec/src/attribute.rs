//! BML attribute record.

use bml_common::BinaryReader;

use crate::pool::{Pool, PoolBases, PoolRegions, StringPools, StringRef};
use crate::Result;

/// An attribute of a BML node.
///
/// Both halves always live in the names pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Attribute {
    pub name: StringRef,
    pub value: StringRef,
}

impl Attribute {
    /// Encoded size: two string references.
    pub const SIZE: u32 = 8;

    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: StringRef::name(name),
            value: StringRef::name(value),
        }
    }

    pub fn name(&self) -> &str {
        self.name.value()
    }

    pub fn value(&self) -> &str {
        self.value.value()
    }

    pub fn read(reader: &mut BinaryReader<'_>, regions: &PoolRegions) -> Result<Self> {
        Ok(Self {
            name: StringRef::read(reader, Pool::Names, regions)?,
            value: StringRef::read(reader, Pool::Names, regions)?,
        })
    }

    pub fn write(&self, out: &mut Vec<u8>, pools: &StringPools, bases: PoolBases) -> Result<()> {
        pools.write_ref(out, &self.name, bases)?;
        pools.write_ref(out, &self.value, bases)
    }
}
