//! BML header structure.

use std::ops::Range;

use bml_common::BinaryReader;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::{Error, Result};

/// BML file header.
///
/// This structure follows the 4-byte magic "xml\0" at the start of the file.
/// The three boundaries split the file into the node block and the two
/// string pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct BmlHeader {
    /// End of the node block, plus its null padding byte.
    block_data: U32,
    /// Start of the text pool (end of the names pool).
    block_strings: U32,
    /// End of the text pool; the trailing null byte sits here.
    block_line_endings: U32,
}

impl BmlHeader {
    /// The magic bytes at the start of a BML file.
    pub const MAGIC: &'static [u8; 4] = b"xml\0";

    /// Size of the magic bytes.
    pub const MAGIC_LEN: usize = 4;

    /// Size of magic plus boundaries; the root record starts here.
    pub const SIZE: u32 = 16;

    /// Create a header from already fixed-up block boundaries.
    pub fn new(block_data: u32, block_strings: u32, block_line_endings: u32) -> Self {
        Self {
            block_data: U32::new(block_data),
            block_strings: U32::new(block_strings),
            block_line_endings: U32::new(block_line_endings),
        }
    }

    pub fn block_data(&self) -> u32 {
        self.block_data.get()
    }

    pub fn block_strings(&self) -> u32 {
        self.block_strings.get()
    }

    pub fn block_line_endings(&self) -> u32 {
        self.block_line_endings.get()
    }

    /// Byte range of the names pool (pool A).
    pub fn names_region(&self) -> Range<u32> {
        self.block_data() + 1..self.block_strings()
    }

    /// Byte range of the text pool (pool B).
    pub fn text_region(&self) -> Range<u32> {
        self.block_strings()..self.block_line_endings()
    }

    /// Read and validate the header at the reader's position.
    ///
    /// The magic is checked before anything else is consumed.
    pub fn read(reader: &mut BinaryReader<'_>) -> Result<Self> {
        reader.expect_magic(Self::MAGIC).map_err(|e| match e {
            bml_common::Error::InvalidMagic { actual, .. } => {
                Error::MalformedHeader(format!("expected magic 'xml\\0', got {:?}", actual))
            }
            other => Error::Common(other),
        })?;

        let header: Self = reader
            .read_struct()
            .map_err(|_| Error::MalformedHeader("truncated header".to_string()))?;
        header.validate(reader.len())?;

        Ok(header)
    }

    /// Check `block_data < block_strings < block_line_endings < stream_len`.
    pub fn validate(&self, stream_len: usize) -> Result<()> {
        let (data, strings, endings) = (
            self.block_data(),
            self.block_strings(),
            self.block_line_endings(),
        );

        if data <= Self::SIZE || data >= strings {
            return Err(Error::MalformedHeader(format!(
                "node block boundary {} must lie between the header and the string block {}",
                data, strings
            )));
        }
        if strings >= endings {
            return Err(Error::MalformedHeader(format!(
                "string block {} must precede line-ending block {}",
                strings, endings
            )));
        }
        if endings as usize >= stream_len {
            return Err(Error::MalformedHeader(format!(
                "line-ending block {} lies beyond the end of the stream ({} bytes)",
                endings, stream_len
            )));
        }

        Ok(())
    }

    /// Append the magic and boundaries to `out`.
    pub fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        for (field, value) in [
            ("block_data", self.block_data()),
            ("block_strings", self.block_strings()),
            ("block_line_endings", self.block_line_endings()),
        ] {
            if value == 0 {
                return Err(Error::UnsetBlockBoundary { field });
            }
        }

        out.extend_from_slice(Self::MAGIC);
        out.extend_from_slice(self.as_bytes());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(data: u32, strings: u32, endings: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        BmlHeader::new(data, strings, endings).write(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_header_size() {
        assert_eq!(
            BmlHeader::MAGIC_LEN + std::mem::size_of::<BmlHeader>(),
            BmlHeader::SIZE as usize
        );
    }

    #[test]
    fn test_read_valid_header() {
        let mut bytes = header_bytes(40, 50, 60);
        bytes.resize(61, 0);

        let mut reader = BinaryReader::new(&bytes);
        let header = BmlHeader::read(&mut reader).unwrap();

        assert_eq!(header.block_data(), 40);
        assert_eq!(header.block_strings(), 50);
        assert_eq!(header.block_line_endings(), 60);
        assert_eq!(header.names_region(), 41..50);
        assert_eq!(header.text_region(), 50..60);
        assert_eq!(reader.position(), 16);
    }

    #[test]
    fn test_little_endian_layout() {
        let bytes = header_bytes(0x0102_0304, 0x0102_0305, 0x0102_0306);
        assert_eq!(&bytes[..4], b"xml\0");
        assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn test_bad_magic_consumes_nothing() {
        let mut bytes = header_bytes(40, 50, 60);
        bytes[0] = b'X';
        bytes.resize(61, 0);

        let mut reader = BinaryReader::new(&bytes);
        let result = BmlHeader::read(&mut reader);

        assert!(matches!(result, Err(Error::MalformedHeader(_))));
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_ordering_violations() {
        for (data, strings, endings) in [(50, 40, 60), (40, 60, 60), (40, 50, 45)] {
            let mut bytes = header_bytes(data, strings, endings);
            bytes.resize(100, 0);
            let result = BmlHeader::read(&mut BinaryReader::new(&bytes));
            assert!(matches!(result, Err(Error::MalformedHeader(_))));
        }
    }

    #[test]
    fn test_line_endings_past_stream_end() {
        let mut bytes = header_bytes(40, 50, 60);
        bytes.resize(60, 0);

        let result = BmlHeader::read(&mut BinaryReader::new(&bytes));
        assert!(matches!(result, Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn test_truncated_header() {
        let result = BmlHeader::read(&mut BinaryReader::new(b"xml\0\x01\x02"));
        assert!(matches!(result, Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn test_write_rejects_unset_boundary() {
        let mut out = Vec::new();
        let result = BmlHeader::new(40, 0, 60).write(&mut out);

        assert!(matches!(
            result,
            Err(Error::UnsetBlockBoundary { field: "block_strings" })
        ));
        assert!(out.is_empty());
    }
}
