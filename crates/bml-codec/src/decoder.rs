//! BML decoder.
//!
//! Records are not stored in tree order: every node with children holds an
//! absolute offset to a contiguous block of its child records. The decoder
//! walks the tree depth first with an explicit stack of sibling blocks, one
//! frame per open block, each remembering where its next record starts.
//!
//! Every decoded record is charged against the size of the node block, so
//! records that share or overlap a child block cannot multiply the work on
//! corrupt input.

use std::ops::Range;

use bml_common::BinaryReader;
use tracing::{trace, warn};

use crate::flags::{FlagWord, Shape};
use crate::node::{BmlTree, Node, NodeId, Trailer, DECLARATION_TAG};
use crate::pool::{Pool, PoolRegions, StringRef};
use crate::{Attribute, BmlHeader, Error, Result};

/// Deepest nesting accepted before the input is considered corrupt.
pub const MAX_DEPTH: usize = 4096;

/// A record as read from the file, before it is linked into the tree.
#[derive(Debug)]
struct Record {
    node: Node,
    flags: FlagWord,
    shape: Shape,
    start: u32,
    end: u32,
    offset: Option<u32>,
}

/// A sibling block being decoded.
#[derive(Debug)]
struct Frame {
    parent: NodeId,
    /// Position of the next sibling record.
    cursor: u32,
    remaining: u32,
    depth: usize,
}

/// Rebuilds a [`BmlTree`] from BML bytes.
#[derive(Debug)]
pub struct Decoder<'a> {
    reader: BinaryReader<'a>,
    header: BmlHeader,
    regions: PoolRegions,
    /// Record bytes left before the node block is exhausted.
    budget: u32,
}

impl<'a> Decoder<'a> {
    /// Validate the header and prepare to decode the node block.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let mut reader = BinaryReader::new(data);
        let header = BmlHeader::read(&mut reader)?;
        let regions = PoolRegions::from_header(&header);
        let budget = header.block_data().saturating_sub(BmlHeader::SIZE);

        Ok(Self {
            reader,
            header,
            regions,
            budget,
        })
    }

    pub fn header(&self) -> &BmlHeader {
        &self.header
    }

    /// Decode the whole tree.
    pub fn decode(mut self) -> Result<BmlTree> {
        self.read_tree()
    }

    fn read_tree(&mut self) -> Result<BmlTree> {
        let root = self.read_record()?;

        if root.node.text.value() != DECLARATION_TAG {
            return Err(Error::MalformedTree(format!(
                "root node is <{}>, expected the {} declaration",
                root.node.text, DECLARATION_TAG
            )));
        }
        if root.flags.child_count == 0 {
            return Err(Error::MalformedTree("declaration root has no children".to_string()));
        }
        if !matches!(root.shape, Shape::BareDeclaration | Shape::Declaration) {
            return Err(Error::MalformedTree(format!(
                "declaration root has shape {:?}",
                root.shape
            )));
        }

        let Record {
            node,
            flags,
            start,
            end,
            offset,
            ..
        } = root;

        let mut tree = BmlTree::new(node);
        // A bare declaration has no offset field; its children follow it.
        let first = self.child_block(
            tree.root(),
            start..end,
            offset.unwrap_or(end),
            flags.child_count,
            1,
        )?;

        let saved = self.reader.position();
        let result = self.read_blocks(&mut tree, first);
        self.reader.seek(saved);
        result?;

        Ok(tree)
    }

    /// Check a child offset against the record holding it and open a frame.
    fn child_block(
        &self,
        parent: NodeId,
        record: Range<u32>,
        offset: u32,
        count: u32,
        depth: usize,
    ) -> Result<Frame> {
        if depth > MAX_DEPTH {
            return Err(Error::MalformedTree(format!(
                "nesting deeper than {} levels",
                MAX_DEPTH
            )));
        }
        if offset < record.end || offset >= self.header.block_data() {
            return Err(Error::MalformedTree(format!(
                "child offset {} of node at {} must lie between its record end {} and the node block end {}",
                offset,
                record.start,
                record.end,
                self.header.block_data()
            )));
        }

        Ok(Frame {
            parent,
            cursor: offset,
            remaining: count,
            depth,
        })
    }

    /// Decode sibling blocks depth first until the stack runs dry.
    fn read_blocks(&mut self, tree: &mut BmlTree, first: Frame) -> Result<()> {
        let mut stack = vec![first];

        while let Some(frame) = stack.last_mut() {
            if frame.remaining == 0 {
                stack.pop();
                continue;
            }
            frame.remaining -= 1;
            let (parent, depth) = (frame.parent, frame.depth);

            self.reader.seek(frame.cursor as usize);
            let record = self.read_record()?;
            frame.cursor = record.end;

            if matches!(record.shape, Shape::BareDeclaration | Shape::Declaration) {
                warn!(
                    "node <{}> at {} uses declaration shape {:?} below the root",
                    record.node.text, record.start, record.shape
                );
            }

            let Record {
                node,
                flags,
                start,
                end,
                offset,
                ..
            } = record;
            let id = tree.add_child(parent, node);

            if flags.child_count > 0 {
                let offset = offset.ok_or_else(|| {
                    Error::MalformedTree(format!(
                        "node at {} has {} children but no child offset",
                        start, flags.child_count
                    ))
                })?;
                stack.push(self.child_block(id, start..end, offset, flags.child_count, depth + 1)?);
            }
        }

        Ok(())
    }

    /// Read one record at the cursor, consuming exactly its encoded size.
    fn read_record(&mut self) -> Result<Record> {
        let start = self.reader.position() as u32;

        let text = StringRef::read(&mut self.reader, Pool::Names, &self.regions)?;
        let flags = FlagWord::decode(self.reader.read_u32()?);
        let shape = flags.shape()?;

        if flags.is_unusually_large() {
            warn!(
                "node <{}> at {} claims {} children",
                text, start, flags.child_count
            );
        }

        let mut attributes = Vec::new();
        for _ in 0..flags.attribute_count {
            attributes.push(Attribute::read(&mut self.reader, &self.regions)?);
        }

        let trailer = if shape.has_inner_text() {
            Trailer::InnerText {
                inner: StringRef::read(&mut self.reader, Pool::Text, &self.regions)?,
                end: StringRef::read(&mut self.reader, Pool::Text, &self.regions)?,
            }
        } else {
            Trailer::Spacing {
                end: StringRef::read(&mut self.reader, Pool::Text, &self.regions)?,
            }
        };

        let offset = if shape.has_offset(flags.child_count) {
            Some(self.reader.read_u32()?)
        } else {
            None
        };

        let end = self.reader.position() as u32;
        self.budget = self.budget.checked_sub(end - start).ok_or_else(|| {
            Error::MalformedTree(format!(
                "record at {} overruns the node block; child blocks overlap",
                start
            ))
        })?;
        trace!(start, end, ?shape, children = flags.child_count, "read record <{}>", text);

        let mut node = Node::new(text, trailer);
        node.attributes = attributes;

        Ok(Record {
            node,
            flags,
            shape,
            start,
            end,
            offset,
        })
    }
}

impl BmlTree {
    /// Check if data starts with the BML magic.
    pub fn is_bml(data: &[u8]) -> bool {
        data.len() >= BmlHeader::MAGIC_LEN && &data[..BmlHeader::MAGIC_LEN] == BmlHeader::MAGIC
    }

    /// Parse a BML file from bytes.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use bml_codec::BmlTree;
    ///
    /// let data = std::fs::read("level.bml")?;
    /// let tree = BmlTree::parse(&data)?;
    /// println!("{} nodes", tree.len());
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn parse(data: &[u8]) -> Result<Self> {
        Decoder::new(data)?.decode()
    }

    /// Read the header of a BML file without decoding the tree.
    pub fn read_header(data: &[u8]) -> Result<BmlHeader> {
        Ok(*Decoder::new(data)?.header())
    }
}

#[cfg(test)]
mod tests {
    use byteorder::{ByteOrder, LittleEndian};

    use super::*;

    fn u32_at(data: &[u8], position: usize) -> u32 {
        LittleEndian::read_u32(&data[position..position + 4])
    }

    /// A node-block word; string references are relative to their pool.
    enum Word {
        Raw(u32),
        Name(u32),
        Text(u32),
    }

    fn flags(attributes: u8, shape: Shape, children: u32) -> Word {
        Word::Raw(FlagWord::new(attributes, shape, children).encode())
    }

    /// Lay out a complete file around the given node block and pools.
    fn assemble(words: &[Word], names: &[u8], text: &[u8]) -> Vec<u8> {
        let block_data = BmlHeader::SIZE + 4 * words.len() as u32 + 1;
        let names_base = block_data + 1;
        let block_strings = names_base + names.len() as u32;
        let block_line_endings = block_strings + text.len() as u32;

        let mut out = Vec::new();
        BmlHeader::new(block_data, block_strings, block_line_endings)
            .write(&mut out)
            .unwrap();
        for word in words {
            let value = match *word {
                Word::Raw(value) => value,
                Word::Name(offset) => names_base + offset,
                Word::Text(offset) => block_strings + offset,
            };
            out.extend_from_slice(&value.to_le_bytes());
        }
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(names);
        out.extend_from_slice(text);
        out.push(0);
        out
    }

    fn declaration() -> Node {
        Node::new(
            StringRef::name(DECLARATION_TAG),
            Trailer::Spacing {
                end: StringRef::text("\r\n"),
            },
        )
    }

    fn chain(depth: usize) -> BmlTree {
        let mut tree = BmlTree::new(declaration());
        let mut parent = tree.root();
        for _ in 0..depth {
            parent = tree.add_child(parent, Node::element("n"));
        }
        tree
    }

    /// Hand-assembled file: `?xml` root (no attributes) with one `a` child
    /// holding inner text.
    ///
    /// ```text
    /// 0   header
    /// 16  root:  text=?xml  flags(0 attrs, shape 0, 1 child)  end
    /// 28  a:     text=a     flags(0 attrs, shape 3, 0 children) inner end2
    /// 44  null, 45 block_data (null)
    /// 46  pool A: "?xml\0a\0"
    /// 53  pool B: "\r\n\0hi\0"
    /// 59  block_line_endings (null)
    /// ```
    fn sample() -> Vec<u8> {
        let mut out = Vec::new();
        BmlHeader::new(45, 53, 59).write(&mut out).unwrap();

        let words: [u32; 7] = [
            46,                                               // ?xml
            FlagWord::new(0, Shape::BareDeclaration, 1).encode(),
            53,                                               // \r\n
            51,                                               // a
            FlagWord::new(0, Shape::InnerText, 0).encode(),
            56,                                               // hi
            53,                                               // \r\n
        ];
        for word in words {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(b"?xml\0a\0");
        out.extend_from_slice(b"\r\n\0hi\0");
        out.push(0);
        out
    }

    #[test]
    fn test_is_bml() {
        assert!(BmlTree::is_bml(b"xml\0extra"));
        assert!(!BmlTree::is_bml(b"<?xml"));
        assert!(!BmlTree::is_bml(b"xm"));
    }

    #[test]
    fn test_decode_hand_built_file() {
        let data = sample();
        assert_eq!(data.len(), 60);

        let tree = BmlTree::parse(&data).unwrap();
        assert_eq!(tree.len(), 2);

        let root = tree.node(tree.root());
        assert!(root.is_declaration());
        assert_eq!(root.trailer.spacing().unwrap().value(), "\r\n");

        let (_, a) = tree.children(tree.root()).next().unwrap();
        assert_eq!(a.name(), "a");
        assert_eq!(a.trailer.inner_text().unwrap().value(), "hi");
        assert_eq!(a.trailer.line_ending().unwrap().value(), "\r\n");
    }

    #[test]
    fn test_corrupted_magic() {
        let mut data = sample();
        data[1] = b'?';
        assert!(matches!(BmlTree::parse(&data), Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn test_root_must_be_declaration() {
        let mut data = sample();
        // Point the root text at "a".
        data[16..20].copy_from_slice(&51u32.to_le_bytes());
        assert!(matches!(BmlTree::parse(&data), Err(Error::MalformedTree(_))));
    }

    #[test]
    fn test_root_must_have_children() {
        let mut data = sample();
        let flags = FlagWord::new(0, Shape::BareDeclaration, 0).encode();
        data[20..24].copy_from_slice(&flags.to_le_bytes());
        assert!(matches!(BmlTree::parse(&data), Err(Error::MalformedTree(_))));
    }

    #[test]
    fn test_unknown_shape() {
        let mut data = sample();
        let word = u32_at(&data, 32) & !(0x7 << 8) | (5 << 8);
        data[32..36].copy_from_slice(&word.to_le_bytes());
        assert!(matches!(BmlTree::parse(&data), Err(Error::MalformedTree(_))));
    }

    #[test]
    fn test_string_outside_pool() {
        let mut data = sample();
        // Inner text pointing into the names pool.
        data[36..40].copy_from_slice(&46u32.to_le_bytes());
        assert!(matches!(
            BmlTree::parse(&data),
            Err(Error::StringOffsetOutOfBounds { pool: Pool::Text, .. })
        ));
    }

    #[test]
    fn test_truncated_children_fail() {
        let mut data = sample();
        // Claim three children where only one record exists.
        let flags = FlagWord::new(0, Shape::BareDeclaration, 3).encode();
        data[20..24].copy_from_slice(&flags.to_le_bytes());
        assert!(BmlTree::parse(&data).is_err());
    }

    #[test]
    fn test_sample_matches_assembled_layout() {
        let words = [
            Word::Name(0),
            flags(0, Shape::BareDeclaration, 1),
            Word::Text(0),
            Word::Name(5),
            flags(0, Shape::InnerText, 0),
            Word::Text(3),
            Word::Text(0),
        ];
        assert_eq!(assemble(&words, b"?xml\0a\0", b"\r\n\0hi\0"), sample());
    }

    #[test]
    fn test_alternate_shapes() {
        // ?xml
        // └── a k="v"        shape 6, two children
        //     ├── b "hi"     shape 7, leaf
        //     └── c "hi"     shape 7, one child
        //         └── d      shape 6, leaf
        let words = [
            // 16: ?xml
            Word::Name(0),
            flags(0, Shape::BareDeclaration, 1),
            Word::Text(0),
            // 28: a
            Word::Name(5),
            flags(1, Shape::SpacingAlt, 2),
            Word::Name(7),
            Word::Name(9),
            Word::Text(0),
            Word::Raw(52),
            // 52: b
            Word::Name(11),
            flags(0, Shape::InnerTextAlt, 0),
            Word::Text(3),
            Word::Text(0),
            // 68: c
            Word::Name(13),
            flags(0, Shape::InnerTextAlt, 1),
            Word::Text(3),
            Word::Text(0),
            Word::Raw(88),
            // 88: d
            Word::Name(15),
            flags(0, Shape::SpacingAlt, 0),
            Word::Text(6),
        ];
        let data = assemble(&words, b"?xml\0a\0k\0v\0b\0c\0d\0", b"\r\n\0hi\0\0");

        let mut expected = BmlTree::new(declaration());
        let a = expected.add_child(
            expected.root(),
            Node::element("a").attr("k", "v").spacing("\r\n"),
        );
        expected.add_child(a, Node::element("b").inner_text("hi", "\r\n"));
        let c = expected.add_child(a, Node::element("c").inner_text("hi", "\r\n"));
        expected.add_child(c, Node::element("d"));

        let tree = BmlTree::parse(&data).unwrap();
        assert_eq!(tree, expected);

        // Re-encoding normalizes to the primary shapes.
        let reencoded = tree.to_bytes().unwrap();
        assert_eq!(BmlTree::parse(&reencoded).unwrap(), expected);
    }

    #[test]
    fn test_declaration_shape_below_root_is_tolerated() {
        let words = [
            Word::Name(0),
            flags(0, Shape::BareDeclaration, 1),
            Word::Text(0),
            // Shape 1 always carries an offset, even without children.
            Word::Name(5),
            flags(0, Shape::Declaration, 0),
            Word::Text(0),
            Word::Raw(0),
        ];
        let data = assemble(&words, b"?xml\0a\0", b"\r\n\0");

        let tree = BmlTree::parse(&data).unwrap();
        let (_, a) = tree.children(tree.root()).next().unwrap();
        assert_eq!(a.name(), "a");
        assert_eq!(a.trailer.spacing().unwrap().value(), "\r\n");
    }

    fn shared_block_words(second_offset: u32) -> Vec<Word> {
        vec![
            // 16: ?xml with two children
            Word::Name(0),
            flags(0, Shape::BareDeclaration, 2),
            Word::Text(0),
            // 28: first child, block at 60
            Word::Name(5),
            flags(0, Shape::Spacing, 1),
            Word::Text(0),
            Word::Raw(60),
            // 44: second child
            Word::Name(5),
            flags(0, Shape::Spacing, 1),
            Word::Text(0),
            Word::Raw(second_offset),
            // 60: the only grandchild record
            Word::Name(5),
            flags(0, Shape::Spacing, 0),
            Word::Text(0),
        ]
    }

    #[test]
    fn test_shared_child_block_is_rejected() {
        let data = assemble(&shared_block_words(60), b"?xml\0a\0", b"\r\n\0");
        assert!(matches!(BmlTree::parse(&data), Err(Error::MalformedTree(_))));
    }

    #[test]
    fn test_child_offset_inside_own_record() {
        // Second child points back into itself.
        let data = assemble(&shared_block_words(48), b"?xml\0a\0", b"\r\n\0");
        assert!(matches!(BmlTree::parse(&data), Err(Error::MalformedTree(_))));
    }

    #[test]
    fn test_child_offset_past_node_block() {
        let data = assemble(&shared_block_words(200), b"?xml\0a\0", b"\r\n\0");
        assert!(matches!(BmlTree::parse(&data), Err(Error::MalformedTree(_))));
    }

    #[test]
    fn test_cursor_restored_after_decode() {
        let data = sample();
        let mut decoder = Decoder::new(&data).unwrap();
        decoder.read_tree().unwrap();
        assert_eq!(decoder.reader.position(), 28);

        let mut data = sample();
        let flags = FlagWord::new(0, Shape::BareDeclaration, 3).encode();
        data[20..24].copy_from_slice(&flags.to_le_bytes());
        let mut decoder = Decoder::new(&data).unwrap();
        assert!(decoder.read_tree().is_err());
        assert_eq!(decoder.reader.position(), 28);
    }

    #[test]
    fn test_decode_at_max_depth() {
        let tree = chain(MAX_DEPTH);
        assert_eq!(tree.depth(), MAX_DEPTH);

        let decoded = BmlTree::parse(&tree.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.depth(), MAX_DEPTH);
        assert_eq!(decoded, tree);
    }
}
