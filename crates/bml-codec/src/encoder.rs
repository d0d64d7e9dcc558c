//! BML encoder.
//!
//! Forward offsets are absolute, so every record position has to be known
//! before the first byte is written. Layout is computed in two passes:
//!
//! 1. Fixup and size: derive each node's flag word from its content and
//!    size its record from the shape table.
//! 2. Place: walk the tree in emission order, accumulating record sizes
//!    into absolute positions. A node's forward offset is the position of
//!    its first child.
//!
//! Emission order is the root, then for every node in depth-first
//! pre-order, that node's children as one contiguous sibling block. The
//! descendants of a block therefore follow the whole block, and earlier
//! siblings' subtrees are placed before later siblings' child blocks.
//!
//! ```text
//! header | node block | \0 \0 | names pool | text pool | \0
//!        16           block_data           block_strings  block_line_endings
//! ```

use byteorder::{LittleEndian, WriteBytesExt};
use tracing::debug;

use crate::decoder::MAX_DEPTH;
use crate::flags::FlagWord;
use crate::node::{BmlTree, NodeId};
use crate::pool::{Pool, PoolBases, StringPools};
use crate::{BmlHeader, Error, Result};

/// Per-node layout values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub flags: FlagWord,
    /// Absolute position of the record.
    pub position: u32,
    /// Encoded size of the record alone.
    pub size: u32,
    /// Position of the first child record, if the node has children.
    pub first_child: Option<u32>,
}

/// A laid-out tree, ready to be written.
#[derive(Debug)]
pub struct Encoder<'t> {
    tree: &'t BmlTree,
    /// Indexed by `NodeId::index()`.
    placements: Vec<Placement>,
    order: Vec<NodeId>,
    pools: StringPools,
    header: BmlHeader,
    bases: PoolBases,
    file_len: u32,
}

impl<'t> Encoder<'t> {
    /// Lay out `tree`: fix up flags, size and place records, fill the pools
    /// and compute the header boundaries.
    pub fn new(tree: &'t BmlTree) -> Result<Self> {
        let depth = tree.depth();
        if depth > MAX_DEPTH {
            return Err(Error::MalformedTree(format!(
                "tree is {} levels deep, at most {} can be decoded",
                depth, MAX_DEPTH
            )));
        }

        let mut placements = Vec::with_capacity(tree.len());
        for index in 0..tree.len() {
            let flags = tree.flags(NodeId::from_index(index))?;
            placements.push(Placement {
                flags,
                position: 0,
                size: flags.record_size()?,
                first_child: None,
            });
        }

        let order = emission_order(tree);

        let mut position = BmlHeader::SIZE;
        for &id in &order {
            let placement = &mut placements[id.index()];
            placement.position = position;
            position = position
                .checked_add(placement.size)
                .ok_or_else(|| Error::MalformedTree("node block exceeds 4 GiB".to_string()))?;
        }
        let node_block_len = position - BmlHeader::SIZE;

        for index in 0..tree.len() {
            let first_child = tree
                .node(NodeId::from_index(index))
                .children()
                .first()
                .map(|child| placements[child.index()].position);
            placements[index].first_child = first_child;
        }

        let mut pools = StringPools::new();
        for &id in &order {
            let node = tree.node(id);
            pools.intern(&node.text);
            for attribute in &node.attributes {
                pools.intern(&attribute.name);
                pools.intern(&attribute.value);
            }
            for reference in node.trailer.refs() {
                pools.intern(reference);
            }
        }

        let block_data = BmlHeader::SIZE + node_block_len + 1;
        let names_base = block_data + 1;
        let block_strings = names_base + pools.pool(Pool::Names).byte_len();
        let block_line_endings = block_strings + pools.pool(Pool::Text).byte_len();
        let file_len = block_line_endings + 1;

        debug!(
            nodes = tree.len(),
            node_block_len,
            names = pools.pool(Pool::Names).len(),
            text = pools.pool(Pool::Text).len(),
            file_len,
            "laid out BML tree"
        );

        Ok(Self {
            tree,
            placements,
            order,
            pools,
            header: BmlHeader::new(block_data, block_strings, block_line_endings),
            bases: PoolBases {
                names: names_base,
                text: block_strings,
            },
            file_len,
        })
    }

    pub fn header(&self) -> &BmlHeader {
        &self.header
    }

    pub fn placement(&self, id: NodeId) -> &Placement {
        &self.placements[id.index()]
    }

    /// Record emission order.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn pools(&self) -> &StringPools {
        &self.pools
    }

    pub fn bases(&self) -> PoolBases {
        self.bases
    }

    /// Total size of the encoded file.
    pub fn file_len(&self) -> u32 {
        self.file_len
    }

    /// Emit the file.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.file_len as usize);
        self.header.write(&mut out)?;

        for &id in &self.order {
            let placement = self.placement(id);
            let before = out.len() as u32;
            debug_assert_eq!(before, placement.position);

            self.write_record(&mut out, id, placement)?;

            let written = out.len() as u32 - before;
            if written != placement.size {
                return Err(Error::RecordSizeMismatch {
                    position: placement.position,
                    expected: placement.size,
                    actual: written,
                });
            }
        }

        // Node block padding: block_data and the byte before the names pool.
        out.resize(self.bases.names as usize, 0);
        out.extend_from_slice(&self.pools.export(Pool::Names));
        out.extend_from_slice(&self.pools.export(Pool::Text));
        out.push(0);

        debug_assert_eq!(out.len() as u32, self.file_len);
        Ok(out)
    }

    /// Write the encoded file to any writer.
    pub fn write_to<W: std::io::Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode()?)?;
        Ok(())
    }

    fn write_record(&self, out: &mut Vec<u8>, id: NodeId, placement: &Placement) -> Result<()> {
        let node = self.tree.node(id);
        let flags = placement.flags;

        self.pools.write_ref(out, &node.text, self.bases)?;
        out.write_u32::<LittleEndian>(flags.encode())?;

        for attribute in &node.attributes {
            attribute.write(out, &self.pools, self.bases)?;
        }

        for reference in node.trailer.refs() {
            self.pools.write_ref(out, reference, self.bases)?;
        }

        if flags.shape()?.has_offset(flags.child_count) {
            // A declaration with attributes always stores an offset; without
            // children it points just past its own record.
            let offset = placement
                .first_child
                .unwrap_or(placement.position + placement.size);
            out.write_u32::<LittleEndian>(offset)?;
        }

        Ok(())
    }
}

/// Root first, then each node's sibling block in depth-first pre-order.
fn emission_order(tree: &BmlTree) -> Vec<NodeId> {
    let mut order = Vec::with_capacity(tree.len());
    order.push(tree.root());

    let mut stack = vec![tree.root()];
    while let Some(id) = stack.pop() {
        let children = tree.node(id).children();
        order.extend_from_slice(children);
        stack.extend(children.iter().rev());
    }

    order
}

impl BmlTree {
    /// Serialize the tree to BML bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Encoder::new(self)?.encode()
    }
}
