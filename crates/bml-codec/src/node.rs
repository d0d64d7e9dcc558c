//! BML node model.
//!
//! Nodes are stored in a flat arena ([`BmlTree`]) and reference their
//! children by [`NodeId`]. The flag word of a node is never stored: it is
//! recomputed from the node's content whenever the tree is serialized.

use std::fmt;

use crate::flags::{FlagWord, Shape};
use crate::pool::StringRef;
use crate::{Attribute, Error, Result};

/// Text of the synthetic root node standing in for the XML declaration.
pub const DECLARATION_TAG: &str = "?xml";

/// Index of a node inside its [`BmlTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Trailing text fields of a node record, keyed by shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Trailer {
    /// Closing-tag spacing ("end"). Shapes 0, 1, 2 and 6.
    Spacing { end: StringRef },
    /// Inner text and the line ending after the closing tag ("end2").
    /// Shapes 3 and 7.
    InnerText { inner: StringRef, end: StringRef },
}

impl Trailer {
    /// Spacing written after an opening tag, if this is a spacing trailer.
    pub fn spacing(&self) -> Option<&StringRef> {
        match self {
            Trailer::Spacing { end } => Some(end),
            Trailer::InnerText { .. } => None,
        }
    }

    pub fn inner_text(&self) -> Option<&StringRef> {
        match self {
            Trailer::Spacing { .. } => None,
            Trailer::InnerText { inner, .. } => Some(inner),
        }
    }

    /// Line ending written after a closing tag, if this carries inner text.
    pub fn line_ending(&self) -> Option<&StringRef> {
        match self {
            Trailer::Spacing { .. } => None,
            Trailer::InnerText { end, .. } => Some(end),
        }
    }

    /// References in record order.
    pub fn refs(&self) -> impl Iterator<Item = &StringRef> {
        let (first, second) = match self {
            Trailer::Spacing { end } => (end, None),
            Trailer::InnerText { inner, end } => (inner, Some(end)),
        };
        std::iter::once(first).chain(second)
    }
}

/// A single BML node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Element name, or [`DECLARATION_TAG`] for the root.
    pub text: StringRef,
    /// Attributes in declaration order.
    pub attributes: Vec<Attribute>,
    pub trailer: Trailer,
    children: Vec<NodeId>,
}

impl Node {
    pub fn new(text: StringRef, trailer: Trailer) -> Self {
        Self {
            text,
            attributes: Vec::new(),
            trailer,
            children: Vec::new(),
        }
    }

    /// An element with empty closing spacing.
    pub fn element(name: impl Into<String>) -> Self {
        Self::new(
            StringRef::name(name),
            Trailer::Spacing {
                end: StringRef::text(""),
            },
        )
    }

    /// Add an attribute to this node.
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push(Attribute::new(name, value));
        self
    }

    /// Replace the trailer with closing spacing.
    pub fn spacing(mut self, end: impl Into<String>) -> Self {
        self.trailer = Trailer::Spacing {
            end: StringRef::text(end),
        };
        self
    }

    /// Replace the trailer with inner text and its line ending.
    pub fn inner_text(mut self, inner: impl Into<String>, end: impl Into<String>) -> Self {
        self.trailer = Trailer::InnerText {
            inner: StringRef::text(inner),
            end: StringRef::text(end),
        };
        self
    }

    pub fn name(&self) -> &str {
        self.text.value()
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn is_declaration(&self) -> bool {
        self.text.value() == DECLARATION_TAG
    }
}

/// A BML document: an arena of nodes rooted at the declaration node.
#[derive(Debug, Clone)]
pub struct BmlTree {
    nodes: Vec<Node>,
}

impl BmlTree {
    /// Create a tree holding only `root`. Any child ids on `root` are dropped.
    pub fn new(mut root: Node) -> Self {
        root.children.clear();
        Self { nodes: vec![root] }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn is_root(&self, id: NodeId) -> bool {
        id.0 == 0
    }

    /// Get a node by id.
    ///
    /// Ids are only minted by this tree, so a foreign id is a caller bug.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    /// Append `node` as the last child of `parent`.
    pub fn add_child(&mut self, parent: NodeId, mut node: Node) -> NodeId {
        node.children.clear();
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.nodes[parent.index()].children.push(id);
        id
    }

    /// Children of a node, in order.
    pub fn children(&self, id: NodeId) -> impl Iterator<Item = (NodeId, &Node)> {
        self.node(id)
            .children
            .iter()
            .map(move |&child| (child, self.node(child)))
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All ids in depth-first pre-order.
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.node(id).children.iter().rev());
        }
        order
    }

    /// Depth of the deepest node; the root alone has depth 0.
    pub fn depth(&self) -> usize {
        let mut deepest = 0;
        let mut stack = vec![(self.root(), 0usize)];
        while let Some((id, depth)) = stack.pop() {
            deepest = deepest.max(depth);
            stack.extend(self.node(id).children.iter().map(|&c| (c, depth + 1)));
        }
        deepest
    }

    /// Recompute the flag word of a node from its current content.
    pub fn flags(&self, id: NodeId) -> Result<FlagWord> {
        let node = self.node(id);
        let is_root = self.is_root(id);

        if node.attributes.len() > FlagWord::MAX_ATTRIBUTES {
            return Err(Error::TooManyAttributes {
                element: node.name().to_string(),
                count: node.attributes.len(),
            });
        }
        if node.children.len() > FlagWord::MAX_CHILDREN {
            return Err(Error::TooManyChildren {
                element: node.name().to_string(),
                count: node.children.len(),
            });
        }
        if is_root && node.trailer.inner_text().is_some() {
            return Err(Error::MalformedTree(
                "the declaration root cannot carry inner text".to_string(),
            ));
        }

        let shape = Shape::derive(
            is_root,
            node.trailer.inner_text().is_some(),
            node.attributes.len(),
        );

        Ok(FlagWord::new(
            node.attributes.len() as u8,
            shape,
            node.children.len() as u32,
        ))
    }

    fn subtree_eq(&self, id: NodeId, other: &BmlTree, other_id: NodeId) -> bool {
        let mut pending = vec![(id, other_id)];

        while let Some((x, y)) = pending.pop() {
            let (a, b) = (self.node(x), other.node(y));
            let same = a.text == b.text
                && a.attributes == b.attributes
                && a.trailer == b.trailer
                && a.children.len() == b.children.len()
                && self.flags(x).ok() == other.flags(y).ok();
            if !same {
                return false;
            }
            pending.extend(a.children.iter().copied().zip(b.children.iter().copied()));
        }

        true
    }
}

/// Structural equality: same content and child order, regardless of how
/// the arenas happen to be laid out.
impl PartialEq for BmlTree {
    fn eq(&self, other: &Self) -> bool {
        self.subtree_eq(self.root(), other, other.root())
    }
}

impl Eq for BmlTree {}
