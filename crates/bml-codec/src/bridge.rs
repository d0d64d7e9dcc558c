//! Conversion between [`BmlTree`] and XML.
//!
//! BML stores the XML declaration as a synthetic `?xml` root node whose
//! attributes are the declaration fields, with the document element as its
//! child. Formatting survives the trip as literals: the spacing after an
//! opening tag ("end") and the line ending after a closing tag ("end2")
//! are written back verbatim instead of being re-indented.

use std::io::Write;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use tracing::warn;

use crate::flags::FlagWord;
use crate::markup::{XmlContent, XmlDocument, XmlElement};
use crate::node::{BmlTree, Node, NodeId, Trailer, DECLARATION_TAG};
use crate::pool::StringRef;
use crate::{Attribute, Error, Result, MAX_DEPTH};

/// Options for building a BML tree from XML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOptions {
    /// Literal stored as closing-tag spacing and inner-text line ending.
    pub line_ending: String,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            line_ending: "\r\n".to_string(),
        }
    }
}

impl ImportOptions {
    pub fn with_line_ending(line_ending: impl Into<String>) -> Self {
        Self {
            line_ending: line_ending.into(),
        }
    }
}

/// Parse XML text into a BML tree.
///
/// # Example
///
/// ```
/// use bml_codec::{bridge, BmlTree, ImportOptions};
///
/// let xml = r#"<?xml version="1.0"?><Config name="test"><Item/></Config>"#;
/// let tree = bridge::from_xml_str(xml, &ImportOptions::default())?;
/// let bytes = tree.to_bytes()?;
///
/// assert_eq!(BmlTree::parse(&bytes)?, tree);
/// # Ok::<(), bml_codec::Error>(())
/// ```
pub fn from_xml_str(xml: &str, options: &ImportOptions) -> Result<BmlTree> {
    let document = XmlDocument::parse(xml)?;
    from_xml(&document, options)
}

/// Build a BML tree from a parsed XML document.
///
/// The whole document is checked before any node is created, so a failure
/// never leaves a half-built tree behind.
pub fn from_xml(document: &XmlDocument, options: &ImportOptions) -> Result<BmlTree> {
    let element = document
        .root
        .as_ref()
        .ok_or_else(|| Error::MarkupParseFailure("no root element found".to_string()))?;
    check_supported(element)?;

    let mut declaration = Node::new(
        StringRef::name(DECLARATION_TAG),
        Trailer::Spacing {
            end: StringRef::text(options.line_ending.as_str()),
        },
    );

    if let Some(decl) = &document.declaration {
        let fields = [
            ("version", &decl.version),
            ("encoding", &decl.encoding),
            ("standalone", &decl.standalone),
        ];
        for (name, value) in fields {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                declaration.attributes.push(Attribute::new(name, value));
            }
        }
    }

    let mut tree = BmlTree::new(declaration);
    let root = tree.root();
    import_elements(&mut tree, root, element, options);

    Ok(tree)
}

fn check_supported(root: &XmlElement) -> Result<()> {
    let mut pending = vec![(root, 1usize)];

    while let Some((element, depth)) = pending.pop() {
        if depth > MAX_DEPTH {
            return Err(Error::MalformedTree(format!(
                "element <{}> is nested {} levels deep (maximum is {})",
                element.name, depth, MAX_DEPTH
            )));
        }
        if element.attributes.len() > FlagWord::MAX_ATTRIBUTES {
            return Err(Error::TooManyAttributes {
                element: element.name.clone(),
                count: element.attributes.len(),
            });
        }

        let mut elements = 0;
        for child in &element.children {
            match child {
                XmlContent::Element(child) => {
                    elements += 1;
                    pending.push((child, depth + 1));
                }
                XmlContent::Text(_) => {}
                other => {
                    return Err(Error::UnsupportedNodeType {
                        element: element.name.clone(),
                        kind: other.kind(),
                    })
                }
            }
        }

        if elements > FlagWord::MAX_CHILDREN {
            return Err(Error::TooManyChildren {
                element: element.name.clone(),
                count: elements,
            });
        }
    }

    Ok(())
}

/// Add `root` and its descendants under `parent`, depth first.
fn import_elements(tree: &mut BmlTree, parent: NodeId, root: &XmlElement, options: &ImportOptions) {
    let mut pending = vec![(parent, root)];

    while let Some((parent, element)) = pending.pop() {
        let id = tree.add_child(parent, import_node(element, options));
        let first = pending.len();
        pending.extend(element.elements().map(|child| (id, child)));
        pending[first..].reverse();
    }
}

fn import_node(element: &XmlElement, options: &ImportOptions) -> Node {
    let mut node = Node::element(element.name.as_str());
    for (name, value) in &element.attributes {
        node.attributes.push(Attribute::new(name.as_str(), value.as_str()));
    }

    let mut inner = None;
    for child in &element.children {
        if let XmlContent::Text(text) = child {
            if inner.is_some() {
                warn!("element <{}> has several text runs; keeping the last", element.name);
            }
            inner = Some(text.as_str());
        }
    }

    let line_ending = options.line_ending.as_str();
    node.trailer = match inner {
        Some(text) => Trailer::InnerText {
            inner: StringRef::text(text),
            end: StringRef::text(line_ending),
        },
        None if element.elements().next().is_some() => Trailer::Spacing {
            end: StringRef::text(line_ending),
        },
        None => Trailer::Spacing {
            end: StringRef::text(""),
        },
    };

    node
}

/// Render a BML tree as XML text.
pub fn to_xml(tree: &BmlTree) -> Result<String> {
    let mut output = Vec::new();
    write_xml(tree, &mut output)?;
    String::from_utf8(output).map_err(|e| Error::Xml(e.to_string()))
}

/// Write a BML tree as XML to a writer.
pub fn write_xml<W: Write>(tree: &BmlTree, writer: W) -> Result<()> {
    let mut xml_writer = Writer::new(writer);
    write_node(&mut xml_writer, tree, tree.root())
}

fn emit<W: Write>(writer: &mut Writer<W>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| Error::Xml(e.to_string()))
}

/// Write a stored formatting literal as-is.
fn emit_literal<W: Write>(writer: &mut Writer<W>, literal: Option<&StringRef>) -> Result<()> {
    match literal.map(StringRef::value) {
        Some(text) if !text.is_empty() => emit(writer, Event::Text(BytesText::from_escaped(text))),
        _ => Ok(()),
    }
}

fn start_tag<'n>(node: &'n Node, name: &'n str) -> BytesStart<'n> {
    let mut start = BytesStart::new(name);
    for attribute in &node.attributes {
        start.push_attribute((attribute.name(), attribute.value()));
    }
    start
}

/// Self-closing tag, written `<name a="1" />` when it has attributes.
fn empty_tag<'n>(node: &'n Node, name: &'n str) -> BytesStart<'n> {
    let start = start_tag(node, name);
    if node.attributes.is_empty() {
        return start;
    }
    let mut content = String::from_utf8_lossy(&start).into_owned();
    content.push(' ');
    BytesStart::from_content(content, name.len())
}

/// Pending work while rendering.
enum Step {
    Open(NodeId, usize),
    Close(NodeId),
}

fn write_node<W: Write>(writer: &mut Writer<W>, tree: &BmlTree, root: NodeId) -> Result<()> {
    let mut steps = vec![Step::Open(root, 0)];

    while let Some(step) = steps.pop() {
        let (id, depth) = match step {
            Step::Open(id, depth) => (id, depth),
            Step::Close(id) => {
                let node = tree.node(id);
                emit(writer, Event::End(BytesEnd::new(node.name())))?;
                emit_literal(writer, node.trailer.line_ending())?;
                continue;
            }
        };

        let node = tree.node(id);
        let name = node.name();
        let inner = node
            .trailer
            .inner_text()
            .map(StringRef::value)
            .filter(|text| !text.is_empty());

        if depth == 0 {
            // A declaration without fields is not rendered at all.
            if !node.attributes.is_empty() {
                let start = start_tag(node, name.trim_start_matches('?'));
                emit(writer, Event::Decl(BytesDecl::from_start(start)))?;
                emit_literal(writer, node.trailer.spacing())?;
            }
        } else if !node.children().is_empty() {
            emit(writer, Event::Start(start_tag(node, name)))?;
            emit_literal(writer, node.trailer.spacing())?;
            if let Some(text) = inner {
                emit(writer, Event::Text(BytesText::new(text)))?;
            }
            steps.push(Step::Close(id));
        } else if let Some(text) = inner {
            emit(writer, Event::Start(start_tag(node, name)))?;
            emit(writer, Event::Text(BytesText::new(text)))?;
            emit(writer, Event::End(BytesEnd::new(name)))?;
            emit_literal(writer, node.trailer.line_ending())?;
        } else {
            emit(writer, Event::Empty(empty_tag(node, name)))?;
            emit_literal(writer, node.trailer.spacing())?;
            emit_literal(writer, node.trailer.line_ending())?;
        }

        steps.extend(node.children().iter().rev().map(|&child| Step::Open(child, depth + 1)));
    }

    Ok(())
}

impl BmlTree {
    /// Parse XML text with default options.
    pub fn from_xml_str(xml: &str) -> Result<Self> {
        from_xml_str(xml, &ImportOptions::default())
    }

    /// Convert to an XML string.
    pub fn to_xml_string(&self) -> Result<String> {
        to_xml(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::Shape;
    use crate::markup::XmlDeclaration;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?><root a="1"><child/></root>"#;

    #[test]
    fn test_declaration_scenario() {
        let tree = BmlTree::from_xml_str(SAMPLE).unwrap();
        let decoded = BmlTree::parse(&tree.to_bytes().unwrap()).unwrap();

        let declaration = decoded.node(decoded.root());
        assert!(declaration.is_declaration());
        assert_eq!(declaration.attributes.len(), 2);
        assert_eq!(declaration.attributes[0].name(), "version");
        assert_eq!(declaration.attributes[1].value(), "utf-8");

        let children: Vec<_> = decoded.children(decoded.root()).collect();
        assert_eq!(children.len(), 1);
        let (root_id, root) = children[0];
        assert_eq!(root.name(), "root");
        assert_eq!(root.attributes, vec![Attribute::new("a", "1")]);

        let grandchildren: Vec<_> = decoded.children(root_id).collect();
        assert_eq!(grandchildren.len(), 1);
        let (child_id, child) = grandchildren[0];
        assert_eq!(child.name(), "child");
        assert!(child.attributes.is_empty());

        let flags = decoded.flags(child_id).unwrap();
        assert_eq!(flags.shape().unwrap(), Shape::Spacing);
        assert_eq!(flags.child_count, 0);
    }

    #[test]
    fn test_render_preserves_literals() {
        let tree = BmlTree::from_xml_str(SAMPLE).unwrap();
        assert_eq!(
            tree.to_xml_string().unwrap(),
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\r\n<root a=\"1\">\r\n<child/></root>"
        );
    }

    #[test]
    fn test_xml_round_trip_through_bml() {
        let xml = r#"<?xml version="1.0" encoding="utf-8" standalone="yes"?>
<Level name="test &amp; more">
    <Entities count="2">
        <Entity id="1" class="Door"/>
        <Entity id="2" class="Light">
            <Colour>1 &lt; 2</Colour>
        </Entity>
    </Entities>
    <Script>print</Script>
    <Empty/>
</Level>"#;

        let tree = bridge_tree(xml);
        let decoded = BmlTree::parse(&tree.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, tree);

        // Rendered XML parses back to the same tree.
        let rendered = decoded.to_xml_string().unwrap();
        assert_eq!(BmlTree::from_xml_str(&rendered).unwrap(), tree);
        assert!(rendered.contains("name=\"test &amp; more\""));
        assert!(rendered.contains("<Colour>1 &lt; 2</Colour>\r\n"));
    }

    fn bridge_tree(xml: &str) -> BmlTree {
        from_xml_str(xml, &ImportOptions::default()).unwrap()
    }

    #[test]
    fn test_inner_text_and_spacing() {
        let tree = bridge_tree("<a><b>hi</b><c><d/></c></a>");
        let (a_id, _) = tree.children(tree.root()).next().unwrap();
        let kids: Vec<_> = tree.children(a_id).map(|(_, n)| n.clone()).collect();

        assert_eq!(kids[0].trailer, Node::element("b").inner_text("hi", "\r\n").trailer);
        assert_eq!(kids[1].trailer.spacing().unwrap().value(), "\r\n");
        assert_eq!(tree.node(a_id).trailer.spacing().unwrap().value(), "\r\n");
    }

    #[test]
    fn test_mixed_content_keeps_inner_text() {
        let tree = bridge_tree("<p>intro<b/></p>");
        let (p_id, p) = tree.children(tree.root()).next().unwrap();
        assert_eq!(p.trailer.inner_text().unwrap().value(), "intro");
        assert_eq!(tree.flags(p_id).unwrap().shape().unwrap(), Shape::InnerText);

        let decoded = BmlTree::parse(&tree.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, tree);
        assert_eq!(decoded.to_xml_string().unwrap(), "<p>intro<b/></p>\r\n");
    }

    #[test]
    fn test_no_declaration_hides_root() {
        let tree = bridge_tree("<a/>");
        assert!(tree.node(tree.root()).attributes.is_empty());
        assert_eq!(tree.to_xml_string().unwrap(), "<a/>");
    }

    #[test]
    fn test_declaration_fields_in_fixed_order() {
        let document = XmlDocument {
            declaration: Some(XmlDeclaration {
                version: Some("1.0".to_string()),
                encoding: Some(String::new()),
                standalone: Some("no".to_string()),
            }),
            root: Some(XmlElement::new("x")),
        };
        let tree = from_xml(&document, &ImportOptions::default()).unwrap();
        let names: Vec<_> = tree
            .node(tree.root())
            .attributes
            .iter()
            .map(|a| a.name().to_string())
            .collect();
        assert_eq!(names, vec!["version", "standalone"]);
    }

    #[test]
    fn test_line_ending_option() {
        let tree = from_xml_str(
            "<a><b>x</b></a>",
            &ImportOptions::with_line_ending("\n"),
        )
        .unwrap();
        assert_eq!(tree.to_xml_string().unwrap(), "<a>\n<b>x</b>\n</a>");
    }

    #[test]
    fn test_too_many_attributes() {
        let mut wide = XmlElement::new("wide");
        for i in 0..256 {
            wide = wide.attr(format!("a{}", i), "v");
        }
        let document = XmlDocument {
            declaration: None,
            root: Some(XmlElement::new("root").child(XmlElement::new("ok")).child(wide)),
        };

        let result = from_xml(&document, &ImportOptions::default());
        assert!(matches!(
            result,
            Err(Error::TooManyAttributes { ref element, count: 256 }) if element == "wide"
        ));
    }

    #[test]
    fn test_255_attributes_fit() {
        let mut wide = XmlElement::new("wide");
        for i in 0..255 {
            wide = wide.attr(format!("a{}", i), i.to_string());
        }
        let document = XmlDocument {
            declaration: None,
            root: Some(wide),
        };
        let tree = from_xml(&document, &ImportOptions::default()).unwrap();
        let decoded = BmlTree::parse(&tree.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, tree);
    }

    #[test]
    fn test_unsupported_node_types() {
        for xml in ["<a><!-- c --></a>", "<a><![CDATA[x]]></a>", "<a><?pi x?></a>"] {
            let result = from_xml_str(xml, &ImportOptions::default());
            assert!(
                matches!(result, Err(Error::UnsupportedNodeType { .. })),
                "{} should be rejected",
                xml
            );
        }
    }

    #[test]
    fn test_markup_failures() {
        assert!(matches!(
            BmlTree::from_xml_str("<a><b></a>"),
            Err(Error::MarkupParseFailure(_))
        ));
        assert!(matches!(
            BmlTree::from_xml_str(""),
            Err(Error::MarkupParseFailure(_))
        ));
    }

    #[test]
    fn test_empty_element_with_attributes() {
        let tree = bridge_tree(r#"<r><c a="1"/><d/></r>"#);
        assert_eq!(
            tree.to_xml_string().unwrap(),
            "<r>\r\n<c a=\"1\" /><d/></r>"
        );
        assert_eq!(BmlTree::from_xml_str(&tree.to_xml_string().unwrap()).unwrap(), tree);
    }

    #[test]
    fn test_deep_document_at_limit() {
        let xml = format!("{}{}", "<a>".repeat(MAX_DEPTH), "</a>".repeat(MAX_DEPTH));
        let tree = bridge_tree(&xml);
        assert_eq!(tree.depth(), MAX_DEPTH);

        let decoded = BmlTree::parse(&tree.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, tree);

        let rendered = decoded.to_xml_string().unwrap();
        assert!(rendered.starts_with("<a>\r\n<a>"));
        assert_eq!(BmlTree::from_xml_str(&rendered).unwrap(), tree);
    }

    #[test]
    fn test_too_deep_documents_fail_cleanly() {
        let xml = format!("{}{}", "<a>".repeat(100_000), "</a>".repeat(100_000));
        assert!(matches!(
            from_xml_str(&xml, &ImportOptions::default()),
            Err(Error::MarkupParseFailure(_))
        ));

        let mut element = XmlElement::new("leaf");
        for _ in 0..MAX_DEPTH {
            element = XmlElement::new("n").child(element);
        }
        let document = XmlDocument {
            declaration: None,
            root: Some(element),
        };
        assert!(matches!(
            from_xml(&document, &ImportOptions::default()),
            Err(Error::MalformedTree(_))
        ));
    }
}
