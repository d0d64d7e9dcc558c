//! Generic XML element tree, parsed with quick-xml.
//!
//! This is the markup side of the bridge: a plain DOM-like structure with
//! the declaration split out. Parsing follows the usual non-validating
//! document-loader behavior:
//!
//! - whitespace-only text runs between elements are dropped;
//! - comments, processing instructions and the doctype are skipped at
//!   document level but kept inside elements, where the bridge rejects them.

use quick_xml::events::{BytesDecl, BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;

use crate::{Error, Result, MAX_DEPTH};

/// The `<?xml ...?>` declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlDeclaration {
    pub version: Option<String>,
    pub encoding: Option<String>,
    pub standalone: Option<String>,
}

/// A child of an element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlContent {
    Element(XmlElement),
    Text(String),
    Comment(String),
    CData(String),
    ProcessingInstruction(String),
}

impl XmlContent {
    /// Human-readable node kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            XmlContent::Element(_) => "element",
            XmlContent::Text(_) => "text",
            XmlContent::Comment(_) => "comment",
            XmlContent::CData(_) => "CDATA section",
            XmlContent::ProcessingInstruction(_) => "processing instruction",
        }
    }
}

/// An XML element.
///
/// Dropping releases nested elements from a flat work list, so deep trees
/// do not exhaust the stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    /// Attributes in document order, values unescaped.
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlContent>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Add an attribute to this element.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    /// Add a child element.
    pub fn child(mut self, child: XmlElement) -> Self {
        self.children.push(XmlContent::Element(child));
        self
    }

    /// Add a text run.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.children.push(XmlContent::Text(text.into()));
        self
    }

    /// Child elements, skipping text and other content.
    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|c| match c {
            XmlContent::Element(e) => Some(e),
            _ => None,
        })
    }
}

impl Drop for XmlElement {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(content) = pending.pop() {
            if let XmlContent::Element(mut element) = content {
                pending.append(&mut element.children);
            }
        }
    }
}

/// A parsed XML document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlDocument {
    pub declaration: Option<XmlDeclaration>,
    pub root: Option<XmlElement>,
}

impl XmlDocument {
    /// Parse XML text.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        let mut stack: Vec<XmlElement> = Vec::new();
        let mut document = XmlDocument::default();

        loop {
            let event = reader.read_event().map_err(|e| {
                Error::MarkupParseFailure(format!(
                    "at position {}: {}",
                    reader.buffer_position(),
                    e
                ))
            })?;

            match event {
                Event::Decl(decl) => {
                    if !stack.is_empty() || document.root.is_some() {
                        return Err(Error::MarkupParseFailure(
                            "XML declaration after the root element".to_string(),
                        ));
                    }
                    document.declaration = Some(read_declaration(&decl)?);
                }
                Event::Start(e) => {
                    check_depth(&stack, &e)?;
                    stack.push(read_element(&e)?);
                }
                Event::Empty(e) => {
                    check_depth(&stack, &e)?;
                    let element = read_element(&e)?;
                    attach(&mut stack, &mut document, element)?;
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(|| {
                        Error::MarkupParseFailure("unexpected closing tag".to_string())
                    })?;
                    attach(&mut stack, &mut document, element)?;
                }
                Event::Text(e) => {
                    let text = e.unescape().map_err(markup_error)?;
                    if text.trim().is_empty() {
                        continue;
                    }
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(XmlContent::Text(text.into_owned())),
                        None => {
                            return Err(Error::MarkupParseFailure(
                                "text outside the root element".to_string(),
                            ))
                        }
                    }
                }
                Event::CData(e) => {
                    let text = String::from_utf8_lossy(&e).into_owned();
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(XmlContent::CData(text)),
                        None => {
                            return Err(Error::MarkupParseFailure(
                                "CDATA outside the root element".to_string(),
                            ))
                        }
                    }
                }
                Event::Comment(e) => {
                    let text = String::from_utf8_lossy(&e).into_owned();
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(XmlContent::Comment(text)),
                        None => debug!("skipping document-level comment"),
                    }
                }
                Event::PI(e) => {
                    let text = String::from_utf8_lossy(&e).into_owned();
                    match stack.last_mut() {
                        Some(parent) => {
                            parent.children.push(XmlContent::ProcessingInstruction(text))
                        }
                        None => debug!("skipping document-level processing instruction"),
                    }
                }
                Event::DocType(_) => debug!("skipping doctype"),
                Event::Eof => break,
            }
        }

        if let Some(open) = stack.last() {
            return Err(Error::MarkupParseFailure(format!(
                "unclosed element <{}>",
                open.name
            )));
        }

        Ok(document)
    }

    /// Parse XML bytes.
    pub fn from_bytes(xml: &[u8]) -> Result<Self> {
        let xml = std::str::from_utf8(xml).map_err(Error::Utf8)?;
        Self::parse(xml)
    }
}

fn markup_error(e: impl std::fmt::Display) -> Error {
    Error::MarkupParseFailure(e.to_string())
}

/// Attach a finished element to its parent, or make it the document root.
fn attach(stack: &mut [XmlElement], document: &mut XmlDocument, element: XmlElement) -> Result<()> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(XmlContent::Element(element));
    } else if let Some(root) = &document.root {
        return Err(Error::MarkupParseFailure(format!(
            "second root element <{}> after <{}>",
            element.name, root.name
        )));
    } else {
        document.root = Some(element);
    }
    Ok(())
}

fn check_depth(stack: &[XmlElement], e: &BytesStart<'_>) -> Result<()> {
    if stack.len() >= MAX_DEPTH {
        return Err(Error::MarkupParseFailure(format!(
            "<{}> is nested deeper than {} levels",
            String::from_utf8_lossy(e.name().as_ref()),
            MAX_DEPTH
        )));
    }
    Ok(())
}

fn read_element(e: &BytesStart<'_>) -> Result<XmlElement> {
    let mut element = XmlElement::new(String::from_utf8_lossy(e.name().as_ref()));

    for attr in e.attributes() {
        let attr = attr.map_err(markup_error)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(markup_error)?.into_owned();
        element.attributes.push((key, value));
    }

    Ok(element)
}

fn read_declaration(decl: &BytesDecl<'_>) -> Result<XmlDeclaration> {
    let text = |bytes: &[u8]| String::from_utf8_lossy(bytes).into_owned();

    Ok(XmlDeclaration {
        version: Some(text(&decl.version().map_err(markup_error)?)),
        encoding: decl
            .encoding()
            .transpose()
            .map_err(markup_error)?
            .map(|v| text(&v)),
        standalone: decl
            .standalone()
            .transpose()
            .map_err(markup_error)?
            .map(|v| text(&v)),
    })
}
