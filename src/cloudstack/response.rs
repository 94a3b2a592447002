//! Owned element tree for CloudStack XML responses.
//!
//! CloudStack answers every API call with a loosely shaped XML document. The
//! transport parses the body once into a [`ResponseDocument`]; everything
//! else walks the tree by element name. Name matching ignores ASCII case and
//! whitespace-only text is dropped.

use std::str;

use quick_xml::Reader;
use quick_xml::events::Event;

use super::CloudStackError;

/// One XML element with its text content and child elements.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Element {
    name: String,
    text: String,
    children: Vec<Element>,
}

impl Element {
    /// Creates an element with no text or children.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: String::new(),
            children: Vec::new(),
        }
    }

    /// Creates a text-only element.
    #[must_use]
    pub fn leaf(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::new(name)
        }
    }

    /// Appends a child element.
    #[must_use]
    pub fn with_child(mut self, child: Self) -> Self {
        self.children.push(child);
        self
    }

    /// Element name as it appeared in the document.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true when the element is called `name`, ignoring ASCII case.
    #[must_use]
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Text content, or `None` when the element carried none.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        if self.text.is_empty() {
            None
        } else {
            Some(&self.text)
        }
    }

    /// Direct children in document order.
    #[must_use]
    pub fn children(&self) -> &[Self] {
        &self.children
    }

    /// First direct child called `name`.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&Self> {
        self.children.iter().find(|child| child.is_named(name))
    }

    /// Every element in this subtree called `name`, in document order,
    /// including this element itself.
    #[must_use]
    pub fn descendants_named<'a>(&'a self, name: &str) -> Vec<&'a Self> {
        let mut found = Vec::new();
        self.collect_named(name, &mut found);
        found
    }

    fn collect_named<'a>(&'a self, name: &str, found: &mut Vec<&'a Self>) {
        if self.is_named(name) {
            found.push(self);
        }
        for child in &self.children {
            child.collect_named(name, found);
        }
    }
}

/// A parsed API response.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResponseDocument {
    root: Element,
}

impl ResponseDocument {
    /// Wraps an already built tree.
    #[must_use]
    pub const fn from_root(root: Element) -> Self {
        Self { root }
    }

    /// Parses an XML body.
    ///
    /// # Errors
    ///
    /// Returns [`CloudStackError::MalformedResponse`] when the body is not a
    /// single well-formed XML element.
    pub fn parse(xml: &str) -> Result<Self, CloudStackError> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = reader
                .read_event()
                .map_err(|err| malformed(format!("{err} at byte {}", reader.buffer_position())))?;
            match event {
                Event::Start(start) => {
                    stack.push(Element::new(utf8(start.local_name().as_ref())?));
                }
                Event::Empty(start) => {
                    let element = Element::new(utf8(start.local_name().as_ref())?);
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    let value = text.unescape().map_err(|err| malformed(err.to_string()))?;
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&value);
                    }
                }
                Event::CData(data) => {
                    let bytes = data.into_inner();
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(utf8(&bytes)?);
                    }
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| malformed(String::from("unbalanced closing tag")))?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(malformed(String::from("document ended inside an element")));
        }
        root.map(Self::from_root)
            .ok_or_else(|| malformed(String::from("document has no root element")))
    }

    /// Root element.
    #[must_use]
    pub const fn root(&self) -> &Element {
        &self.root
    }

    /// Every element in the document called `name`, in document order.
    #[must_use]
    pub fn elements_named(&self, name: &str) -> Vec<&Element> {
        self.root.descendants_named(name)
    }
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), CloudStackError> {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
        return Ok(());
    }
    if root.is_some() {
        return Err(malformed(String::from("document has more than one root")));
    }
    *root = Some(element);
    Ok(())
}

fn utf8(bytes: &[u8]) -> Result<&str, CloudStackError> {
    str::from_utf8(bytes).map_err(|err| malformed(err.to_string()))
}

const fn malformed(message: String) -> CloudStackError {
    CloudStackError::MalformedResponse(message)
}
