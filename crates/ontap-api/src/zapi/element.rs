// ONTAPI element tree
//
// A minimal DOM for ZAPI requests and responses: a name, attributes,
// optional text content, and ordered children. Serialization escapes
// text and attribute values; parsing is driven by quick-xml's pull reader.

use std::fmt::Write as _;

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};

use crate::error::Error;

/// One node of an ONTAPI document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NaElement {
    name: String,
    attrs: Vec<(String, String)>,
    content: Option<String>,
    children: Vec<NaElement>,
}

impl NaElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Leaf element with text content: `<name>content</name>`.
    pub fn with_content(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: Some(content.into()),
            ..Self::default()
        }
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn children(&self) -> &[NaElement] {
        &self.children
    }

    /// First direct child with the given name.
    pub fn child(&self, name: &str) -> Option<&NaElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Text content of a direct child.
    pub fn child_str(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(NaElement::content)
    }

    /// Integer content of a direct child.
    pub fn child_int(&self, name: &str) -> Option<i64> {
        self.child_str(name).and_then(|s| s.trim().parse().ok())
    }

    /// Boolean content of a direct child (`true`/`false`).
    pub fn child_bool(&self, name: &str) -> Option<bool> {
        self.child_str(name)
            .and_then(|s| match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            })
    }

    /// Descend a dotted path of child names (`"a.b.c"`).
    pub fn find(&self, path: &str) -> Option<&NaElement> {
        path.split('.')
            .filter(|seg| !seg.is_empty())
            .try_fold(self, |node, seg| node.child(seg))
    }

    /// Text content at a dotted path.
    pub fn find_str(&self, path: &str) -> Option<&str> {
        self.find(path).and_then(NaElement::content)
    }

    // ── Mutation ─────────────────────────────────────────────────────

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.attrs.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.attrs.push((key, value));
        }
    }

    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = Some(content.into());
    }

    pub fn add_child(&mut self, child: NaElement) -> &mut Self {
        self.children.push(child);
        self
    }

    pub fn add_new_child(
        &mut self,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> &mut Self {
        self.add_child(Self::with_content(name, content))
    }

    /// Set content at a dotted path, creating intermediate elements.
    pub fn set_path(&mut self, path: &str, content: impl Into<String>) {
        let mut node = self;
        for seg in path.split('.').filter(|seg| !seg.is_empty()) {
            let idx = match node.children.iter().position(|c| c.name == seg) {
                Some(idx) => idx,
                None => {
                    node.children.push(Self::new(seg));
                    node.children.len() - 1
                }
            };
            node = &mut node.children[idx];
        }
        node.content = Some(content.into());
    }

    /// Builder form of [`add_child`](Self::add_child).
    #[must_use]
    pub fn with_child(mut self, child: NaElement) -> Self {
        self.children.push(child);
        self
    }

    /// Builder form of [`add_new_child`](Self::add_new_child).
    #[must_use]
    pub fn with_child_content(
        mut self,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        self.add_new_child(name, content);
        self
    }

    /// Builder: a wrapper child holding one leaf per item
    /// (`<ports><net-qualified-port-name>e0a</..>..</ports>`).
    #[must_use]
    pub fn with_list<I, S>(mut self, name: impl Into<String>, item_name: &str, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Self::new(name);
        for item in items {
            list.add_new_child(item_name, item);
        }
        self.children.push(list);
        self
    }

    /// Text content of every child of the wrapper at `path`.
    pub fn list_at(&self, path: &str) -> Vec<String> {
        self.find(path)
            .map(|list| {
                list.children
                    .iter()
                    .filter_map(|c| c.content.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    // ── Serialization ────────────────────────────────────────────────

    /// Render this element (and its subtree) as XML.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        let _ = write!(out, "<{}", self.name);
        for (key, value) in &self.attrs {
            let _ = write!(out, " {key}=\"{}\"", escape(value.as_str()));
        }
        if self.content.is_none() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        if let Some(ref content) = self.content {
            out.push_str(&escape(content.as_str()));
        }
        for child in &self.children {
            child.write_xml(out);
        }
        let _ = write!(out, "</{}>", self.name);
    }

    // ── Parsing ──────────────────────────────────────────────────────

    /// Parse an XML document into its root element.
    pub fn parse(xml: &str) -> Result<Self, Error> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<NaElement> = Vec::new();
        let mut root: Option<NaElement> = None;

        loop {
            match reader.read_event().map_err(xml_error)? {
                Event::Start(start) => stack.push(Self::from_start(&start)?),
                Event::Empty(start) => {
                    let element = Self::from_start(&start)?;
                    attach(&mut stack, &mut root, element);
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(|| Error::Xml {
                        message: "unbalanced closing tag".into(),
                    })?;
                    attach(&mut stack, &mut root, element);
                }
                Event::Text(text) => {
                    let text = text.unescape().map_err(xml_error)?;
                    if let Some(top) = stack.last_mut() {
                        top.content.get_or_insert_with(String::new).push_str(&text);
                    }
                }
                Event::CData(data) => {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    if let Some(top) = stack.last_mut() {
                        top.content.get_or_insert_with(String::new).push_str(&text);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(Error::Xml {
                message: format!("unterminated element <{}>", open.name),
            });
        }
        root.ok_or_else(|| Error::Xml {
            message: "document has no root element".into(),
        })
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Self, Error> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut element = Self::new(name);
        for attr in start.attributes() {
            let attr = attr.map_err(|e| Error::Xml {
                message: e.to_string(),
            })?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr.unescape_value().map_err(xml_error)?.into_owned();
            element.attrs.push((key, value));
        }
        Ok(element)
    }
}

fn attach(stack: &mut [NaElement], root: &mut Option<NaElement>, element: NaElement) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => *root = Some(element),
    }
}

fn xml_error(err: quick_xml::Error) -> Error {
    Error::Xml {
        message: err.to_string(),
    }
}
