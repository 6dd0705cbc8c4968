//! Document model: the live node tree that edit requests mutate.
//!
//! DESIGN
//! ======
//! `Document` is an arena of element and text nodes keyed by `NodeId`. Nodes
//! never leave the arena: removing a node only detaches it from its parent,
//! which keeps it addressable so an inverse `Attach` can put it back. A node
//! belongs to the live tree only while its parent chain reaches the root.
//!
//! All changes to the tree go through `Document::apply`, which accepts one of
//! a closed set of `Mutation`s and returns the mutation that undoes it. Each
//! mutation is validated completely before anything is touched, so a failed
//! apply leaves the document unchanged.
//!
//! Attribute and style entries are kept as ordered lists; inverses carry the
//! original position so undo reproduces markup byte-for-byte.

#[cfg(test)]
#[path = "doc_test.rs"]
mod tests;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a node in a [`Document`].
pub type NodeId = Uuid;

/// Elements serialized without a closing tag when they have no children.
const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track", "wbr",
];

/// Attribute name owned by the presentation layer (`Mutation::SetStyle`).
pub const STYLE_ATTRIBUTE: &str = "style";

/// Characters that end a name in serialized markup.
const NAME_DELIMITERS: &[char] = &['"', '\'', '<', '>', '/', '='];

/// Additional characters that end a property inside a `style` declaration.
const PROPERTY_DELIMITERS: &[char] = &[':', ';'];

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocError {
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("node {0} is not an element")]
    NotAnElement(NodeId),
    #[error("node {0} is not a text node")]
    NotText(NodeId),
    #[error("node {0} already has a parent")]
    AlreadyAttached(NodeId),
    #[error("node {0} has no parent")]
    NotAttached(NodeId),
    #[error("node {child} is not a child of {parent}")]
    NotAChild { child: NodeId, parent: NodeId },
    #[error("the document root cannot be moved or removed")]
    RootImmovable,
    #[error("attaching {node} under {parent} would create a cycle")]
    Cycle { node: NodeId, parent: NodeId },
    #[error("child index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("attribute `{0}` is reserved; use the style operations instead")]
    ReservedAttribute(String),
    #[error("`{0}` is not a valid tag, attribute, or property name")]
    InvalidName(String),
}

impl crate::error::ErrorCode for DocError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NodeNotFound(_) => "E_NODE_NOT_FOUND",
            Self::NotAnElement(_) => "E_NOT_AN_ELEMENT",
            Self::NotText(_) => "E_NOT_TEXT",
            Self::AlreadyAttached(_) => "E_ALREADY_ATTACHED",
            Self::NotAttached(_) => "E_NOT_ATTACHED",
            Self::NotAChild { .. } => "E_NOT_A_CHILD",
            Self::RootImmovable => "E_ROOT_IMMOVABLE",
            Self::Cycle { .. } => "E_CYCLE",
            Self::IndexOutOfBounds { .. } => "E_INDEX_OUT_OF_BOUNDS",
            Self::ReservedAttribute(_) => "E_RESERVED_ATTRIBUTE",
            Self::InvalidName(_) => "E_INVALID_NAME",
        }
    }
}

// =============================================================================
// NODES
// =============================================================================

/// An element's tag, attributes, and presentation properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub tag: String,
    pub attributes: Vec<(String, String)>,
    pub style: Vec<(String, String)>,
}

impl Element {
    #[must_use]
    pub fn new(tag: &str) -> Self {
        Self { tag: tag.to_ascii_lowercase(), attributes: Vec::new(), style: Vec::new() }
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        lookup(&self.attributes, name)
    }

    #[must_use]
    pub fn style_value(&self, property: &str) -> Option<&str> {
        lookup(&self.style, property)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeData {
    Element(Element),
    Text(String),
}

/// A node in the arena.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub data: NodeData,
}

impl Node {
    #[must_use]
    pub fn element(&self) -> Option<&Element> {
        match &self.data {
            NodeData::Element(el) => Some(el),
            NodeData::Text(_) => None,
        }
    }

    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.element().map(|el| el.tag.as_str())
    }
}

// =============================================================================
// MUTATIONS
// =============================================================================

/// The closed set of changes a [`Document`] accepts.
///
/// `value: None` on the keyed variants removes the entry. `index` places a
/// newly inserted entry; it is ignored when the key already exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    SetAttribute { node: NodeId, name: String, value: Option<String>, index: Option<usize> },
    SetStyle { node: NodeId, property: String, value: Option<String>, index: Option<usize> },
    SetText { node: NodeId, text: String },
    Attach { node: NodeId, parent: NodeId, index: usize },
    Detach { node: NodeId },
}

impl Mutation {
    /// The node whose state this mutation changes.
    #[must_use]
    pub fn target(&self) -> NodeId {
        match self {
            Self::SetAttribute { node, .. }
            | Self::SetStyle { node, .. }
            | Self::SetText { node, .. }
            | Self::Attach { node, .. }
            | Self::Detach { node } => *node,
        }
    }
}

// =============================================================================
// SERIALIZED INPUT
// =============================================================================

/// Serialized node tree used to load a [`Document`].
///
/// Elements list attributes by name; a `style` attribute is split into
/// presentation properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeSpec {
    Element {
        tag: String,
        #[serde(default)]
        attributes: BTreeMap<String, String>,
        #[serde(default)]
        children: Vec<NodeSpec>,
    },
    Text {
        text: String,
    },
}

// =============================================================================
// DOCUMENT
// =============================================================================

#[derive(Debug, Clone)]
pub struct Document {
    root: NodeId,
    nodes: HashMap<NodeId, Node>,
}

impl Document {
    /// Create a document holding a single empty root element.
    #[must_use]
    pub fn new(root_tag: &str) -> Self {
        let root = Uuid::new_v4();
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node { id: root, parent: None, children: Vec::new(), data: NodeData::Element(Element::new(root_tag)) },
        );
        Self { root, nodes }
    }

    /// Build a document from a serialized tree. The root must be an element
    /// and every tag and attribute name must be valid.
    pub fn from_spec(spec: &NodeSpec) -> Result<Self, DocError> {
        let NodeSpec::Element { tag, attributes, children } = spec else {
            return Err(DocError::NotAnElement(Uuid::nil()));
        };
        check_name(tag, &[])?;
        let mut doc = Self::new(tag);
        let root = doc.root;
        if let Some(NodeData::Element(el)) = doc.nodes.get_mut(&root).map(|n| &mut n.data) {
            fill_element(el, attributes)?;
        }
        for child in children {
            doc.build_subtree(child, root)?;
        }
        Ok(doc)
    }

    fn build_subtree(&mut self, spec: &NodeSpec, parent: NodeId) -> Result<(), DocError> {
        let id = match spec {
            NodeSpec::Text { text } => self.create_text(text),
            NodeSpec::Element { tag, attributes, children } => {
                let id = self.create_element(tag)?;
                if let Some(NodeData::Element(el)) = self.nodes.get_mut(&id).map(|n| &mut n.data) {
                    fill_element(el, attributes)?;
                }
                for child in children {
                    self.build_subtree(child, id)?;
                }
                id
            }
        };
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = Some(parent);
        }
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.push(id);
        }
        Ok(())
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Nodes in the arena, connected or not.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, DocError> {
        self.nodes.get(&id).ok_or(DocError::NodeNotFound(id))
    }

    pub fn element(&self, id: NodeId) -> Result<&Element, DocError> {
        self.node(id)?.element().ok_or(DocError::NotAnElement(id))
    }

    /// Returns `true` if `id` exists and its parent chain reaches the root.
    #[must_use]
    pub fn is_connected(&self, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(cur) = current {
            if cur == self.root {
                return true;
            }
            current = self.nodes.get(&cur).and_then(|n| n.parent);
        }
        false
    }

    pub fn parent(&self, id: NodeId) -> Result<Option<NodeId>, DocError> {
        Ok(self.node(id)?.parent)
    }

    pub fn children(&self, id: NodeId) -> Result<&[NodeId], DocError> {
        Ok(&self.node(id)?.children)
    }

    pub fn attribute(&self, id: NodeId, name: &str) -> Result<Option<&str>, DocError> {
        Ok(self.element(id)?.attribute(name))
    }

    pub fn style_value(&self, id: NodeId, property: &str) -> Result<Option<&str>, DocError> {
        Ok(self.element(id)?.style_value(property))
    }

    /// Concatenated text of `id` and all of its descendants.
    pub fn text_content(&self, id: NodeId) -> Result<String, DocError> {
        let mut out = String::new();
        self.collect_text(id, &mut out)?;
        Ok(out)
    }

    fn collect_text(&self, id: NodeId, out: &mut String) -> Result<(), DocError> {
        let node = self.node(id)?;
        if let NodeData::Text(text) = &node.data {
            out.push_str(text);
        }
        for child in &node.children {
            self.collect_text(*child, out)?;
        }
        Ok(())
    }

    /// Descendants of `id` in document order, excluding `id` itself.
    pub fn descendants(&self, id: NodeId) -> Result<Vec<NodeId>, DocError> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.node(id)?.children.iter().rev().copied().collect();
        while let Some(cur) = stack.pop() {
            out.push(cur);
            if let Some(node) = self.nodes.get(&cur) {
                stack.extend(node.children.iter().rev());
            }
        }
        Ok(out)
    }

    /// First connected element (document order) whose attribute `name` equals `value`.
    #[must_use]
    pub fn find_by_attribute(&self, name: &str, value: &str) -> Option<NodeId> {
        std::iter::once(self.root)
            .chain(self.descendants(self.root).unwrap_or_default())
            .find(|id| {
                self.nodes
                    .get(id)
                    .and_then(Node::element)
                    .and_then(|el| el.attribute(name))
                    == Some(value)
            })
    }

    /// Create a detached element. It joins the live tree once attached.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::InvalidName`] if `tag` could not be serialized as
    /// a tag name.
    pub fn create_element(&mut self, tag: &str) -> Result<NodeId, DocError> {
        check_name(tag, &[])?;
        Ok(self.insert_detached(NodeData::Element(Element::new(tag))))
    }

    /// Create a detached text node.
    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.insert_detached(NodeData::Text(text.to_owned()))
    }

    fn insert_detached(&mut self, data: NodeData) -> NodeId {
        let id = Uuid::new_v4();
        self.nodes.insert(id, Node { id, parent: None, children: Vec::new(), data });
        id
    }

    /// Drop `id` from the arena if it is detached and has no children.
    /// Returns whether the node was removed.
    pub fn discard(&mut self, id: NodeId) -> bool {
        let removable = id != self.root
            && self
                .nodes
                .get(&id)
                .is_some_and(|n| n.parent.is_none() && n.children.is_empty());
        if removable {
            self.nodes.remove(&id);
        }
        removable
    }

    // -------------------------------------------------------------------------
    // apply
    // -------------------------------------------------------------------------

    /// Apply `mutation` and return the mutation that reverses it.
    ///
    /// # Errors
    ///
    /// Returns a [`DocError`] without changing the document if the mutation
    /// does not fit the current tree.
    pub fn apply(&mut self, mutation: Mutation) -> Result<Mutation, DocError> {
        match mutation {
            Mutation::SetAttribute { node, name, value, index } => {
                if name.eq_ignore_ascii_case(STYLE_ATTRIBUTE) {
                    return Err(DocError::ReservedAttribute(name));
                }
                check_name(&name, &[])?;
                let el = self.element_mut(node)?;
                let (old, position) = set_entry(&mut el.attributes, &name, value, index);
                Ok(Mutation::SetAttribute { node, name, value: old, index: position })
            }
            Mutation::SetStyle { node, property, value, index } => {
                check_name(&property, PROPERTY_DELIMITERS)?;
                let el = self.element_mut(node)?;
                let (old, position) = set_entry(&mut el.style, &property, value, index);
                Ok(Mutation::SetStyle { node, property, value: old, index: position })
            }
            Mutation::SetText { node, text } => {
                let entry = self.nodes.get_mut(&node).ok_or(DocError::NodeNotFound(node))?;
                let NodeData::Text(current) = &mut entry.data else {
                    return Err(DocError::NotText(node));
                };
                let old = std::mem::replace(current, text);
                Ok(Mutation::SetText { node, text: old })
            }
            Mutation::Attach { node, parent, index } => {
                self.check_attach(node, parent, index)?;
                if let Some(entry) = self.nodes.get_mut(&node) {
                    entry.parent = Some(parent);
                }
                if let Some(entry) = self.nodes.get_mut(&parent) {
                    entry.children.insert(index, node);
                }
                Ok(Mutation::Detach { node })
            }
            Mutation::Detach { node } => {
                if node == self.root {
                    return Err(DocError::RootImmovable);
                }
                let parent = self.node(node)?.parent.ok_or(DocError::NotAttached(node))?;
                let siblings = &mut self
                    .nodes
                    .get_mut(&parent)
                    .ok_or(DocError::NodeNotFound(parent))?
                    .children;
                let index = siblings
                    .iter()
                    .position(|c| *c == node)
                    .ok_or(DocError::NotAttached(node))?;
                siblings.remove(index);
                if let Some(entry) = self.nodes.get_mut(&node) {
                    entry.parent = None;
                }
                Ok(Mutation::Attach { node, parent, index })
            }
        }
    }

    fn element_mut(&mut self, id: NodeId) -> Result<&mut Element, DocError> {
        match &mut self.nodes.get_mut(&id).ok_or(DocError::NodeNotFound(id))?.data {
            NodeData::Element(el) => Ok(el),
            NodeData::Text(_) => Err(DocError::NotAnElement(id)),
        }
    }

    fn check_attach(&self, node: NodeId, parent: NodeId, index: usize) -> Result<(), DocError> {
        if node == self.root {
            return Err(DocError::RootImmovable);
        }
        if self.node(node)?.parent.is_some() {
            return Err(DocError::AlreadyAttached(node));
        }
        let parent_node = self.node(parent)?;
        if parent_node.element().is_none() {
            return Err(DocError::NotAnElement(parent));
        }
        let mut ancestor = Some(parent);
        while let Some(cur) = ancestor {
            if cur == node {
                return Err(DocError::Cycle { node, parent });
            }
            ancestor = self.nodes.get(&cur).and_then(|n| n.parent);
        }
        let len = parent_node.children.len();
        if index > len {
            return Err(DocError::IndexOutOfBounds { index, len });
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // markup
    // -------------------------------------------------------------------------

    /// Serialize `id` and its subtree.
    pub fn outer_markup(&self, id: NodeId) -> Result<String, DocError> {
        let mut out = String::new();
        self.write_node(id, &mut out)?;
        Ok(out)
    }

    /// Serialize the children of `id`.
    pub fn inner_markup(&self, id: NodeId) -> Result<String, DocError> {
        let mut out = String::new();
        for child in self.children(id)? {
            self.write_node(*child, &mut out)?;
        }
        Ok(out)
    }

    /// Serialize only the opening tag of element `id`.
    pub fn open_tag(&self, id: NodeId) -> Result<String, DocError> {
        let mut out = String::new();
        write_open_tag(self.element(id)?, &mut out);
        Ok(out)
    }

    fn write_node(&self, id: NodeId, out: &mut String) -> Result<(), DocError> {
        let node = self.node(id)?;
        match &node.data {
            NodeData::Text(text) => out.push_str(&escape_text(text)),
            NodeData::Element(el) => {
                write_open_tag(el, out);
                if node.children.is_empty() && VOID_ELEMENTS.contains(&el.tag.as_str()) {
                    return Ok(());
                }
                for child in &node.children {
                    self.write_node(*child, out)?;
                }
                out.push_str("</");
                out.push_str(&el.tag);
                out.push('>');
            }
        }
        Ok(())
    }
}

// =============================================================================
// SHARED HANDLE
// =============================================================================

/// Cloneable handle to a document shared between a session and script passes.
#[derive(Debug, Clone)]
pub struct SharedDocument(Arc<Mutex<Document>>);

impl SharedDocument {
    #[must_use]
    pub fn new(doc: Document) -> Self {
        Self(Arc::new(Mutex::new(doc)))
    }

    /// Lock the document. A poisoned lock is recovered: every mutation is
    /// validated before it is applied, so the tree is never half-written.
    pub fn lock(&self) -> MutexGuard<'_, Document> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn lookup<'a>(entries: &'a [(String, String)], key: &str) -> Option<&'a str> {
    entries
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Set or remove `key` in an ordered entry list. Returns the previous value
/// and the position it occupied.
fn set_entry(
    entries: &mut Vec<(String, String)>,
    key: &str,
    value: Option<String>,
    index: Option<usize>,
) -> (Option<String>, Option<usize>) {
    let existing = entries.iter().position(|(k, _)| k == key);
    match (existing, value) {
        (Some(pos), Some(value)) => {
            let old = std::mem::replace(&mut entries[pos].1, value);
            (Some(old), Some(pos))
        }
        (Some(pos), None) => {
            let (_, old) = entries.remove(pos);
            (Some(old), Some(pos))
        }
        (None, Some(value)) => {
            let at = index.unwrap_or(entries.len()).min(entries.len());
            entries.insert(at, (key.to_owned(), value));
            (None, None)
        }
        (None, None) => (None, None),
    }
}

fn fill_element(el: &mut Element, attributes: &BTreeMap<String, String>) -> Result<(), DocError> {
    for (name, value) in attributes {
        if name.eq_ignore_ascii_case(STYLE_ATTRIBUTE) {
            el.style = parse_style(value);
        } else {
            check_name(name, &[])?;
            el.attributes.push((name.clone(), value.clone()));
        }
    }
    Ok(())
}

/// Reject names that would not survive serialization as a single token.
fn check_name(name: &str, extra: &[char]) -> Result<(), DocError> {
    let invalid = name.is_empty()
        || name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || NAME_DELIMITERS.contains(&c) || extra.contains(&c));
    if invalid {
        return Err(DocError::InvalidName(name.to_owned()));
    }
    Ok(())
}

/// Split an inline `style` declaration list into `(property, value)` pairs.
#[must_use]
pub fn parse_style(raw: &str) -> Vec<(String, String)> {
    raw.split(';')
        .filter_map(|decl| {
            let (prop, value) = decl.split_once(':')?;
            let prop = prop.trim();
            let value = value.trim();
            (!prop.is_empty() && !value.is_empty()).then(|| (prop.to_ascii_lowercase(), value.to_owned()))
        })
        .collect()
}

fn write_open_tag(el: &Element, out: &mut String) {
    out.push('<');
    out.push_str(&el.tag);
    for (name, value) in &el.attributes {
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        out.push_str(&escape_attribute(value));
        out.push('"');
    }
    if !el.style.is_empty() {
        let style = el
            .style
            .iter()
            .map(|(prop, value)| format!("{prop}: {value}"))
            .collect::<Vec<_>>()
            .join("; ");
        out.push_str(" style=\"");
        out.push_str(&escape_attribute(&style));
        out.push('"');
    }
    out.push('>');
}

fn escape_text(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attribute(raw: &str) -> String {
    escape_text(raw).replace('"', "&quot;")
}
