//! Live DOM snapshot model.
//!
//! A [`Document`] is an arena of nodes captured from an already-rendered page.
//! Elements carry both their authored attributes and the live in-memory state
//! (form edits, current media source, rendered CSS images) that a serializer
//! must prefer over the authored markup.

use std::sync::Arc;

/// ID used to address nodes in the DOM arena.
pub type NodeId = usize;

/// Element namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Html,
    Svg,
    MathMl,
}

/// Authored attribute, name lower-cased for HTML elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// In-memory element state that may differ from the authored attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveState {
    /// `element.checked` for checkbox/radio inputs.
    pub checked: Option<bool>,
    /// `element.value` for inputs and textareas.
    pub value: Option<String>,
    /// `option.selected`.
    pub selected: Option<bool>,
    /// `currentSrc` for img/audio/video, already absolute.
    pub current_src: Option<String>,
    /// `url()`s from the computed style of the element and its
    /// `::before`/`::after` pseudo-elements, already absolute.
    pub rendered_images: Vec<String>,
    /// Canvas rendering as a data URL.
    pub canvas_data_url: Option<String>,
}

/// Content document behind a `<frame>` or `<iframe>`.
#[derive(Debug, Clone)]
pub enum FrameContent {
    Document(Arc<Document>),
    Inaccessible { reason: String },
}

/// Element node payload.
#[derive(Debug, Clone)]
pub struct Element {
    pub name: String,
    pub namespace: Namespace,
    pub attributes: Vec<Attribute>,
    pub live: LiveState,
    pub frame: Option<FrameContent>,
}

impl Element {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            namespace: Namespace::Html,
            attributes: Vec::new(),
            live: LiveState::default(),
            frame: None,
        }
    }

    pub fn svg(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            namespace: Namespace::Svg,
            ..Self::new(name)
        }
    }

    pub fn with_attr(mut self, name: &str, value: &str) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn is_html(&self, name: &str) -> bool {
        self.namespace == Namespace::Html && self.is(name)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.name.eq_ignore_ascii_case(name))
            .map(|attr| attr.value.as_str())
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        match self
            .attributes
            .iter_mut()
            .find(|attr| attr.name.eq_ignore_ascii_case(name))
        {
            Some(existing) => existing.value = value.to_owned(),
            None => self.attributes.push(Attribute::new(name, value)),
        }
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let position = self
            .attributes
            .iter()
            .position(|attr| attr.name.eq_ignore_ascii_case(name))?;
        Some(self.attributes.remove(position).value)
    }

    /// Lower-cased `type` attribute, `text` when absent (the HTML default).
    pub fn input_type(&self) -> String {
        self.attr("type")
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "text".to_owned())
    }

    /// True when the whitespace-separated `rel` attribute contains `token`.
    pub fn rel_contains(&self, token: &str) -> bool {
        self.attr("rel").is_some_and(|rel| {
            rel.split_ascii_whitespace()
                .any(|part| part.eq_ignore_ascii_case(token))
        })
    }
}

/// Node payload.
#[derive(Debug, Clone)]
pub enum NodeData {
    Document,
    Doctype { name: String },
    Element(Element),
    Text(String),
    Comment(String),
}

/// Arena node.
#[derive(Debug, Clone)]
pub struct Node {
    pub data: NodeData,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

/// Snapshot of one live document.
#[derive(Debug, Clone)]
pub struct Document {
    /// `document.URL`, may carry a fragment.
    pub url: String,
    /// `document.baseURI`.
    pub base_url: String,
    /// `document.characterSet`.
    pub charset: String,
    pub title: String,
    nodes: Vec<Node>,
}

impl Document {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_owned(),
            base_url: url.to_owned(),
            charset: "UTF-8".to_owned(),
            title: String::new(),
            nodes: vec![Node {
                data: NodeData::Document,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(id)
            .map(|node| node.children.as_slice())
            .unwrap_or_default()
    }

    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match self.nodes.get(id).map(|node| &node.data) {
            Some(NodeData::Element(element)) => Some(element),
            _ => None,
        }
    }

    pub fn element_mut(&mut self, id: NodeId) -> Option<&mut Element> {
        match self.nodes.get_mut(id).map(|node| &mut node.data) {
            Some(NodeData::Element(element)) => Some(element),
            _ => None,
        }
    }

    pub fn append(&mut self, parent: NodeId, data: NodeData) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            data,
            parent: Some(parent),
            children: Vec::new(),
        });
        if let Some(parent_node) = self.nodes.get_mut(parent) {
            parent_node.children.push(id);
        }
        id
    }

    pub fn append_element(&mut self, parent: NodeId, element: Element) -> NodeId {
        self.append(parent, NodeData::Element(element))
    }

    pub fn append_text(&mut self, parent: NodeId, text: &str) -> NodeId {
        self.append(parent, NodeData::Text(text.to_owned()))
    }

    pub fn append_comment(&mut self, parent: NodeId, text: &str) -> NodeId {
        self.append(parent, NodeData::Comment(text.to_owned()))
    }

    pub fn replace_data(&mut self, id: NodeId, data: NodeData) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.data = data;
        }
    }

    /// Depth-first pre-order walk of the subtree below `id` (inclusive).
    pub fn descendants(&self, id: NodeId) -> Descendants<'_> {
        Descendants {
            document: self,
            stack: vec![id],
        }
    }

    /// Elements in document order.
    pub fn elements(&self) -> impl Iterator<Item = (NodeId, &Element)> + '_ {
        self.descendants(self.root())
            .filter_map(|id| self.element(id).map(|element| (id, element)))
    }

    pub fn find_html(&self, name: &str) -> Option<NodeId> {
        self.elements()
            .find(|(_, element)| element.is_html(name))
            .map(|(id, _)| id)
    }

    pub fn head(&self) -> Option<NodeId> {
        self.find_html("head")
    }

    pub fn body(&self) -> Option<NodeId> {
        self.find_html("body")
    }

    /// Concatenated text of all descendant text nodes.
    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        for node_id in self.descendants(id) {
            if let Some(Node {
                data: NodeData::Text(text),
                ..
            }) = self.nodes.get(node_id)
            {
                out.push_str(text);
            }
        }
        out
    }

    /// Nearest ancestor element of `id`.
    pub fn parent_element(&self, id: NodeId) -> Option<(NodeId, &Element)> {
        let parent = self.nodes.get(id)?.parent?;
        self.element(parent).map(|element| (parent, element))
    }
}

/// Iterator returned by [`Document::descendants`].
pub struct Descendants<'a> {
    document: &'a Document,
    stack: Vec<NodeId>,
}

impl Iterator for Descendants<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        let children = self.document.children(id);
        self.stack.extend(children.iter().rev().copied());
        Some(id)
    }
}
