#![forbid(unsafe_code)]

//! Headless document for CI testing and native embedding.
//!
//! `HeadlessDocument` is a deterministic in-memory DOM implementing
//! [`DocumentHost`]. It is designed for:
//!
//! - **Scenario tests** that need real scroll geometry without a browser
//! - **Property tests** that drive thousands of scroll/append sequences
//! - **Benchmarks** of update passes over large conversations
//!
//! # Layout model
//!
//! Block flow only. An element with an inline `height` is exactly that tall;
//! otherwise it is the sum of its children. Non-blank text lines are
//! [`LINE_HEIGHT_PX`] each. Elements with `overflow-y: auto|scroll` (and the
//! root) are scroll containers that clip to their height and offset their
//! content by `scroll_top`. `display: none` boxes are empty, and
//! `position: fixed|absolute` boxes take no space in their parent's flow.
//!
//! # Observation
//!
//! Insertions, removals, scroll offset changes and size changes are recorded
//! only for active subscriptions, the way a browser only reports mutations
//! after `observe()`. [`take_events`](HeadlessDocument::take_events) drains
//! them as one batch per observer.
//!
//! # Example
//!
//! ```
//! use chatvirt_core::dom::DocumentHost;
//! use chatvirt_core::headless::HeadlessDocument;
//!
//! let doc = HeadlessDocument::from_body_markup(
//!     600.0,
//!     r#"<main><div data-message-author-role="user">hi</div></main>"#,
//! )
//! .unwrap();
//! let turns = doc.query_all("[data-message-author-role]").unwrap();
//! assert_eq!(turns.len(), 1);
//! assert_eq!(doc.bounding_rect(&turns[0]).height, 20.0);
//! ```

use crate::dom::{
    DocumentHost, DomError, HostEvent, Observer, Overflow, Rect, Subscription, SubscriptionKind,
};
use crate::inbox::EventInbox;
use crate::selector::{ElementTree, SelectorList};

/// Height of one non-blank text line.
pub const LINE_HEIGHT_PX: f64 = 20.0;

const VOID_ELEMENTS: &[&str] = &["br", "hr", "img", "input", "link", "meta"];

/// Arena index of a headless node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
enum NodeKind {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
        scroll_top: f64,
    },
    Text(String),
}

#[derive(Debug, Clone)]
struct NodeData {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// A deterministic in-memory document.
#[derive(Debug, Clone)]
pub struct HeadlessDocument {
    nodes: Vec<NodeData>,
    root: NodeId,
    body: NodeId,
    viewport_height: f64,
    resize_observer: bool,
    subscriptions: Vec<Subscription<NodeId>>,
    inbox: EventInbox<NodeId>,
}

impl HeadlessDocument {
    /// Create an empty `<html><body></body></html>` document.
    ///
    /// # Panics
    ///
    /// Panics if `viewport_height` is not a positive finite number.
    #[must_use]
    pub fn new(viewport_height: f64) -> Self {
        assert!(
            viewport_height.is_finite() && viewport_height > 0.0,
            "viewport height must be > 0"
        );
        let mut doc = Self {
            nodes: Vec::new(),
            root: NodeId(0),
            body: NodeId(0),
            viewport_height,
            resize_observer: true,
            subscriptions: Vec::new(),
            inbox: EventInbox::new(),
        };
        let root = doc.alloc_element("html", Vec::new());
        let body = doc.alloc_element("body", Vec::new());
        doc.nodes[body.idx()].parent = Some(root);
        doc.nodes[root.idx()].children.push(body);
        doc.root = root;
        doc.body = body;
        doc
    }

    /// Create a document whose `<body>` holds `markup`.
    pub fn from_body_markup(viewport_height: f64, markup: &str) -> Result<Self, DomError> {
        let mut doc = Self::new(viewport_height);
        let body = doc.body;
        doc.set_inner_markup(&body, markup)?;
        Ok(doc)
    }

    /// Simulate a browser without `ResizeObserver`.
    #[must_use]
    pub fn without_resize_observer(mut self) -> Self {
        self.resize_observer = false;
        self
    }

    #[must_use]
    pub fn body_node(&self) -> NodeId {
        self.body
    }

    /// Serialized `<body>` content.
    #[must_use]
    pub fn body_markup(&self) -> String {
        self.inner_markup(&self.body)
    }

    /// First element whose `id` attribute equals `id`.
    #[must_use]
    pub fn element_by_id(&self, id: &str) -> Option<NodeId> {
        self.element_descendants(self.root)
            .into_iter()
            .find(|&n| self.attr(n, "id") == Some(id))
    }

    /// Append parsed `markup` to `parent`, as the host page would.
    pub fn append_markup(&mut self, parent: NodeId, markup: &str) -> Result<Vec<NodeId>, DomError> {
        let fresh = self.parse_fragment(markup)?;
        for &node in &fresh {
            self.insert_before(&parent, &node, None)?;
        }
        Ok(fresh)
    }

    /// Resize the window.
    pub fn set_viewport_height(&mut self, height: f64) {
        if (height - self.viewport_height).abs() < f64::EPSILON {
            return;
        }
        self.viewport_height = height.max(1.0);
        let targets: Vec<Observer> = self
            .subscriptions
            .iter()
            .filter(|s| match &s.kind {
                SubscriptionKind::WindowResize => true,
                SubscriptionKind::ElementResize(n) => *n == self.root,
                _ => false,
            })
            .map(|s| s.owner)
            .collect();
        for owner in targets {
            self.push_event(owner, HostEvent::Resize);
        }
    }

    #[must_use]
    pub fn active_subscriptions(&self) -> &[Subscription<NodeId>] {
        &self.subscriptions
    }

    /// Drain recorded notifications in delivery order: insertions first
    /// (one batch per observer), then scroll and resize events.
    pub fn take_events(&mut self) -> Vec<(Observer, HostEvent<NodeId>)> {
        self.inbox.drain()
    }

    #[must_use]
    pub fn has_pending_events(&self) -> bool {
        !self.inbox.is_empty()
    }

    // -- internals ----------------------------------------------------------

    fn alloc(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX));
        self.nodes.push(NodeData {
            kind,
            parent: None,
            children: Vec::new(),
        });
        id
    }

    fn alloc_element(&mut self, tag: &str, attrs: Vec<(String, String)>) -> NodeId {
        self.alloc(NodeKind::Element {
            tag: tag.to_ascii_lowercase(),
            attrs,
            scroll_top: 0.0,
        })
    }

    fn data(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.idx()]
    }

    fn attrs_mut(&mut self, id: NodeId) -> Option<&mut Vec<(String, String)>> {
        match &mut self.nodes[id.idx()].kind {
            NodeKind::Element { attrs, .. } => Some(attrs),
            NodeKind::Text(_) => None,
        }
    }

    fn style_value(&self, id: NodeId, property: &str) -> Option<String> {
        let style = self.attr(id, "style")?;
        style.split(';').find_map(|decl| {
            let (k, v) = decl.split_once(':')?;
            (k.trim().eq_ignore_ascii_case(property)).then(|| v.trim().to_owned())
        })
    }

    fn fixed_height(&self, id: NodeId) -> Option<f64> {
        let raw = self.style_value(id, "height")?;
        raw.strip_suffix("px")
            .unwrap_or(&raw)
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|h| h.is_finite() && *h >= 0.0)
    }

    fn is_scroller(&self, id: NodeId) -> bool {
        id == self.root || self.overflow_y(&id).scrolls()
    }

    fn height_of(&self, id: NodeId) -> f64 {
        match &self.data(id).kind {
            NodeKind::Text(text) => {
                let lines = text.lines().filter(|l| !l.trim().is_empty()).count();
                lines as f64 * LINE_HEIGHT_PX
            }
            NodeKind::Element { .. } if self.is_display_none(id) => 0.0,
            NodeKind::Element { .. } => self
                .fixed_height(id)
                .unwrap_or_else(|| self.content_height(id)),
        }
    }

    /// Space `id` takes in its parent's block flow.
    fn flow_height(&self, id: NodeId) -> f64 {
        let positioned = matches!(
            self.style_value(id, "position").as_deref(),
            Some("fixed" | "absolute")
        );
        if positioned { 0.0 } else { self.height_of(id) }
    }

    fn is_display_none(&self, id: NodeId) -> bool {
        self.style_value(id, "display").as_deref() == Some("none")
    }

    fn content_height(&self, id: NodeId) -> f64 {
        self.data(id)
            .children
            .iter()
            .map(|&c| self.flow_height(c))
            .sum()
    }

    fn offset_in_parent(&self, id: NodeId) -> f64 {
        let Some(parent) = self.data(id).parent else {
            return 0.0;
        };
        self.data(parent)
            .children
            .iter()
            .take_while(|&&c| c != id)
            .map(|&c| self.flow_height(c))
            .sum()
    }

    fn max_scroll(&self, id: NodeId) -> f64 {
        (self.scroll_height(&id) - self.client_height(&id)).max(0.0)
    }

    fn is_ancestor_or_self(&self, ancestor: NodeId, mut node: NodeId) -> bool {
        loop {
            if node == ancestor {
                return true;
            }
            match self.data(node).parent {
                Some(p) => node = p,
                None => return false,
            }
        }
    }

    fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id.idx()].parent.take() {
            self.nodes[parent.idx()].children.retain(|&c| c != id);
        }
    }

    fn record_added(&mut self, node: NodeId) {
        let owners: Vec<Observer> = self
            .subscriptions
            .iter()
            .filter(|s| s.kind == SubscriptionKind::Mutations)
            .map(|s| s.owner)
            .collect();
        for owner in owners {
            self.inbox.nodes_added(owner, [node]);
        }
    }

    fn record_removed(&mut self) {
        let owners: Vec<Observer> = self
            .subscriptions
            .iter()
            .filter(|s| s.kind == SubscriptionKind::Mutations)
            .map(|s| s.owner)
            .collect();
        for owner in owners {
            self.push_event(owner, HostEvent::NodesRemoved);
        }
    }

    fn push_event(&mut self, owner: Observer, event: HostEvent<NodeId>) {
        self.inbox.push(owner, event);
    }

    fn serialize_into(&self, id: NodeId, out: &mut String) {
        match &self.data(id).kind {
            NodeKind::Text(text) => out.push_str(&escape_text(text)),
            NodeKind::Element { tag, attrs, .. } => {
                out.push('<');
                out.push_str(tag);
                for (k, v) in attrs {
                    out.push(' ');
                    out.push_str(k);
                    out.push_str("=\"");
                    out.push_str(&escape_attr(v));
                    out.push('"');
                }
                out.push('>');
                if VOID_ELEMENTS.contains(&tag.as_str()) {
                    return;
                }
                for &child in &self.data(id).children {
                    self.serialize_into(child, out);
                }
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
        }
    }

    /// Parse `markup` into detached top-level nodes.
    fn parse_fragment(&mut self, markup: &str) -> Result<Vec<NodeId>, DomError> {
        let bytes = markup.as_bytes();
        let mut roots = Vec::new();
        let mut stack: Vec<NodeId> = Vec::new();
        let mut i = 0;

        while i < bytes.len() {
            let rest = &markup[i..];
            if rest.starts_with("<!--") {
                let end = rest
                    .find("-->")
                    .ok_or_else(|| DomError::Markup("unterminated comment".to_owned()))?;
                i += end + 3;
                continue;
            }
            if rest.starts_with("</") {
                let end = rest
                    .find('>')
                    .ok_or_else(|| DomError::Markup("unterminated end tag".to_owned()))?;
                let name = rest[2..end].trim().to_ascii_lowercase();
                match stack.pop() {
                    Some(open) if self.tag(open) == name => {}
                    _ => return Err(DomError::Markup(format!("unexpected </{name}>"))),
                }
                i += end + 1;
                continue;
            }
            if bytes[i] == b'<' && bytes.get(i + 1).is_some_and(u8::is_ascii_alphabetic) {
                let (tag, attrs, self_closing, consumed) = parse_start_tag(rest)?;
                let void = self_closing || VOID_ELEMENTS.contains(&tag.as_str());
                let node = self.alloc_element(&tag, attrs);
                self.attach_parsed(&mut roots, &stack, node);
                if !void {
                    stack.push(node);
                }
                i += consumed;
                continue;
            }
            // Text runs to the next tag opener; a stray '<' is literal text.
            let first = rest.chars().next().map_or(1, char::len_utf8);
            let end = rest[first..]
                .find('<')
                .map_or(rest.len(), |at| at + first);
            let text = decode_entities(&rest[..end]);
            let node = self.alloc(NodeKind::Text(text));
            self.attach_parsed(&mut roots, &stack, node);
            i += end;
        }

        if let Some(open) = stack.last() {
            return Err(DomError::Markup(format!("unclosed <{}>", self.tag(*open))));
        }
        Ok(roots)
    }

    fn attach_parsed(&mut self, roots: &mut Vec<NodeId>, stack: &[NodeId], node: NodeId) {
        match stack.last() {
            Some(&parent) => {
                self.nodes[node.idx()].parent = Some(parent);
                self.nodes[parent.idx()].children.push(node);
            }
            None => roots.push(node),
        }
    }
}

fn parse_start_tag(rest: &str) -> Result<(String, Vec<(String, String)>, bool, usize), DomError> {
    let unterminated = || DomError::Markup("unterminated start tag".to_owned());
    let bytes = rest.as_bytes();
    let mut i = 1;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'-') {
        i += 1;
    }
    let tag = rest[1..i].to_ascii_lowercase();
    let mut attrs = Vec::new();
    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        match bytes.get(i) {
            None => return Err(unterminated()),
            Some(b'>') => return Ok((tag, attrs, false, i + 1)),
            Some(b'/') if bytes.get(i + 1) == Some(&b'>') => {
                return Ok((tag, attrs, true, i + 2));
            }
            Some(_) => {}
        }
        let start = i;
        while i < bytes.len() && !matches!(bytes[i], b'=' | b'>' | b'/') && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if start == i {
            return Err(DomError::Markup(format!(
                "unexpected {:?} in <{tag}>",
                char::from(bytes[i])
            )));
        }
        let name = rest[start..i].to_ascii_lowercase();
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let mut value = String::new();
        if bytes.get(i) == Some(&b'=') {
            i += 1;
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            match bytes.get(i) {
                Some(&q @ (b'"' | b'\'')) => {
                    let close = rest[i + 1..].find(char::from(q)).ok_or_else(unterminated)?;
                    value = decode_entities(&rest[i + 1..i + 1 + close]);
                    i += close + 2;
                }
                Some(_) => {
                    let begin = i;
                    while i < bytes.len() && bytes[i] != b'>' && !bytes[i].is_ascii_whitespace() {
                        i += 1;
                    }
                    value = decode_entities(&rest[begin..i]);
                }
                None => return Err(unterminated()),
            }
        }
        attrs.retain(|(k, _): &(String, String)| *k != name);
        attrs.push((name, value));
    }
}

fn escape_text(raw: &str) -> String {
    raw.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attr(raw: &str) -> String {
    raw.replace('&', "&amp;").replace('"', "&quot;").replace('<', "&lt;")
}

fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_owned();
    }
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

impl ElementTree for HeadlessDocument {
    type Node = NodeId;

    fn parent_element(&self, node: NodeId) -> Option<NodeId> {
        self.data(node).parent
    }

    fn tag(&self, node: NodeId) -> &str {
        match &self.data(node).kind {
            NodeKind::Element { tag, .. } => tag,
            NodeKind::Text(_) => "",
        }
    }

    fn attr(&self, node: NodeId, name: &str) -> Option<&str> {
        match &self.data(node).kind {
            NodeKind::Element { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str()),
            NodeKind::Text(_) => None,
        }
    }

    fn element_index(&self, node: NodeId) -> usize {
        let Some(parent) = self.data(node).parent else {
            return 1;
        };
        self.data(parent)
            .children
            .iter()
            .filter(|&&c| matches!(self.data(c).kind, NodeKind::Element { .. }))
            .position(|&c| c == node)
            .map_or(1, |p| p + 1)
    }

    fn element_descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.data(node).children.iter().rev().copied().collect();
        while let Some(n) = stack.pop() {
            if matches!(self.data(n).kind, NodeKind::Element { .. }) {
                out.push(n);
                stack.extend(self.data(n).children.iter().rev().copied());
            }
        }
        out
    }
}

impl DocumentHost for HeadlessDocument {
    type Node = NodeId;

    fn document_element(&self) -> NodeId {
        self.root
    }

    fn body(&self) -> Option<NodeId> {
        Some(self.body)
    }

    fn scrolling_element(&self) -> NodeId {
        self.root
    }

    fn query_all(&self, selector: &str) -> Result<Vec<NodeId>, DomError> {
        let list = SelectorList::parse(selector)?;
        Ok(list.select_within(self, self.root))
    }

    fn query_within(&self, root: &NodeId, selector: &str) -> Result<Vec<NodeId>, DomError> {
        let list = SelectorList::parse(selector)?;
        Ok(list.select_within(self, *root))
    }

    fn matches(&self, node: &NodeId, selector: &str) -> Result<bool, DomError> {
        if !self.is_element(node) {
            return Ok(false);
        }
        let list = SelectorList::parse(selector)?;
        Ok(list.matches(self, *node))
    }

    fn is_element(&self, node: &NodeId) -> bool {
        matches!(self.data(*node).kind, NodeKind::Element { .. })
    }

    fn is_connected(&self, node: &NodeId) -> bool {
        self.is_ancestor_or_self(self.root, *node)
    }

    fn parent_element(&self, node: &NodeId) -> Option<NodeId> {
        self.data(*node).parent
    }

    fn next_sibling(&self, node: &NodeId) -> Option<NodeId> {
        let parent = self.data(*node).parent?;
        let siblings = &self.data(parent).children;
        let at = siblings.iter().position(|c| c == node)?;
        siblings.get(at + 1).copied()
    }

    fn element_children(&self, node: &NodeId) -> Vec<NodeId> {
        self.data(*node)
            .children
            .iter()
            .copied()
            .filter(|c| self.is_element(c))
            .collect()
    }

    fn tag_name(&self, node: &NodeId) -> String {
        self.tag(*node).to_owned()
    }

    fn attribute(&self, node: &NodeId, name: &str) -> Option<String> {
        self.attr(*node, name).map(str::to_owned)
    }

    fn create_element(&mut self, tag: &str) -> Result<NodeId, DomError> {
        Ok(self.alloc_element(tag, Vec::new()))
    }

    fn set_attribute(&mut self, node: &NodeId, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        if let Some(attrs) = self.attrs_mut(*node) {
            match attrs.iter_mut().find(|(k, _)| *k == name) {
                Some((_, v)) => *v = value.to_owned(),
                None => attrs.push((name, value.to_owned())),
            }
        }
    }

    fn set_style(&mut self, node: &NodeId, property: &str, value: &str) {
        if !self.is_element(node) {
            return;
        }
        let before = self.client_height(node);
        let mut decls: Vec<(String, String)> = self
            .attr(*node, "style")
            .unwrap_or("")
            .split(';')
            .filter_map(|d| {
                let (k, v) = d.split_once(':')?;
                Some((k.trim().to_ascii_lowercase(), v.trim().to_owned()))
            })
            .filter(|(k, _)| !k.is_empty())
            .collect();
        let property = property.trim().to_ascii_lowercase();
        decls.retain(|(k, _)| *k != property);
        if !value.trim().is_empty() {
            decls.push((property, value.trim().to_owned()));
        }
        let style = decls
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("; ");
        self.set_attribute(node, "style", &style);

        if (self.client_height(node) - before).abs() > f64::EPSILON {
            let owners: Vec<Observer> = self
                .subscriptions
                .iter()
                .filter(|s| s.kind == SubscriptionKind::ElementResize(*node))
                .map(|s| s.owner)
                .collect();
            for owner in owners {
                self.push_event(owner, HostEvent::Resize);
            }
        }
    }

    fn insert_before(
        &mut self,
        parent: &NodeId,
        node: &NodeId,
        reference: Option<&NodeId>,
    ) -> Result<(), DomError> {
        if !self.is_element(parent) {
            return Err(DomError::NoParent);
        }
        if self.is_ancestor_or_self(*node, *parent) {
            return Err(DomError::Markup("insertion would create a cycle".to_owned()));
        }
        if let Some(reference) = reference {
            if self.data(*reference).parent != Some(*parent) {
                return Err(DomError::Detached);
            }
        }
        self.detach(*node);
        let children = &mut self.nodes[parent.idx()].children;
        let at = reference
            .and_then(|r| children.iter().position(|c| c == r))
            .unwrap_or(children.len());
        children.insert(at, *node);
        self.nodes[node.idx()].parent = Some(*parent);
        if self.is_connected(parent) {
            self.record_added(*node);
        }
        Ok(())
    }

    fn remove(&mut self, node: &NodeId) {
        let was_connected = self.is_connected(node);
        self.detach(*node);
        if was_connected {
            self.record_removed();
        }
    }

    fn inner_markup(&self, node: &NodeId) -> String {
        let mut out = String::new();
        for &child in &self.data(*node).children {
            self.serialize_into(child, &mut out);
        }
        out
    }

    fn set_inner_markup(&mut self, node: &NodeId, markup: &str) -> Result<(), DomError> {
        if !self.is_element(node) {
            return Err(DomError::NoParent);
        }
        let fresh = self.parse_fragment(markup)?;
        let old = std::mem::take(&mut self.nodes[node.idx()].children);
        if !old.is_empty() && self.is_connected(node) {
            self.record_removed();
        }
        for child in old {
            self.nodes[child.idx()].parent = None;
        }
        for child in fresh {
            self.insert_before(node, &child, None)?;
        }
        Ok(())
    }

    fn bounding_rect(&self, node: &NodeId) -> Rect {
        if !self.is_connected(node) {
            return Rect::default();
        }
        // The root box moves with the document scroll, as in a browser.
        let mut top = if *node == self.root {
            -self.scroll_top(node)
        } else {
            0.0
        };
        let mut cursor = *node;
        while let Some(parent) = self.data(cursor).parent {
            top += self.offset_in_parent(cursor);
            if self.is_scroller(parent) {
                top -= self.scroll_top(&parent);
            }
            cursor = parent;
        }
        Rect::new(top, self.height_of(*node))
    }

    fn overflow_y(&self, node: &NodeId) -> Overflow {
        self.style_value(*node, "overflow-y")
            .or_else(|| self.style_value(*node, "overflow"))
            .map_or(Overflow::Visible, |v| Overflow::from_css(&v))
    }

    fn scroll_top(&self, node: &NodeId) -> f64 {
        match self.data(*node).kind {
            NodeKind::Element { scroll_top, .. } if self.is_scroller(*node) => {
                scroll_top.min(self.max_scroll(*node)).max(0.0)
            }
            _ => 0.0,
        }
    }

    fn set_scroll_top(&mut self, node: &NodeId, value: f64) {
        if !self.is_scroller(*node) || !value.is_finite() {
            return;
        }
        let before = self.scroll_top(node);
        let clamped = value.clamp(0.0, self.max_scroll(*node));
        if let NodeKind::Element { scroll_top, .. } = &mut self.nodes[node.idx()].kind {
            *scroll_top = clamped;
        }
        if (clamped - before).abs() > f64::EPSILON {
            let owners: Vec<Observer> = self
                .subscriptions
                .iter()
                .filter(|s| s.kind == SubscriptionKind::Scroll(*node))
                .map(|s| s.owner)
                .collect();
            for owner in owners {
                self.push_event(owner, HostEvent::Scroll(*node));
            }
        }
    }

    fn client_height(&self, node: &NodeId) -> f64 {
        if *node == self.root {
            self.viewport_height
        } else {
            self.height_of(*node)
        }
    }

    fn scroll_height(&self, node: &NodeId) -> f64 {
        self.content_height(*node).max(self.client_height(node))
    }

    fn scroll_into_view_end(&mut self, node: &NodeId) {
        if !self.is_connected(node) {
            return;
        }
        let mut offset = 0.0;
        let mut cursor = *node;
        let container = loop {
            let Some(parent) = self.data(cursor).parent else {
                return;
            };
            offset += self.offset_in_parent(cursor);
            if self.is_scroller(parent) {
                break parent;
            }
            cursor = parent;
        };
        let target = offset + self.height_of(*node) - self.client_height(&container);
        self.set_scroll_top(&container, target);
    }

    fn subscribe(&mut self, subscription: Subscription<NodeId>) -> Result<(), DomError> {
        if !self.resize_observer && matches!(subscription.kind, SubscriptionKind::ElementResize(_))
        {
            return Err(DomError::Unsupported("ResizeObserver"));
        }
        if !self.subscriptions.contains(&subscription) {
            self.subscriptions.push(subscription);
        }
        Ok(())
    }

    fn unsubscribe(&mut self, subscription: &Subscription<NodeId>) {
        self.subscriptions.retain(|s| s != subscription);
        self.inbox.forget(subscription, &self.subscriptions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FIXTURE: &str = concat!(
        r#"<main id="main"><div id="scroller" style="height: 100px; overflow-y: auto">"#,
        r#"<div id="a" style="height: 60px">a</div>"#,
        r#"<div id="b" style="height: 80px">b</div>"#,
        r#"<div id="c">one
two</div>"#,
        "</div></main>"
    );

    fn fixture() -> (HeadlessDocument, NodeId) {
        let doc = HeadlessDocument::from_body_markup(400.0, FIXTURE).expect("fixture parses");
        let scroller = doc.element_by_id("scroller").expect("scroller exists");
        (doc, scroller)
    }

    #[test]
    fn markup_round_trips_through_serializer() {
        let (doc, _) = fixture();
        let again = HeadlessDocument::from_body_markup(400.0, &doc.body_markup())
            .expect("serialized markup parses");
        assert_eq!(again.body_markup(), doc.body_markup());
    }

    #[test]
    fn entities_and_void_elements_parse() {
        let doc = HeadlessDocument::from_body_markup(
            100.0,
            r#"<p title="a &quot;b&quot;">x &lt; y<br>z</p>"#,
        )
        .expect("parses");
        let p = doc.query_all("p").unwrap()[0];
        assert_eq!(doc.attribute(&p, "title").as_deref(), Some("a \"b\""));
        assert_eq!(doc.inner_markup(&p), "x &lt; y<br>z");
    }

    #[test]
    fn malformed_markup_is_an_error() {
        assert!(HeadlessDocument::from_body_markup(100.0, "<div><span></div>").is_err());
        assert!(HeadlessDocument::from_body_markup(100.0, "<div").is_err());
        assert!(HeadlessDocument::from_body_markup(100.0, "<div>").is_err());
    }

    #[test]
    fn block_layout_and_scroll_geometry() {
        let (mut doc, scroller) = fixture();
        let c = doc.element_by_id("c").unwrap();
        assert_eq!(doc.bounding_rect(&c), Rect::new(140.0, 40.0));
        assert_eq!(doc.scroll_height(&scroller), 180.0);
        assert_eq!(doc.client_height(&scroller), 100.0);

        doc.set_scroll_top(&scroller, 500.0);
        assert_eq!(doc.scroll_top(&scroller), 80.0);
        assert_eq!(doc.bounding_rect(&c).top, 60.0);
    }

    #[test]
    fn scroll_into_view_end_aligns_bottom_edges() {
        let (mut doc, scroller) = fixture();
        let b = doc.element_by_id("b").unwrap();
        doc.scroll_into_view_end(&b);
        assert_eq!(doc.scroll_top(&scroller), 40.0);
        let rect = doc.bounding_rect(&b);
        let container = doc.bounding_rect(&scroller);
        assert_eq!(rect.bottom(), container.bottom());
    }

    #[test]
    fn detached_nodes_have_empty_geometry() {
        let (mut doc, _) = fixture();
        let a = doc.element_by_id("a").unwrap();
        doc.remove(&a);
        assert!(!doc.is_connected(&a));
        assert_eq!(doc.bounding_rect(&a), Rect::default());
        assert!(doc.element_by_id("a").is_none());
    }

    #[test]
    fn mutations_are_recorded_only_while_subscribed() {
        let (mut doc, scroller) = fixture();
        doc.append_markup(scroller, "<div>early</div>").unwrap();
        assert!(doc.take_events().is_empty());

        let sub = Subscription::new(Observer::Controller, SubscriptionKind::Mutations);
        doc.subscribe(sub.clone()).unwrap();
        let added = doc.append_markup(scroller, "<div>late</div><p>x</p>").unwrap();
        assert_eq!(
            doc.take_events(),
            vec![(Observer::Controller, HostEvent::NodesAdded(added.clone()))]
        );

        doc.remove(&added[0]);
        doc.remove(&added[1]);
        doc.remove(&added[1]);
        assert_eq!(
            doc.take_events(),
            vec![(Observer::Controller, HostEvent::NodesRemoved)]
        );

        doc.unsubscribe(&sub);
        doc.append_markup(scroller, "<div>after</div>").unwrap();
        assert!(doc.take_events().is_empty());
    }

    #[test]
    fn scroll_events_coalesce_per_observer() {
        let (mut doc, scroller) = fixture();
        doc.subscribe(Subscription::new(
            Observer::Controller,
            SubscriptionKind::Scroll(scroller),
        ))
        .unwrap();
        doc.set_scroll_top(&scroller, 10.0);
        doc.set_scroll_top(&scroller, 20.0);
        doc.set_scroll_top(&scroller, 20.0);
        assert_eq!(
            doc.take_events(),
            vec![(Observer::Controller, HostEvent::Scroll(scroller))]
        );
    }

    #[test]
    fn missing_resize_observer_is_reported() {
        let (doc, scroller) = fixture();
        let mut doc = doc.without_resize_observer();
        let err = doc
            .subscribe(Subscription::new(
                Observer::Controller,
                SubscriptionKind::ElementResize(scroller),
            ))
            .unwrap_err();
        assert_eq!(err, DomError::Unsupported("ResizeObserver"));
    }

    #[test]
    fn insert_before_rejects_foreign_reference() {
        let (mut doc, scroller) = fixture();
        let main = doc.element_by_id("main").unwrap();
        let a = doc.element_by_id("a").unwrap();
        let fresh = doc.create_element("div").unwrap();
        assert_eq!(
            doc.insert_before(&main, &fresh, Some(&a)),
            Err(DomError::Detached)
        );
        assert!(doc.insert_before(&scroller, &fresh, Some(&a)).is_ok());
        assert_eq!(doc.element_children(&scroller)[0], fresh);
    }

    #[test]
    fn fixed_and_hidden_boxes_leave_the_flow() {
        let (mut doc, scroller) = fixture();
        let b = doc.element_by_id("b").unwrap();
        let c = doc.element_by_id("c").unwrap();
        assert_eq!(doc.scroll_height(&scroller), 180.0);

        doc.set_style(&b, "position", "fixed");
        assert_eq!(doc.scroll_height(&scroller), 100.0);
        assert_eq!(doc.bounding_rect(&c).top, 60.0);
        assert_eq!(doc.bounding_rect(&b).height, 80.0);

        doc.set_style(&b, "position", "");
        doc.set_style(&b, "display", "none");
        assert_eq!(doc.bounding_rect(&b).height, 0.0);
        assert_eq!(doc.bounding_rect(&c).top, 60.0);
    }
}
