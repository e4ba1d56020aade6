#![forbid(unsafe_code)]

//! The document seam.
//!
//! [`DocumentHost`] is everything the discovery loader and the virtualizing
//! controller ask of the hosted page: queries, tree edits, geometry, and
//! change subscriptions. The browser frontend implements it over `web-sys`;
//! tests and native embedding use [`HeadlessDocument`](crate::headless::HeadlessDocument).
//!
//! Hosts deliver observed changes back as [`HostEvent`]s tagged with the
//! [`Observer`] that subscribed to them.

use crate::selector::SelectorError;
use std::fmt;

/// Vertical client-space geometry of a node.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub top: f64,
    pub height: f64,
}

impl Rect {
    #[must_use]
    pub const fn new(top: f64, height: f64) -> Self {
        Self { top, height }
    }

    #[inline]
    #[must_use]
    pub fn bottom(self) -> f64 {
        self.top + self.height
    }
}

/// Computed `overflow-y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Overflow {
    #[default]
    Visible,
    Hidden,
    Clip,
    Auto,
    Scroll,
}

impl Overflow {
    /// Parse a CSS `overflow-y` keyword; unknown keywords are `Visible`.
    #[must_use]
    pub fn from_css(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "hidden" => Self::Hidden,
            "clip" => Self::Clip,
            "auto" => Self::Auto,
            "scroll" => Self::Scroll,
            _ => Self::Visible,
        }
    }

    /// Whether the element scrolls its content vertically.
    #[must_use]
    pub const fn scrolls(self) -> bool {
        matches!(self, Self::Auto | Self::Scroll)
    }
}

/// Which component owns a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Observer {
    Loader,
    Controller,
}

impl Observer {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Loader => "loader",
            Self::Controller => "controller",
        }
    }
}

/// A change-notification subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionKind<N> {
    /// Scroll events on one element.
    Scroll(N),
    /// Size changes of one element (ResizeObserver).
    ElementResize(N),
    /// Window resize events; the coarse fallback for `ElementResize`.
    WindowResize,
    /// Subtree insertions and removals anywhere in the document.
    Mutations,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscription<N> {
    pub owner: Observer,
    pub kind: SubscriptionKind<N>,
}

impl<N> Subscription<N> {
    #[must_use]
    pub const fn new(owner: Observer, kind: SubscriptionKind<N>) -> Self {
        Self { owner, kind }
    }
}

/// Change notifications delivered by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent<N> {
    /// Nodes inserted into the document since the last delivery, in
    /// insertion order. May contain non-element nodes.
    NodesAdded(Vec<N>),
    /// Something was detached from the document since the last delivery.
    NodesRemoved,
    /// The given element scrolled.
    Scroll(N),
    /// A watched element or the window changed size.
    Resize,
}

/// Errors from document operations.
#[derive(Debug, Clone, PartialEq)]
pub enum DomError {
    /// The node is no longer attached where the operation needs it.
    Detached,
    /// The node has no parent to insert into.
    NoParent,
    /// The selector could not be evaluated.
    InvalidSelector(SelectorError),
    /// Markup could not be parsed by the host.
    Markup(String),
    /// The host lacks a capability (e.g. `ResizeObserver`).
    Unsupported(&'static str),
}

impl fmt::Display for DomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detached => write!(f, "node is detached from the document"),
            Self::NoParent => write!(f, "node has no parent"),
            Self::InvalidSelector(err) => write!(f, "invalid selector: {err}"),
            Self::Markup(msg) => write!(f, "markup error: {msg}"),
            Self::Unsupported(what) => write!(f, "host does not support {what}"),
        }
    }
}

impl std::error::Error for DomError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidSelector(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SelectorError> for DomError {
    fn from(err: SelectorError) -> Self {
        Self::InvalidSelector(err)
    }
}

/// The hosted document as seen by the loader and controller.
///
/// All geometry is in CSS pixels. Detached nodes report a zero [`Rect`].
pub trait DocumentHost {
    type Node: Clone + PartialEq + fmt::Debug;

    fn document_element(&self) -> Self::Node;
    fn body(&self) -> Option<Self::Node>;
    /// The root scroller (`document.scrollingElement`).
    fn scrolling_element(&self) -> Self::Node;

    /// All elements matching `selector`, in document order.
    fn query_all(&self, selector: &str) -> Result<Vec<Self::Node>, DomError>;
    /// Matching descendants of `root`, in document order.
    fn query_within(&self, root: &Self::Node, selector: &str)
    -> Result<Vec<Self::Node>, DomError>;
    fn matches(&self, node: &Self::Node, selector: &str) -> Result<bool, DomError>;

    fn is_element(&self, node: &Self::Node) -> bool;
    fn is_connected(&self, node: &Self::Node) -> bool;
    fn parent_element(&self, node: &Self::Node) -> Option<Self::Node>;
    fn next_sibling(&self, node: &Self::Node) -> Option<Self::Node>;
    fn element_children(&self, node: &Self::Node) -> Vec<Self::Node>;
    /// Lowercase tag name; empty for non-elements.
    fn tag_name(&self, node: &Self::Node) -> String;
    fn attribute(&self, node: &Self::Node, name: &str) -> Option<String>;

    fn create_element(&mut self, tag: &str) -> Result<Self::Node, DomError>;
    fn set_attribute(&mut self, node: &Self::Node, name: &str, value: &str);
    fn set_style(&mut self, node: &Self::Node, property: &str, value: &str);
    /// Insert `node` into `parent` before `reference` (append when `None`),
    /// moving it if it is already attached elsewhere.
    fn insert_before(
        &mut self,
        parent: &Self::Node,
        node: &Self::Node,
        reference: Option<&Self::Node>,
    ) -> Result<(), DomError>;
    /// Detach `node` from its parent; no-op when already detached.
    fn remove(&mut self, node: &Self::Node);
    /// Serialized content of `node` (`innerHTML`).
    fn inner_markup(&self, node: &Self::Node) -> String;
    /// Replace the content of `node` (`innerHTML = markup`).
    fn set_inner_markup(&mut self, node: &Self::Node, markup: &str) -> Result<(), DomError>;

    fn bounding_rect(&self, node: &Self::Node) -> Rect;
    fn overflow_y(&self, node: &Self::Node) -> Overflow;
    fn scroll_top(&self, node: &Self::Node) -> f64;
    /// Set the scroll offset; hosts clamp to the legal range.
    fn set_scroll_top(&mut self, node: &Self::Node, value: f64);
    fn client_height(&self, node: &Self::Node) -> f64;
    fn scroll_height(&self, node: &Self::Node) -> f64;
    /// `scrollIntoView({ block: "end" })`.
    fn scroll_into_view_end(&mut self, node: &Self::Node);

    fn subscribe(&mut self, subscription: Subscription<Self::Node>) -> Result<(), DomError>;
    fn unsubscribe(&mut self, subscription: &Subscription<Self::Node>);
}

/// Set the inline height of `node` in whole pixels.
pub fn set_height_px<H: DocumentHost>(host: &mut H, node: &H::Node, px: f64) {
    host.set_style(node, "height", &format!("{}px", px.round()));
}

/// Number of matches for `selector`, treating evaluation errors as absent.
pub fn count_matches<H: DocumentHost>(host: &H, selector: &str) -> Option<usize> {
    match host.query_all(selector) {
        Ok(nodes) => Some(nodes.len()),
        Err(err) => {
            tracing::debug!(selector, %err, "selector evaluation failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_keywords_parse_case_insensitively() {
        assert_eq!(Overflow::from_css("AUTO"), Overflow::Auto);
        assert_eq!(Overflow::from_css(" scroll "), Overflow::Scroll);
        assert_eq!(Overflow::from_css("hidden"), Overflow::Hidden);
        assert_eq!(Overflow::from_css("overlay"), Overflow::Visible);
        assert!(Overflow::Auto.scrolls());
        assert!(!Overflow::Hidden.scrolls());
    }

    #[test]
    fn dom_error_exposes_selector_source() {
        let err = DomError::from(SelectorError::UnexpectedEnd);
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(
            err.to_string(),
            "invalid selector: unexpected end of selector"
        );
    }
}
