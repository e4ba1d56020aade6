#![forbid(unsafe_code)]

//! Tracked items and the mount/unmount primitives.
//!
//! A tracked item pairs a turn element with a placeholder that never leaves
//! the turn's position. While unmounted the placeholder alone fills the slot
//! at the item's last measured height. While mounted the element sits
//! directly before the placeholder, which is collapsed to zero height, so the
//! slot always ends at the placeholder's bottom edge.

use crate::config::VirtualizerConfig;
use crate::dom::{DocumentHost, DomError, set_height_px};

/// Role attribute carrying the turn author.
pub const ROLE_ATTR: &str = "data-message-author-role";
/// Fallback attribute checked for an `assistant` substring.
pub const TEST_ID_ATTR: &str = "data-testid";

/// One turn under virtualization.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedItem<N> {
    pub element: N,
    pub placeholder: N,
    pub mounted: bool,
    /// Last measured height, never below the configured floor.
    pub height: f64,
    /// Serialized content, held only while unmounted.
    pub cached_markup: Option<String>,
    /// Parent and next sibling at capture time.
    pub parent: N,
    pub anchor: Option<N>,
    pub scroll_container: N,
    pub assistant: bool,
}

/// Vertical span of an item in container content coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Slot {
    pub top: f64,
    pub bottom: f64,
}

impl Slot {
    #[must_use]
    pub fn intersects(self, top: f64, bottom: f64) -> bool {
        self.bottom >= top && self.top <= bottom
    }
}

/// `max(floor, round(height))` of a node's box; detached nodes get the floor.
pub fn measured_height<H: DocumentHost>(host: &H, node: &H::Node, floor: f64) -> f64 {
    let raw = host.bounding_rect(node).height.round();
    if raw.is_finite() { raw.max(floor) } else { floor }
}

/// Whether a turn element was authored by the assistant.
pub fn is_assistant<H: DocumentHost>(host: &H, element: &H::Node) -> bool {
    match host.attribute(element, ROLE_ATTR) {
        Some(role) if !role.is_empty() => role == "assistant",
        _ => host
            .attribute(element, TEST_ID_ATTR)
            .is_some_and(|id| id.to_ascii_lowercase().contains("assistant")),
    }
}

/// Nearest ancestor of `start` (inclusive) that scrolls vertically, stopping
/// at `<body>`; the document's scrolling element otherwise.
pub fn find_scroll_container<H: DocumentHost>(host: &H, start: &H::Node) -> H::Node {
    let body = host.body();
    let mut cursor = Some(start.clone());
    while let Some(node) = cursor {
        if body.as_ref() == Some(&node) {
            break;
        }
        if host.overflow_y(&node).scrolls() {
            return node;
        }
        cursor = host.parent_element(&node);
    }
    host.scrolling_element()
}

impl<N: Clone + PartialEq + std::fmt::Debug> TrackedItem<N> {
    /// Replace an attached `element` with a sized placeholder.
    ///
    /// The element is measured before it is detached so the placeholder keeps
    /// the slot's height. The returned item is unmounted.
    pub fn capture<H>(host: &mut H, element: N, cfg: &VirtualizerConfig) -> Result<Self, DomError>
    where
        H: DocumentHost<Node = N>,
    {
        let parent = host.parent_element(&element).ok_or(DomError::NoParent)?;
        let anchor = host.next_sibling(&element);
        let height = measured_height(host, &element, cfg.min_height_px);
        let scroll_container = find_scroll_container(host, &parent);
        let assistant = is_assistant(host, &element);

        let placeholder = host.create_element("div")?;
        host.set_attribute(&placeholder, &cfg.placeholder_attr, "1");
        host.set_style(&placeholder, "width", "100%");
        host.set_style(&placeholder, "box-sizing", "border-box");
        set_height_px(host, &placeholder, height);
        host.insert_before(&parent, &placeholder, Some(&element))?;
        host.remove(&element);

        Ok(Self {
            element,
            placeholder,
            mounted: false,
            height,
            cached_markup: None,
            parent,
            anchor,
            scroll_container,
            assistant,
        })
    }

    /// Reattach the element before its placeholder. Returns whether anything
    /// changed; an item whose placeholder left the document is skipped.
    pub fn mount<H>(&mut self, host: &mut H) -> Result<bool, DomError>
    where
        H: DocumentHost<Node = N>,
    {
        if self.mounted || !host.is_connected(&self.placeholder) {
            return Ok(false);
        }
        let parent = host
            .parent_element(&self.placeholder)
            .ok_or(DomError::Detached)?;
        if let Some(markup) = self.cached_markup.as_deref() {
            if host.inner_markup(&self.element).is_empty() {
                host.set_inner_markup(&self.element, markup)?;
            }
        }
        self.cached_markup = None;
        host.insert_before(&parent, &self.element, Some(&self.placeholder))?;
        set_height_px(host, &self.placeholder, 0.0);
        self.mounted = true;
        Ok(true)
    }

    /// Size the placeholder to the element, stash and clear the element's
    /// content, and detach it. Returns whether anything changed.
    pub fn unmount<H>(&mut self, host: &mut H, floor: f64) -> Result<bool, DomError>
    where
        H: DocumentHost<Node = N>,
    {
        if !self.mounted || !host.is_connected(&self.element) {
            return Ok(false);
        }
        self.height = measured_height(host, &self.element, floor);
        set_height_px(host, &self.placeholder, self.height);
        if self.cached_markup.is_none() {
            self.cached_markup = Some(host.inner_markup(&self.element));
        }
        host.set_inner_markup(&self.element, "")?;
        host.remove(&self.element);
        self.mounted = false;
        Ok(true)
    }

    /// Re-read a mounted element's height. Returns whether it changed.
    pub fn remeasure<H>(&mut self, host: &H, floor: f64) -> bool
    where
        H: DocumentHost<Node = N>,
    {
        if !self.mounted || !host.is_connected(&self.element) {
            return false;
        }
        let height = measured_height(host, &self.element, floor);
        if (height - self.height).abs() < 0.5 {
            return false;
        }
        self.height = height;
        true
    }

    /// The item's slot, offset into container content coordinates by
    /// `content_offset`. `None` while the placeholder is detached.
    pub fn slot<H>(&self, host: &H, content_offset: f64) -> Option<Slot>
    where
        H: DocumentHost<Node = N>,
    {
        if !host.is_connected(&self.placeholder) {
            return None;
        }
        let bottom = host.bounding_rect(&self.placeholder).bottom() + content_offset;
        Some(Slot {
            top: bottom - self.height,
            bottom,
        })
    }

    /// Mount the element for good and drop the placeholder.
    pub fn release<H>(&mut self, host: &mut H) -> Result<(), DomError>
    where
        H: DocumentHost<Node = N>,
    {
        let mounted = self.mount(host);
        host.remove(&self.placeholder);
        mounted.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{HeadlessDocument, NodeId};
    use pretty_assertions::assert_eq;

    const MARKUP: &str = concat!(
        r#"<main><div id="list" style="height: 400px; overflow-y: auto">"#,
        r#"<div id="t1" data-message-author-role="user"><p style="height: 120px">q</p></div>"#,
        r#"<div id="t2" data-testid="Assistant-Turn"><p>tiny</p></div>"#,
        "</div></main>"
    );

    fn setup() -> (HeadlessDocument, NodeId, NodeId, VirtualizerConfig) {
        let doc = HeadlessDocument::from_body_markup(600.0, MARKUP).unwrap();
        let t1 = doc.element_by_id("t1").unwrap();
        let t2 = doc.element_by_id("t2").unwrap();
        (doc, t1, t2, VirtualizerConfig::default())
    }

    #[test]
    fn capture_measures_then_replaces_element() {
        let (mut doc, t1, t2, cfg) = setup();
        let list = doc.element_by_id("list").unwrap();
        let before = doc.scroll_height(&list);
        let a = TrackedItem::capture(&mut doc, t1, &cfg).unwrap();
        let b = TrackedItem::capture(&mut doc, t2, &cfg).unwrap();

        assert_eq!(a.height, 120.0);
        assert_eq!(b.height, 56.0);
        assert!(!a.assistant);
        assert!(b.assistant);
        assert_eq!(a.scroll_container, list);
        assert_eq!(a.anchor, Some(t2));
        assert!(!doc.is_connected(&t1));
        assert_eq!(
            doc.attribute(&a.placeholder, "data-nv-ph").as_deref(),
            Some("1")
        );
        // t2 was 20px of text; its placeholder is floored.
        assert_eq!(doc.bounding_rect(&a.placeholder).height, 120.0);
        assert_eq!(doc.bounding_rect(&b.placeholder).height, 56.0);
        assert_eq!(doc.scroll_height(&list), before);
    }

    #[test]
    fn mount_and_unmount_are_idempotent() {
        let (mut doc, t1, _, cfg) = setup();
        let mut item = TrackedItem::capture(&mut doc, t1, &cfg).unwrap();
        assert!(!item.unmount(&mut doc, cfg.min_height_px).unwrap());

        assert!(item.mount(&mut doc).unwrap());
        let snapshot = doc.body_markup();
        assert!(!item.mount(&mut doc).unwrap());
        assert_eq!(doc.body_markup(), snapshot);
        assert_eq!(doc.bounding_rect(&item.placeholder).height, 0.0);

        assert!(item.unmount(&mut doc, cfg.min_height_px).unwrap());
        assert_eq!(item.cached_markup.as_deref(), Some(r#"<p style="height: 120px">q</p>"#));
        assert_eq!(doc.inner_markup(&t1), "");
        let snapshot = doc.body_markup();
        assert!(!item.unmount(&mut doc, cfg.min_height_px).unwrap());
        assert_eq!(doc.body_markup(), snapshot);
    }

    #[test]
    fn mount_restores_cached_markup() {
        let (mut doc, t1, _, cfg) = setup();
        let mut item = TrackedItem::capture(&mut doc, t1, &cfg).unwrap();
        item.mount(&mut doc).unwrap();
        item.unmount(&mut doc, cfg.min_height_px).unwrap();
        item.mount(&mut doc).unwrap();
        assert_eq!(doc.inner_markup(&t1), r#"<p style="height: 120px">q</p>"#);
        assert_eq!(item.cached_markup, None);
        assert_eq!(doc.bounding_rect(&t1).height, 120.0);
    }

    #[test]
    fn slot_is_stable_across_mount_states() {
        let (mut doc, t1, t2, cfg) = setup();
        let mut first = TrackedItem::capture(&mut doc, t1, &cfg).unwrap();
        let second = TrackedItem::capture(&mut doc, t2, &cfg).unwrap();
        assert_eq!(second.slot(&doc, 0.0).unwrap(), Slot { top: 120.0, bottom: 176.0 });

        let unmounted = first.slot(&doc, 0.0).unwrap();
        assert_eq!(unmounted, Slot { top: 0.0, bottom: 120.0 });
        first.mount(&mut doc).unwrap();
        assert!(!first.remeasure(&doc, cfg.min_height_px));
        assert_eq!(first.slot(&doc, 0.0).unwrap(), unmounted);
        assert_eq!(first.slot(&doc, 30.0).unwrap().top, 30.0);
    }

    #[test]
    fn detached_placeholder_skips_mount() {
        let (mut doc, t1, _, cfg) = setup();
        let mut item = TrackedItem::capture(&mut doc, t1, &cfg).unwrap();
        doc.remove(&item.placeholder);
        assert!(!item.mount(&mut doc).unwrap());
        assert_eq!(item.slot(&doc, 0.0), None);
    }

    #[test]
    fn release_restores_original_shape() {
        let (mut doc, t1, t2, cfg) = setup();
        let original = doc.body_markup();
        let mut a = TrackedItem::capture(&mut doc, t1, &cfg).unwrap();
        let mut b = TrackedItem::capture(&mut doc, t2, &cfg).unwrap();
        a.mount(&mut doc).unwrap();
        a.unmount(&mut doc, cfg.min_height_px).unwrap();
        a.release(&mut doc).unwrap();
        b.release(&mut doc).unwrap();
        assert_eq!(doc.body_markup(), original);
    }

    #[test]
    fn role_attribute_takes_precedence_over_test_id() {
        let doc = HeadlessDocument::from_body_markup(
            100.0,
            r#"<div id="u" data-message-author-role="user" data-testid="assistant-x"></div><div id="e" data-message-author-role="" data-testid="x-ASSISTANT"></div>"#,
        )
        .unwrap();
        assert!(!is_assistant(&doc, &doc.element_by_id("u").unwrap()));
        assert!(is_assistant(&doc, &doc.element_by_id("e").unwrap()));
    }
}
