#![forbid(unsafe_code)]

//! Deterministic session driver for tests and benches.
//!
//! [`HeadlessSession`] couples a [`HeadlessDocument`] with a [`Page`] and a
//! virtual clock. [`settle`](HeadlessSession::settle) plays the browser's
//! part: it delivers recorded notifications, fires timers in due order, and
//! runs animation frames on a fixed cadence until nothing is pending.
//!
//! ```
//! use chatvirt_core::config::ChatvirtConfig;
//! use chatvirt_core::harness::HeadlessSession;
//!
//! let markup = r#"<div data-message-author-role="user">hi</div><div data-message-author-role="assistant">hello</div>"#;
//! let mut session = HeadlessSession::new(ChatvirtConfig::default(), 600.0, markup).unwrap();
//! session.start();
//! assert!(session.settle());
//! assert_eq!(session.page.stats().total, 2);
//! ```

use crate::config::ChatvirtConfig;
use crate::controller::InstallOutcome;
use crate::dom::{DocumentHost, DomError};
use crate::headless::{HeadlessDocument, NodeId};
use crate::page::Page;

/// Animation frame period.
pub const FRAME_MS: u64 = 16;

const SETTLE_STEP_BUDGET: usize = 100_000;

/// A headless document, page runtime, and virtual clock.
#[derive(Debug)]
pub struct HeadlessSession {
    pub doc: HeadlessDocument,
    pub page: Page<NodeId>,
    pub now_ms: u64,
}

impl HeadlessSession {
    pub fn new(config: ChatvirtConfig, viewport_height: f64, markup: &str) -> Result<Self, DomError> {
        Ok(Self::from_document(
            config,
            HeadlessDocument::from_body_markup(viewport_height, markup)?,
        ))
    }

    #[must_use]
    pub fn from_document(config: ChatvirtConfig, doc: HeadlessDocument) -> Self {
        Self {
            doc,
            page: Page::new(config),
            now_ms: 0,
        }
    }

    pub fn start(&mut self) -> Option<InstallOutcome> {
        self.page.start(&mut self.doc, self.now_ms)
    }

    /// Run until no notification, timer, or frame is pending. Returns false
    /// if the step budget ran out first.
    #[must_use]
    pub fn settle(&mut self) -> bool {
        for _ in 0..SETTLE_STEP_BUDGET {
            if self.step() {
                continue;
            }
            return true;
        }
        false
    }

    /// Perform one unit of work. Returns whether anything ran.
    pub fn step(&mut self) -> bool {
        self.step_until(u64::MAX)
    }

    /// Advance the clock by `ms`, firing everything due on the way.
    pub fn advance(&mut self, ms: u64) {
        let until = self.now_ms.saturating_add(ms);
        for _ in 0..SETTLE_STEP_BUDGET {
            if !self.step_until(until) {
                break;
            }
        }
        self.now_ms = self.now_ms.max(until);
    }

    fn step_until(&mut self, until: u64) -> bool {
        let events = self.doc.take_events();
        if !events.is_empty() {
            for (owner, event) in events {
                self.page.dispatch(&mut self.doc, owner, event, self.now_ms);
            }
            return true;
        }
        let next_frame = (self.now_ms / FRAME_MS + 1) * FRAME_MS;
        let frame = self.page.wants_frame() && next_frame <= until;
        match self.page.next_deadline() {
            Some(due) if due <= until && (!frame || due < next_frame) => {
                self.now_ms = self.now_ms.max(due);
                self.page.run_due_timers(&mut self.doc, self.now_ms);
                true
            }
            _ if frame => {
                self.now_ms = next_frame;
                self.page.run_frame(&mut self.doc, self.now_ms);
                true
            }
            _ => false,
        }
    }

    /// The controller's scroll container, or the document scroller.
    #[must_use]
    pub fn scroller(&self) -> NodeId {
        self.page
            .virtualizer()
            .scroll_container()
            .copied()
            .unwrap_or_else(|| self.doc.scrolling_element())
    }

    /// Scroll the active container to `top`, then settle.
    #[must_use]
    pub fn scroll_to(&mut self, top: f64) -> bool {
        let scroller = self.scroller();
        self.doc.set_scroll_top(&scroller, top);
        self.settle()
    }

    /// Largest legal scroll offset of the active container.
    #[must_use]
    pub fn max_scroll_top(&self) -> f64 {
        let scroller = self.scroller();
        (self.doc.scroll_height(&scroller) - self.doc.client_height(&scroller)).max(0.0)
    }

    /// Append markup to `parent` as the host page would. The insertion is
    /// delivered on the next step.
    pub fn append(&mut self, parent: NodeId, markup: &str) -> Result<Vec<NodeId>, DomError> {
        self.doc.append_markup(parent, markup)
    }

    /// Simulate a history navigation.
    pub fn navigate(&mut self) {
        self.page.on_navigation(&mut self.doc, self.now_ms);
    }
}
