#![forbid(unsafe_code)]

//! Navigation and loading overlay.
//!
//! A spinner pill pinned to the top of the viewport and a notice toast pinned
//! to the bottom. Both are created lazily under the document element and only
//! toggled afterwards.
//!
//! The spinner shows:
//!
//! - on client-side navigation, until `navigation_frames` animation frames
//!   have passed;
//! - while the page unloads (the host calls [`LoadingOverlay::show`]);
//! - when requests stay in flight past `request_debounce_ms`. It hides as
//!   soon as the in-flight count returns to zero.
//!
//! A notice replaces the toast text and restarts its `notice_ms` timer.

use crate::config::OverlayConfig;
use crate::dom::{DocumentHost, DomError};
use crate::scheduler::TaskQueue;

const SPINNER_MARKUP: &str = concat!(
    "<style>@keyframes chatvirt-rotate{to{transform:rotate(360deg)}}",
    ".chatvirt-arc{transform-origin:9px 9px;animation:chatvirt-rotate 1s linear infinite}",
    "@media (prefers-reduced-motion:reduce){.chatvirt-arc{animation:none}}</style>",
    r#"<svg width="28" height="28" viewBox="0 0 18 18" role="img" aria-label="Loading">"#,
    r#"<circle cx="9" cy="9" r="7" fill="none" stroke="currentColor" stroke-width="2" opacity=".15"/>"#,
    r#"<path class="chatvirt-arc" d="M9 2 a7 7 0 0 1 0 14" fill="none" stroke="currentColor" stroke-width="2" stroke-linecap="round"/>"#,
    "</svg><span>Loading\u{2026}</span>",
);

const SPINNER_STYLE: &[(&str, &str)] = &[
    ("position", "fixed"),
    ("top", "24px"),
    ("left", "50%"),
    ("transform", "translateX(-50%)"),
    ("padding", ".55rem .8rem"),
    ("border-radius", "999px"),
    ("background", "color-mix(in oklab, Canvas, CanvasText 6%)"),
    ("color", "CanvasText"),
    ("box-shadow", "0 6px 24px rgba(0,0,0,.18)"),
    ("align-items", "center"),
    ("gap", ".5rem"),
    ("font", "600 13px system-ui, sans-serif"),
    ("z-index", "2147483647"),
];

const NOTICE_STYLE: &[(&str, &str)] = &[
    ("position", "fixed"),
    ("left", "50%"),
    ("bottom", "16px"),
    ("transform", "translateX(-50%)"),
    ("padding", "10px 14px"),
    ("border-radius", "999px"),
    ("font", "600 13px system-ui, sans-serif"),
    ("background", "color-mix(in oklab, Canvas, CanvasText 10%)"),
    ("color", "CanvasText"),
    ("box-shadow", "0 8px 24px rgba(0,0,0,.20)"),
    ("z-index", "2147483647"),
    ("pointer-events", "none"),
    ("max-width", "80vw"),
    ("white-space", "nowrap"),
    ("overflow", "hidden"),
    ("text-overflow", "ellipsis"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    /// Debounced request check.
    RevealIfBusy,
    /// Frames left before a navigation spinner hides.
    NavigationFrame(u32),
    /// Hide the notice unless a newer one replaced it.
    HideNotice(u64),
}

/// Spinner and notice state for one document.
#[derive(Debug)]
pub struct LoadingOverlay<N> {
    config: OverlayConfig,
    queue: TaskQueue<Task>,
    spinner: Option<N>,
    toast: Option<N>,
    spinner_visible: bool,
    notice: Option<String>,
    notice_generation: u64,
    in_flight: usize,
    debounce_armed: bool,
}

impl<N: Clone + PartialEq + std::fmt::Debug> LoadingOverlay<N> {
    #[must_use]
    pub fn new(config: OverlayConfig) -> Self {
        Self {
            config,
            queue: TaskQueue::new(),
            spinner: None,
            toast: None,
            spinner_visible: false,
            notice: None,
            notice_generation: 0,
            in_flight: 0,
            debounce_armed: false,
        }
    }

    #[must_use]
    pub fn is_spinner_visible(&self) -> bool {
        self.spinner_visible
    }

    /// Text of the notice on screen, if any.
    #[must_use]
    pub fn notice(&self) -> Option<&str> {
        self.notice.as_deref()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn show<H>(&mut self, host: &mut H)
    where
        H: DocumentHost<Node = N>,
    {
        if !self.config.enabled {
            return;
        }
        match self.ensure_spinner(host) {
            Ok(node) => {
                host.set_style(&node, "display", "inline-flex");
                self.spinner_visible = true;
            }
            Err(err) => tracing::debug!(%err, "loading spinner unavailable"),
        }
    }

    pub fn hide<H>(&mut self, host: &mut H)
    where
        H: DocumentHost<Node = N>,
    {
        if let Some(node) = &self.spinner {
            host.set_style(node, "display", "none");
        }
        self.spinner_visible = false;
    }

    /// History push/replace or `popstate`.
    pub fn on_navigation<H>(&mut self, host: &mut H)
    where
        H: DocumentHost<Node = N>,
    {
        if !self.config.enabled {
            return;
        }
        self.show(host);
        self.queue
            .schedule_frame(Task::NavigationFrame(self.config.navigation_frames));
    }

    pub fn request_started(&mut self, now_ms: u64) {
        if !self.config.enabled {
            return;
        }
        self.in_flight += 1;
        if !self.debounce_armed {
            self.debounce_armed = true;
            self.queue
                .schedule_after(now_ms, self.config.request_debounce_ms, Task::RevealIfBusy);
        }
    }

    pub fn request_finished<H>(&mut self, host: &mut H)
    where
        H: DocumentHost<Node = N>,
    {
        if !self.config.enabled {
            return;
        }
        self.in_flight = self.in_flight.saturating_sub(1);
        if self.in_flight == 0 {
            self.hide(host);
        }
    }

    /// Show `text` in the toast for `notice_ms`.
    pub fn show_notice<H>(&mut self, host: &mut H, text: &str, now_ms: u64)
    where
        H: DocumentHost<Node = N>,
    {
        if !self.config.enabled {
            return;
        }
        let node = match self.ensure_toast(host) {
            Ok(node) => node,
            Err(err) => {
                tracing::debug!(%err, "notice toast unavailable");
                return;
            }
        };
        if let Err(err) = host.set_inner_markup(&node, &escape_text(text)) {
            tracing::debug!(%err, "notice text rejected");
            return;
        }
        host.set_style(&node, "display", "inline-block");
        tracing::info!(notice = text, "notice shown");
        self.notice = Some(text.to_owned());
        self.notice_generation += 1;
        self.queue.schedule_after(
            now_ms,
            self.config.notice_ms,
            Task::HideNotice(self.notice_generation),
        );
    }

    pub fn run_due<H>(&mut self, host: &mut H, now_ms: u64)
    where
        H: DocumentHost<Node = N>,
    {
        while let Some(task) = self.queue.pop_due(now_ms) {
            match task {
                Task::RevealIfBusy => {
                    self.debounce_armed = false;
                    if self.in_flight > 0 {
                        self.show(host);
                    }
                }
                Task::HideNotice(generation) if generation == self.notice_generation => {
                    if let Some(node) = &self.toast {
                        host.set_style(node, "display", "none");
                    }
                    self.notice = None;
                }
                Task::HideNotice(_) | Task::NavigationFrame(_) => {}
            }
        }
    }

    pub fn run_frame<H>(&mut self, host: &mut H)
    where
        H: DocumentHost<Node = N>,
    {
        for task in self.queue.take_frame() {
            if let Task::NavigationFrame(left) = task {
                if left <= 1 {
                    self.hide(host);
                } else {
                    self.queue.schedule_frame(Task::NavigationFrame(left - 1));
                }
            }
        }
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.next_deadline()
    }

    #[must_use]
    pub fn wants_frame(&self) -> bool {
        self.queue.wants_frame()
    }

    /// Remove both nodes and drop pending work.
    pub fn teardown<H>(&mut self, host: &mut H)
    where
        H: DocumentHost<Node = N>,
    {
        self.queue.clear();
        for node in [self.spinner.take(), self.toast.take()].into_iter().flatten() {
            host.remove(&node);
        }
        self.spinner_visible = false;
        self.notice = None;
        self.in_flight = 0;
        self.debounce_armed = false;
    }

    fn ensure_spinner<H>(&mut self, host: &mut H) -> Result<N, DomError>
    where
        H: DocumentHost<Node = N>,
    {
        if let Some(node) = &self.spinner
            && host.is_connected(node)
        {
            return Ok(node.clone());
        }
        let node = host.create_element("div")?;
        host.set_attribute(&node, "id", &self.config.spinner_id);
        host.set_attribute(&node, "aria-busy", "true");
        host.set_attribute(&node, "aria-live", "polite");
        for (property, value) in SPINNER_STYLE {
            host.set_style(&node, property, value);
        }
        host.set_inner_markup(&node, SPINNER_MARKUP)?;
        let root = host.document_element();
        host.insert_before(&root, &node, None)?;
        self.spinner = Some(node.clone());
        Ok(node)
    }

    fn ensure_toast<H>(&mut self, host: &mut H) -> Result<N, DomError>
    where
        H: DocumentHost<Node = N>,
    {
        if let Some(node) = &self.toast
            && host.is_connected(node)
        {
            return Ok(node.clone());
        }
        let node = host.create_element("div")?;
        host.set_attribute(&node, "id", &self.config.notice_id);
        host.set_attribute(&node, "role", "status");
        for (property, value) in NOTICE_STYLE {
            host.set_style(&node, property, value);
        }
        host.set_style(&node, "display", "none");
        let root = host.document_element();
        host.insert_before(&root, &node, None)?;
        self.toast = Some(node.clone());
        Ok(node)
    }
}

fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{HeadlessDocument, NodeId};
    use pretty_assertions::assert_eq;

    fn overlay() -> (HeadlessDocument, LoadingOverlay<NodeId>) {
        let doc = HeadlessDocument::from_body_markup(600.0, "<main><p>chat</p></main>").unwrap();
        (doc, LoadingOverlay::new(OverlayConfig::default()))
    }

    fn display(doc: &HeadlessDocument, id: &str) -> Option<String> {
        let node = doc.element_by_id(id)?;
        let style = doc.attribute(&node, "style")?;
        style.split(';').find_map(|decl| {
            let (k, v) = decl.split_once(':')?;
            (k.trim() == "display").then(|| v.trim().to_owned())
        })
    }

    #[test]
    fn navigation_shows_the_spinner_for_two_frames() {
        let (mut doc, mut overlay) = overlay();
        let body = doc.body_markup();
        overlay.on_navigation(&mut doc);
        assert!(overlay.is_spinner_visible());
        assert_eq!(display(&doc, "chatvirt-loader").as_deref(), Some("inline-flex"));
        assert_eq!(doc.body_markup(), body);

        assert!(overlay.wants_frame());
        overlay.run_frame(&mut doc);
        assert!(overlay.is_spinner_visible());
        overlay.run_frame(&mut doc);
        assert!(!overlay.is_spinner_visible());
        assert!(!overlay.wants_frame());
        assert_eq!(display(&doc, "chatvirt-loader").as_deref(), Some("none"));
    }

    #[test]
    fn spinner_node_is_created_once() {
        let (mut doc, mut overlay) = overlay();
        overlay.show(&mut doc);
        overlay.hide(&mut doc);
        overlay.show(&mut doc);
        assert_eq!(doc.query_all(r#"[id="chatvirt-loader"]"#).unwrap().len(), 1);
        assert_eq!(doc.query_all(r#"[id="chatvirt-loader"] svg"#).unwrap().len(), 1);
    }

    #[test]
    fn short_requests_never_show_the_spinner() {
        let (mut doc, mut overlay) = overlay();
        overlay.request_started(0);
        overlay.request_started(10);
        assert_eq!(overlay.next_deadline(), Some(120));
        overlay.request_finished(&mut doc);
        overlay.request_finished(&mut doc);
        overlay.run_due(&mut doc, 120);
        assert!(!overlay.is_spinner_visible());
        assert_eq!(overlay.in_flight(), 0);
    }

    #[test]
    fn slow_requests_show_the_spinner_until_the_last_finishes() {
        let (mut doc, mut overlay) = overlay();
        overlay.request_started(0);
        overlay.request_started(50);
        overlay.run_due(&mut doc, 119);
        assert!(!overlay.is_spinner_visible());
        overlay.run_due(&mut doc, 120);
        assert!(overlay.is_spinner_visible());

        overlay.request_finished(&mut doc);
        assert!(overlay.is_spinner_visible());
        overlay.request_finished(&mut doc);
        overlay.request_finished(&mut doc);
        assert!(!overlay.is_spinner_visible());
        assert_eq!(overlay.in_flight(), 0);
    }

    #[test]
    fn newer_notice_restarts_the_timer() {
        let (mut doc, mut overlay) = overlay();
        overlay.show_notice(&mut doc, "Saved <settings>", 0);
        assert_eq!(overlay.notice(), Some("Saved <settings>"));
        assert_eq!(display(&doc, "chatvirt-notice").as_deref(), Some("inline-block"));
        let toast = doc.element_by_id("chatvirt-notice").unwrap();
        assert_eq!(doc.inner_markup(&toast), "Saved &lt;settings&gt;");

        overlay.show_notice(&mut doc, "Downloaded", 2000);
        overlay.run_due(&mut doc, 3000);
        assert_eq!(overlay.notice(), Some("Downloaded"));
        overlay.run_due(&mut doc, 5000);
        assert_eq!(overlay.notice(), None);
        assert_eq!(display(&doc, "chatvirt-notice").as_deref(), Some("none"));
    }

    #[test]
    fn disabled_overlay_touches_nothing() {
        let (mut doc, _) = overlay();
        let mut overlay = LoadingOverlay::new(OverlayConfig {
            enabled: false,
            ..OverlayConfig::default()
        });
        overlay.on_navigation(&mut doc);
        overlay.request_started(0);
        overlay.show_notice(&mut doc, "hi", 0);
        assert!(!overlay.is_spinner_visible());
        assert!(doc.element_by_id("chatvirt-loader").is_none());
        assert!(doc.element_by_id("chatvirt-notice").is_none());
        assert_eq!(overlay.next_deadline(), None);
    }

    #[test]
    fn teardown_removes_both_nodes() {
        let (mut doc, mut overlay) = overlay();
        overlay.show(&mut doc);
        overlay.show_notice(&mut doc, "hi", 0);
        overlay.teardown(&mut doc);
        assert!(doc.element_by_id("chatvirt-loader").is_none());
        assert!(doc.element_by_id("chatvirt-notice").is_none());
        assert_eq!(overlay.next_deadline(), None);
    }
}
