#![forbid(unsafe_code)]

//! Page runtime: one discovery loader, one controller, one loading overlay.
//!
//! [`Page`] is the single entry point a host drives. It routes observer
//! notifications to their owner, re-runs discovery on navigation and
//! (re)installs the controller whenever discovery resolves. Navigation and
//! request activity also drive the [`LoadingOverlay`].
//!
//! The controller re-initializes when discovery publishes a selector that
//! differs from the one it was installed with; the shared selector cell
//! signals the change.

use crate::config::ChatvirtConfig;
use crate::controller::{InstallOutcome, Virtualizer, VirtualizerStats};
use crate::diagnostics::PassRecord;
use crate::discovery::{DiscoveryStep, SelectorDiscovery};
use crate::dom::{DocumentHost, DomError, HostEvent, Observer};
use crate::overlay::LoadingOverlay;
use crate::shared::{SelectorSubscription, SharedSelector};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

/// Loader and controller for one hosted document.
pub struct Page<N> {
    selector: SharedSelector,
    discovery: SelectorDiscovery<N>,
    virtualizer: Virtualizer<N>,
    overlay: LoadingOverlay<N>,
    selector_changed: Rc<Cell<bool>>,
    _selector_watch: SelectorSubscription,
    /// Set by an explicit `disable()`; discovery stops reinstalling.
    suspended: bool,
}

impl<N: fmt::Debug> fmt::Debug for Page<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("selector", &self.selector)
            .field("discovery", &self.discovery)
            .field("virtualizer", &self.virtualizer)
            .field("overlay", &self.overlay)
            .field("suspended", &self.suspended)
            .finish_non_exhaustive()
    }
}

impl<N: Clone + PartialEq + fmt::Debug> Page<N> {
    #[must_use]
    pub fn new(config: ChatvirtConfig) -> Self {
        Self::with_selector(config, SharedSelector::default())
    }

    /// Build around an existing selector cell, e.g. one seeded by the host.
    #[must_use]
    pub fn with_selector(config: ChatvirtConfig, selector: SharedSelector) -> Self {
        let selector_changed = Rc::new(Cell::new(false));
        let flag = Rc::clone(&selector_changed);
        let watch = selector.subscribe(move |_| flag.set(true));
        Self {
            discovery: SelectorDiscovery::new(config.discovery, selector.clone()),
            virtualizer: Virtualizer::new(config.virtualizer, selector.clone()),
            overlay: LoadingOverlay::new(config.overlay),
            selector,
            selector_changed,
            _selector_watch: watch,
            suspended: false,
        }
    }

    #[must_use]
    pub fn selector(&self) -> &SharedSelector {
        &self.selector
    }

    #[must_use]
    pub fn discovery(&self) -> &SelectorDiscovery<N> {
        &self.discovery
    }

    #[must_use]
    pub fn virtualizer(&self) -> &Virtualizer<N> {
        &self.virtualizer
    }

    #[must_use]
    pub fn overlay(&self) -> &LoadingOverlay<N> {
        &self.overlay
    }

    /// Run discovery once the document is ready.
    pub fn start<H>(&mut self, host: &mut H, now_ms: u64) -> Option<InstallOutcome>
    where
        H: DocumentHost<Node = N>,
    {
        tracing::info!("loader active");
        match self.discovery.run(host) {
            DiscoveryStep::Ready(_) => self.install_resolved(host, now_ms),
            DiscoveryStep::Waiting => None,
        }
    }

    /// Deliver one host notification to its subscriber.
    pub fn dispatch<H>(&mut self, host: &mut H, owner: Observer, event: HostEvent<N>, now_ms: u64)
    where
        H: DocumentHost<Node = N>,
    {
        match (owner, event) {
            (Observer::Loader, HostEvent::NodesAdded(_)) => {
                if self.discovery.on_nodes_added(host).is_some() {
                    self.install_resolved(host, now_ms);
                }
            }
            (Observer::Loader, _) => {}
            (Observer::Controller, event) => self.virtualizer.handle_event(host, event, now_ms),
        }
    }

    /// History push/replace or `popstate`.
    pub fn on_navigation<H>(&mut self, host: &mut H, now_ms: u64)
    where
        H: DocumentHost<Node = N>,
    {
        self.discovery.on_navigation(now_ms);
        self.overlay.on_navigation(host);
    }

    pub fn run_due_timers<H>(&mut self, host: &mut H, now_ms: u64)
    where
        H: DocumentHost<Node = N>,
    {
        if let Some(DiscoveryStep::Ready(_)) = self.discovery.run_due(host, now_ms) {
            self.install_resolved(host, now_ms);
        }
        self.virtualizer.run_due_timers(host, now_ms);
        self.overlay.run_due(host, now_ms);
    }

    pub fn run_frame<H>(&mut self, host: &mut H, now_ms: u64)
    where
        H: DocumentHost<Node = N>,
    {
        self.virtualizer.run_frame(host, now_ms);
        self.overlay.run_frame(host);
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        [
            self.discovery.next_deadline(),
            self.virtualizer.next_deadline(),
            self.overlay.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    #[must_use]
    pub fn wants_frame(&self) -> bool {
        self.virtualizer.wants_frame() || self.overlay.wants_frame()
    }

    // -- host API -----------------------------------------------------------

    pub fn install<H>(&mut self, host: &mut H, now_ms: u64) -> Result<InstallOutcome, DomError>
    where
        H: DocumentHost<Node = N>,
    {
        self.suspended = false;
        self.virtualizer.install(host, now_ms)
    }

    pub fn enable<H>(&mut self, host: &mut H, now_ms: u64) -> Result<InstallOutcome, DomError>
    where
        H: DocumentHost<Node = N>,
    {
        self.suspended = false;
        self.virtualizer.enable(host, now_ms)
    }

    pub fn disable<H>(&mut self, host: &mut H) -> bool
    where
        H: DocumentHost<Node = N>,
    {
        self.suspended = true;
        self.virtualizer.disable(host)
    }

    pub fn refresh<H>(&mut self, host: &mut H, now_ms: u64) -> bool
    where
        H: DocumentHost<Node = N>,
    {
        self.virtualizer.refresh(host, now_ms)
    }

    /// Show the spinner until [`Page::hide_loading`] (page unload).
    pub fn show_loading<H>(&mut self, host: &mut H)
    where
        H: DocumentHost<Node = N>,
    {
        self.overlay.show(host);
    }

    pub fn hide_loading<H>(&mut self, host: &mut H)
    where
        H: DocumentHost<Node = N>,
    {
        self.overlay.hide(host);
    }

    /// A page request went out.
    pub fn request_started(&mut self, now_ms: u64) {
        self.overlay.request_started(now_ms);
    }

    /// A page request settled, successfully or not.
    pub fn request_finished<H>(&mut self, host: &mut H)
    where
        H: DocumentHost<Node = N>,
    {
        self.overlay.request_finished(host);
    }

    pub fn notice<H>(&mut self, host: &mut H, text: &str, now_ms: u64)
    where
        H: DocumentHost<Node = N>,
    {
        self.overlay.show_notice(host, text, now_ms);
    }

    #[must_use]
    pub fn stats(&self) -> VirtualizerStats {
        self.virtualizer.stats()
    }

    pub fn drain_pass_log(&mut self) -> Vec<PassRecord> {
        self.virtualizer.drain_pass_log()
    }

    pub fn drain_pass_jsonl(&mut self, run_id: &str) -> Vec<String> {
        self.virtualizer.drain_pass_jsonl(run_id)
    }

    /// Stop observing entirely and restore the document.
    pub fn shutdown<H>(&mut self, host: &mut H)
    where
        H: DocumentHost<Node = N>,
    {
        self.discovery.stop(host);
        self.virtualizer.disable(host);
        self.overlay.teardown(host);
    }

    fn install_resolved<H>(&mut self, host: &mut H, now_ms: u64) -> Option<InstallOutcome>
    where
        H: DocumentHost<Node = N>,
    {
        let changed = self.selector_changed.replace(false);
        if self.suspended {
            tracing::debug!("virtualizer disabled by host; not reinstalling");
            return None;
        }
        if self.virtualizer.is_installed() {
            let current = self.selector.get();
            if !changed || self.virtualizer.installed_selector() == current.as_deref() {
                return Some(InstallOutcome::AlreadyInstalled);
            }
            tracing::info!(
                from = ?self.virtualizer.installed_selector(),
                to = ?current,
                "turn selector changed; reinstalling"
            );
            self.virtualizer.disable(host);
        }
        match self.virtualizer.install(host, now_ms) {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                tracing::warn!(%err, "install failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessDocument;

    #[test]
    fn start_installs_when_turns_exist() {
        let mut doc = HeadlessDocument::from_body_markup(
            600.0,
            r#"<main><div data-message-author-role="user">a</div><div data-message-author-role="assistant">b</div></main>"#,
        )
        .unwrap();
        let mut page = Page::new(ChatvirtConfig::default());
        assert_eq!(
            page.start(&mut doc, 0),
            Some(InstallOutcome::Installed { tracked: 2 })
        );
        assert_eq!(
            page.selector().get().as_deref(),
            Some("[data-message-author-role]")
        );
    }

    #[test]
    fn selector_change_reinstalls_the_controller() {
        let mut doc = HeadlessDocument::from_body_markup(
            600.0,
            r#"<main><div data-message-author-role="user">a</div><div data-message-author-role="user">b</div><p data-message-id="1">c</p><p data-message-id="2">d</p></main>"#,
        )
        .unwrap();
        let mut page = Page::new(ChatvirtConfig::default());
        page.start(&mut doc, 0);
        assert_eq!(page.stats().total, 2);

        // The host seeds a different selector; the next route re-validates it.
        page.selector().set(Some("main [data-message-id]".into()));
        page.on_navigation(&mut doc, 10);
        page.run_due_timers(&mut doc, 10);
        assert_eq!(
            page.virtualizer().installed_selector(),
            Some("main [data-message-id]")
        );
        assert_eq!(page.stats().total, 2);
        assert_eq!(doc.query_all("[data-message-author-role]").unwrap().len(), 2);
        assert!(doc.query_all("[data-nv-ph]").unwrap().len() == 2);
    }

    #[test]
    fn explicit_disable_survives_navigation() {
        let mut doc = HeadlessDocument::from_body_markup(
            600.0,
            r#"<div data-message-author-role="user">a</div><div data-message-author-role="user">b</div>"#,
        )
        .unwrap();
        let mut page = Page::new(ChatvirtConfig::default());
        page.start(&mut doc, 0);
        assert!(page.disable(&mut doc));
        page.on_navigation(&mut doc, 5);
        page.run_due_timers(&mut doc, 5);
        assert!(!page.virtualizer().is_installed());
        assert_eq!(
            page.enable(&mut doc, 6).unwrap(),
            InstallOutcome::Installed { tracked: 2 }
        );
    }

    #[test]
    fn navigation_spins_without_disturbing_the_turns() {
        let mut doc = HeadlessDocument::from_body_markup(
            600.0,
            r#"<div data-message-author-role="user">a</div><div data-message-author-role="user">b</div>"#,
        )
        .unwrap();
        let mut page = Page::new(ChatvirtConfig::default());
        page.start(&mut doc, 0);
        page.on_navigation(&mut doc, 20);
        assert!(page.overlay().is_spinner_visible());
        assert!(page.wants_frame());

        for (owner, event) in doc.take_events() {
            page.dispatch(&mut doc, owner, event, 20);
        }
        page.run_due_timers(&mut doc, 20);
        page.run_frame(&mut doc, 32);
        page.run_frame(&mut doc, 48);
        assert!(!page.overlay().is_spinner_visible());
        assert!(page.virtualizer().is_installed());
        assert_eq!(page.stats().total, 2);

        page.shutdown(&mut doc);
        assert!(doc.element_by_id("chatvirt-loader").is_none());
    }
}
