#![forbid(unsafe_code)]

//! Virtualizing controller.
//!
//! The controller takes every turn matching the installed selector, swaps it
//! for a placeholder of equal height, and from then on keeps only the turns
//! near the scroll container's viewport mounted.
//!
//! # Update passes
//!
//! A pass is a small state machine advanced by the host's timer and frame
//! callbacks:
//!
//! ```text
//! Unmount ──batch/yield──▶ Mount ──batch/yield──▶ Measure (next frame)
//!                                                    │
//!                       ┌──── replies pending ───────┤
//!                       ▼                            ▼
//!                 MountReplies ─▶ MeasureReplies ─▶ Done
//! ```
//!
//! Each batch re-reads item state through the idempotent primitives, so
//! passes started by different triggers may interleave at batch boundaries.
//!
//! # Invariants
//!
//! 1. Every tracked item is either mounted (element before a collapsed
//!    placeholder) or unmounted (placeholder alone at `height`), never both.
//! 2. Within one pass all unmounts complete before any mount.
//! 3. At most one scroll-triggered pass is queued or running.
//! 4. `disable()` leaves no placeholder, subscription, pass, or queued task.

use crate::config::VirtualizerConfig;
use crate::diagnostics::{PassLog, PassReason, PassRecord};
use crate::dom::{DocumentHost, DomError, HostEvent, Observer, Subscription, SubscriptionKind};
use crate::item::TrackedItem;
use crate::scheduler::TaskQueue;
use crate::shared::SharedSelector;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

/// Result of [`Virtualizer::install`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed { tracked: usize },
    AlreadyInstalled,
    /// Nothing matched; the controller stays uninstalled.
    NoTurns,
}

impl InstallOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Installed { .. } => "installed",
            Self::AlreadyInstalled => "already_installed",
            Self::NoTurns => "no_turns",
        }
    }
}

/// Diagnostic counters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualizerStats {
    pub total: usize,
    pub mounted: usize,
    pub total_height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Pass(u64),
    ScrollTick,
    SnapToBottom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Unmount,
    Mount,
    Measure,
    MountReplies,
    MeasureReplies,
    Done,
}

#[derive(Debug)]
struct Pass {
    id: u64,
    reason: PassReason,
    stage: Stage,
    unmount: VecDeque<usize>,
    mount: VecDeque<usize>,
    reply_queue: VecDeque<usize>,
    replies: Vec<usize>,
    follow: bool,
    window_top: f64,
    window_bottom: f64,
    unmounted: usize,
    mounted: usize,
    remeasured: usize,
}

/// The virtualizing controller over host nodes of type `N`.
pub struct Virtualizer<N> {
    config: VirtualizerConfig,
    selector: SharedSelector,
    installed: bool,
    installed_selector: Option<String>,
    items: Vec<TrackedItem<N>>,
    container: Option<N>,
    subscriptions: Vec<Subscription<N>>,
    queue: TaskQueue<Task>,
    passes: Vec<Pass>,
    next_pass_id: u64,
    ticking: bool,
    log: PassLog,
}

impl<N: fmt::Debug> fmt::Debug for Virtualizer<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Virtualizer")
            .field("installed", &self.installed)
            .field("selector", &self.installed_selector)
            .field("items", &self.items.len())
            .field("container", &self.container)
            .field("passes", &self.passes.len())
            .field("ticking", &self.ticking)
            .finish_non_exhaustive()
    }
}

impl<N: Clone + PartialEq + fmt::Debug> Virtualizer<N> {
    /// Create an uninstalled controller reading its turn selector from
    /// `selector` at install time.
    #[must_use]
    pub fn new(config: VirtualizerConfig, selector: SharedSelector) -> Self {
        Self {
            config,
            selector,
            installed: false,
            installed_selector: None,
            items: Vec::new(),
            container: None,
            subscriptions: Vec::new(),
            queue: TaskQueue::new(),
            passes: Vec::new(),
            next_pass_id: 0,
            ticking: false,
            log: PassLog::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &VirtualizerConfig {
        &self.config
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Selector the current installation tracks.
    #[must_use]
    pub fn installed_selector(&self) -> Option<&str> {
        self.installed_selector.as_deref()
    }

    #[must_use]
    pub fn items(&self) -> &[TrackedItem<N>] {
        &self.items
    }

    #[must_use]
    pub fn scroll_container(&self) -> Option<&N> {
        self.container.as_ref()
    }

    /// Track every current turn and start the initial pass.
    pub fn install<H>(&mut self, host: &mut H, now_ms: u64) -> Result<InstallOutcome, DomError>
    where
        H: DocumentHost<Node = N>,
    {
        if self.installed {
            return Ok(InstallOutcome::AlreadyInstalled);
        }
        let selector = self.selector.get_or(&self.config.default_selector);
        let mut turns: Vec<N> = Vec::new();
        for node in host.query_all(&selector)? {
            if !self.is_placeholder(host, &node) && !turns.contains(&node) {
                turns.push(node);
            }
        }

        let mut items = Vec::with_capacity(turns.len());
        for element in turns {
            match TrackedItem::capture(host, element, &self.config) {
                Ok(item) => items.push(item),
                Err(err) => tracing::debug!(%err, "skipping turn at install"),
            }
        }
        let Some(container) = dominant_container(&items) else {
            tracing::debug!(selector = %selector, "no turns to virtualize");
            return Ok(InstallOutcome::NoTurns);
        };

        let tracked = items.len();
        self.items = items;
        self.container = Some(container.clone());
        self.installed_selector = Some(selector.clone());
        self.installed = true;
        self.observe(host, container);

        tracing::info!(selector = %selector, tracked, "virtualizer installed");
        self.start_pass(host, now_ms, PassReason::Install, Vec::new(), false);
        Ok(InstallOutcome::Installed { tracked })
    }

    /// Re-install when torn down; no-op while installed.
    pub fn enable<H>(&mut self, host: &mut H, now_ms: u64) -> Result<InstallOutcome, DomError>
    where
        H: DocumentHost<Node = N>,
    {
        self.install(host, now_ms)
    }

    /// Restore every turn, drop placeholders, subscriptions and pending work.
    /// Returns whether anything was installed.
    pub fn disable<H>(&mut self, host: &mut H) -> bool
    where
        H: DocumentHost<Node = N>,
    {
        if !self.installed {
            return false;
        }
        self.queue.clear();
        self.passes.clear();
        self.ticking = false;
        for sub in self.subscriptions.drain(..) {
            host.unsubscribe(&sub);
        }
        let restored = self.items.len();
        for mut item in self.items.drain(..) {
            if let Err(err) = item.release(host) {
                tracing::debug!(%err, "turn could not be restored");
            }
        }
        self.container = None;
        self.installed_selector = None;
        self.installed = false;
        tracing::info!(restored, "virtualizer disabled");
        true
    }

    /// Queue a forced pass. Returns whether one was started.
    pub fn refresh<H>(&mut self, host: &mut H, now_ms: u64) -> bool
    where
        H: DocumentHost<Node = N>,
    {
        if !self.installed {
            return false;
        }
        self.prune_orphans(host);
        self.start_pass(host, now_ms, PassReason::Refresh, Vec::new(), false);
        true
    }

    /// Synchronous counters; no side effects.
    #[must_use]
    pub fn stats(&self) -> VirtualizerStats {
        VirtualizerStats {
            total: self.items.len(),
            mounted: self.items.iter().filter(|i| i.mounted).count(),
            total_height: self.items.iter().map(|i| i.height).sum(),
        }
    }

    /// Route a host notification addressed to the controller.
    pub fn handle_event<H>(&mut self, host: &mut H, event: HostEvent<N>, now_ms: u64)
    where
        H: DocumentHost<Node = N>,
    {
        match event {
            HostEvent::NodesAdded(nodes) => self.on_nodes_added(host, &nodes, now_ms),
            HostEvent::NodesRemoved => self.on_nodes_removed(host, now_ms),
            HostEvent::Scroll(node) => self.on_scroll(&node),
            HostEvent::Resize => self.on_resize(host, now_ms),
        }
    }

    /// Schedule a scroll pass for the next frame unless one is pending.
    pub fn on_scroll(&mut self, node: &N) {
        if !self.installed || self.container.as_ref() != Some(node) {
            return;
        }
        if self.ticking {
            tracing::trace!("scroll pass already pending");
            return;
        }
        self.ticking = true;
        self.queue.schedule_frame(Task::ScrollTick);
    }

    pub fn on_resize<H>(&mut self, host: &mut H, now_ms: u64)
    where
        H: DocumentHost<Node = N>,
    {
        if !self.installed {
            return;
        }
        self.prune_orphans(host);
        self.start_pass(host, now_ms, PassReason::Resize, Vec::new(), false);
    }

    /// Forget turns the page took away and re-window if any were dropped.
    pub fn on_nodes_removed<H>(&mut self, host: &mut H, now_ms: u64)
    where
        H: DocumentHost<Node = N>,
    {
        if self.installed {
            self.prune_and_rewindow(host, now_ms);
        }
    }

    /// Track newly inserted turns. Assistant replies are force-mounted.
    pub fn on_nodes_added<H>(&mut self, host: &mut H, nodes: &[N], now_ms: u64)
    where
        H: DocumentHost<Node = N>,
    {
        if !self.installed {
            return;
        }
        let Some(selector) = self.installed_selector.clone() else {
            return;
        };
        let Some(container) = self.container.clone() else {
            return;
        };

        let mut fresh: Vec<N> = Vec::new();
        for node in nodes {
            if !host.is_element(node) || !host.is_connected(node) {
                continue;
            }
            let mut found = Vec::new();
            match host.matches(node, &selector) {
                Ok(true) => found.push(node.clone()),
                Ok(false) => {}
                Err(err) => tracing::debug!(%err, "selector no longer evaluates"),
            }
            match host.query_within(node, &selector) {
                Ok(inner) => found.extend(inner),
                Err(err) => tracing::debug!(%err, "selector no longer evaluates"),
            }
            for el in found {
                if !fresh.contains(&el)
                    && !self.is_placeholder(host, &el)
                    && !self.items.iter().any(|i| i.element == el)
                {
                    fresh.push(el);
                }
            }
        }
        if fresh.is_empty() {
            return;
        }

        self.prune_orphans(host);
        let mut replies = Vec::new();
        for element in fresh {
            match TrackedItem::capture(host, element, &self.config) {
                Ok(item) => {
                    if item.scroll_container != container {
                        tracing::debug!(
                            item = ?item.scroll_container,
                            "new turn sits outside the primary scroll container"
                        );
                    }
                    if item.assistant {
                        replies.push(self.items.len());
                    }
                    self.items.push(item);
                }
                Err(err) => tracing::debug!(%err, "skipping new turn"),
            }
        }

        if replies.is_empty() {
            self.start_pass(host, now_ms, PassReason::Ingest, Vec::new(), false);
        } else {
            let follow = self.near_bottom(host, &container);
            tracing::debug!(replies = replies.len(), follow, "new assistant replies");
            self.start_pass(host, now_ms, PassReason::Reply, replies, follow);
        }
    }

    /// Run timers due at `now_ms`.
    pub fn run_due_timers<H>(&mut self, host: &mut H, now_ms: u64)
    where
        H: DocumentHost<Node = N>,
    {
        while let Some(task) = self.queue.pop_due(now_ms) {
            self.run_task(host, now_ms, task);
        }
    }

    /// Run the tasks waiting for an animation frame.
    pub fn run_frame<H>(&mut self, host: &mut H, now_ms: u64)
    where
        H: DocumentHost<Node = N>,
    {
        for task in self.queue.take_frame() {
            self.run_task(host, now_ms, task);
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

    /// No pass in flight and nothing queued.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.passes.is_empty() && self.queue.is_idle()
    }

    #[must_use]
    pub fn last_pass(&self) -> Option<&PassRecord> {
        self.log.last()
    }

    pub fn drain_pass_log(&mut self) -> Vec<PassRecord> {
        self.log.drain()
    }

    pub fn drain_pass_jsonl(&mut self, run_id: &str) -> Vec<String> {
        self.log.drain_jsonl(run_id)
    }

    // -- internals ----------------------------------------------------------

    fn is_placeholder<H>(&self, host: &H, node: &N) -> bool
    where
        H: DocumentHost<Node = N>,
    {
        host.attribute(node, &self.config.placeholder_attr).is_some()
    }

    fn observe<H>(&mut self, host: &mut H, container: N)
    where
        H: DocumentHost<Node = N>,
    {
        let wanted = [
            SubscriptionKind::Scroll(container.clone()),
            SubscriptionKind::ElementResize(container),
            SubscriptionKind::Mutations,
        ];
        for kind in wanted {
            let sub = Subscription::new(Observer::Controller, kind);
            match host.subscribe(sub.clone()) {
                Ok(()) => self.subscriptions.push(sub),
                Err(err) if matches!(sub.kind, SubscriptionKind::ElementResize(_)) => {
                    tracing::debug!(%err, "falling back to window resize events");
                    let fallback =
                        Subscription::new(Observer::Controller, SubscriptionKind::WindowResize);
                    match host.subscribe(fallback.clone()) {
                        Ok(()) => self.subscriptions.push(fallback),
                        Err(err) => tracing::warn!(%err, "resize events unavailable"),
                    }
                }
                Err(err) => tracing::warn!(%err, kind = ?sub.kind, "subscription failed"),
            }
        }
    }

    /// Forget items whose turn left the document: the placeholder is gone,
    /// or the item is mounted and its element is gone. A leftover collapsed
    /// placeholder is removed with it. Only while no pass holds item indices.
    fn prune_orphans<H>(&mut self, host: &mut H) -> usize
    where
        H: DocumentHost<Node = N>,
    {
        if !self.passes.is_empty() {
            return 0;
        }
        let before = self.items.len();
        let mut kept = Vec::with_capacity(before);
        for item in std::mem::take(&mut self.items) {
            if !host.is_connected(&item.placeholder) {
                continue;
            }
            if item.mounted && !host.is_connected(&item.element) {
                host.remove(&item.placeholder);
                continue;
            }
            kept.push(item);
        }
        self.items = kept;
        let dropped = before - self.items.len();
        if dropped > 0 {
            tracing::debug!(dropped, "dropped turns removed by the page");
        }
        dropped
    }

    fn prune_and_rewindow<H>(&mut self, host: &mut H, now_ms: u64)
    where
        H: DocumentHost<Node = N>,
    {
        if self.prune_orphans(host) > 0 {
            self.start_pass(host, now_ms, PassReason::Removal, Vec::new(), false);
        }
    }

    /// Offset from viewport coordinates to container content coordinates.
    fn content_offset<H>(&self, host: &H, container: &N) -> f64
    where
        H: DocumentHost<Node = N>,
    {
        let viewport_top = if *container == host.scrolling_element() {
            0.0
        } else {
            host.bounding_rect(container).top
        };
        host.scroll_top(container) - viewport_top
    }

    fn near_bottom<H>(&self, host: &H, container: &N) -> bool
    where
        H: DocumentHost<Node = N>,
    {
        let gap = host.scroll_height(container)
            - (host.scroll_top(container) + host.client_height(container));
        gap <= self.config.follow_threshold_px
    }

    fn start_pass<H>(
        &mut self,
        host: &mut H,
        now_ms: u64,
        reason: PassReason,
        replies: Vec<usize>,
        follow: bool,
    ) where
        H: DocumentHost<Node = N>,
    {
        let Some(container) = self.container.clone() else {
            return;
        };
        let scroll_top = host.scroll_top(&container);
        let window_top = scroll_top - self.config.overscan_px;
        let window_bottom =
            scroll_top + host.client_height(&container) + self.config.overscan_px;
        let offset = self.content_offset(host, &container);

        let mut unmount = VecDeque::new();
        let mut mount = VecDeque::new();
        for (idx, item) in self.items.iter().enumerate() {
            let Some(slot) = item.slot(host, offset) else {
                continue;
            };
            if slot.intersects(window_top, window_bottom) {
                if !item.mounted {
                    mount.push_back(idx);
                }
            } else if item.mounted {
                unmount.push_back(idx);
            }
        }

        let id = self.next_pass_id;
        self.next_pass_id += 1;
        tracing::trace!(
            pass = id,
            reason = reason.as_str(),
            unmount = unmount.len(),
            mount = mount.len(),
            "pass started"
        );
        let pass = Pass {
            id,
            reason,
            stage: Stage::Unmount,
            unmount,
            mount,
            reply_queue: replies.iter().copied().collect(),
            replies,
            follow,
            window_top,
            window_bottom,
            unmounted: 0,
            mounted: 0,
            remeasured: 0,
        };
        self.advance(host, now_ms, pass);
    }

    fn run_task<H>(&mut self, host: &mut H, now_ms: u64, task: Task)
    where
        H: DocumentHost<Node = N>,
    {
        if !self.installed {
            return;
        }
        match task {
            Task::Pass(id) => {
                let Some(at) = self.passes.iter().position(|p| p.id == id) else {
                    return;
                };
                let pass = self.passes.swap_remove(at);
                self.advance(host, now_ms, pass);
            }
            Task::ScrollTick => {
                self.prune_orphans(host);
                self.start_pass(host, now_ms, PassReason::Scroll, Vec::new(), false);
            }
            Task::SnapToBottom => {
                if let Some(container) = self.container.clone() {
                    let max = host.scroll_height(&container);
                    host.set_scroll_top(&container, max);
                }
            }
        }
    }

    /// Run `pass` until it yields or completes.
    fn advance<H>(&mut self, host: &mut H, now_ms: u64, mut pass: Pass)
    where
        H: DocumentHost<Node = N>,
    {
        let batch = self.config.batch_size.max(1);
        let floor = self.config.min_height_px;
        loop {
            match pass.stage {
                Stage::Unmount => {
                    if pass.unmount.is_empty() {
                        pass.stage = Stage::Mount;
                        continue;
                    }
                    let take = batch.min(pass.unmount.len());
                    for idx in pass.unmount.drain(..take) {
                        let Some(item) = self.items.get_mut(idx) else {
                            continue;
                        };
                        match item.unmount(host, floor) {
                            Ok(changed) => pass.unmounted += usize::from(changed),
                            Err(err) => tracing::debug!(%err, "unmount skipped"),
                        }
                    }
                    self.queue
                        .schedule_after(now_ms, self.config.yield_ms, Task::Pass(pass.id));
                    break;
                }
                Stage::Mount | Stage::MountReplies => {
                    let replies = pass.stage == Stage::MountReplies;
                    let queue = if replies {
                        &mut pass.reply_queue
                    } else {
                        &mut pass.mount
                    };
                    if queue.is_empty() {
                        pass.stage = if replies {
                            Stage::MeasureReplies
                        } else {
                            Stage::Measure
                        };
                        self.queue.schedule_frame(Task::Pass(pass.id));
                        break;
                    }
                    let take = batch.min(queue.len());
                    for idx in queue.drain(..take) {
                        let Some(item) = self.items.get_mut(idx) else {
                            continue;
                        };
                        match item.mount(host) {
                            Ok(changed) => pass.mounted += usize::from(changed),
                            Err(err) => tracing::debug!(%err, "mount skipped"),
                        }
                    }
                    self.queue
                        .schedule_after(now_ms, self.config.yield_ms, Task::Pass(pass.id));
                    break;
                }
                Stage::Measure => {
                    for item in &mut self.items {
                        pass.remeasured += usize::from(item.remeasure(host, floor));
                    }
                    pass.stage = if pass.replies.is_empty() {
                        Stage::Done
                    } else {
                        Stage::MountReplies
                    };
                }
                Stage::MeasureReplies => {
                    for &idx in &pass.replies {
                        if let Some(item) = self.items.get_mut(idx) {
                            pass.remeasured += usize::from(item.remeasure(host, floor));
                        }
                    }
                    if pass.follow {
                        self.follow_bottom(host, now_ms);
                    }
                    pass.stage = Stage::Done;
                }
                Stage::Done => {
                    self.finish(now_ms, &pass);
                    if self.passes.is_empty() {
                        self.prune_and_rewindow(host, now_ms);
                    }
                    return;
                }
            }
        }
        self.passes.push(pass);
    }

    fn follow_bottom<H>(&mut self, host: &mut H, now_ms: u64)
    where
        H: DocumentHost<Node = N>,
    {
        let target = bottom_most(&*host, self.items.iter().filter(|i| i.mounted))
            .map(|i| i.element.clone())
            .or_else(|| bottom_most(&*host, self.items.iter()).map(|i| i.placeholder.clone()));
        if let Some(target) = target {
            host.scroll_into_view_end(&target);
        }
        self.queue.schedule_after(now_ms, 0, Task::SnapToBottom);
    }

    fn finish(&mut self, now_ms: u64, pass: &Pass) {
        if pass.reason == PassReason::Scroll {
            self.ticking = false;
        }
        tracing::debug!(
            pass = pass.id,
            reason = pass.reason.as_str(),
            unmounted = pass.unmounted,
            mounted = pass.mounted,
            remeasured = pass.remeasured,
            "pass finished"
        );
        self.log.push(PassRecord {
            seq: 0,
            at_ms: now_ms,
            reason: pass.reason,
            unmounted: pass.unmounted,
            mounted: pass.mounted,
            remeasured: pass.remeasured,
            window_top: pass.window_top,
            window_bottom: pass.window_bottom,
        });
    }
}

/// The item whose slot ends lowest in the document.
fn bottom_most<'a, H, N>(
    host: &H,
    items: impl Iterator<Item = &'a TrackedItem<N>>,
) -> Option<&'a TrackedItem<N>>
where
    H: DocumentHost<Node = N>,
    N: Clone + PartialEq + fmt::Debug + 'a,
{
    items
        .filter_map(|item| item.slot(host, 0.0).map(|slot| (slot.bottom, item)))
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, item)| item)
}

/// Most frequent scroll container; the first seen wins ties.
fn dominant_container<N: Clone + PartialEq>(items: &[TrackedItem<N>]) -> Option<N> {
    let mut tally: Vec<(N, usize)> = Vec::new();
    for item in items {
        match tally.iter_mut().find(|(c, _)| *c == item.scroll_container) {
            Some((_, count)) => *count += 1,
            None => tally.push((item.scroll_container.clone(), 1)),
        }
    }
    let mut best: Option<(N, usize)> = None;
    for (container, count) in tally {
        if best.as_ref().is_none_or(|(_, top)| count > *top) {
            best = Some((container, count));
        }
    }
    best.map(|(container, _)| container)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{HeadlessDocument, NodeId};
    use pretty_assertions::assert_eq;

    fn conversation(turns: usize, turn_height: u32) -> String {
        let mut out = String::from(r#"<main><div id="scroller" style="height: 800px; overflow-y: auto">"#);
        for i in 0..turns {
            let role = if i % 2 == 0 { "user" } else { "assistant" };
            out.push_str(&format!(
                r#"<div id="t{i}" data-message-author-role="{role}"><p style="height: {turn_height}px">turn {i}</p></div>"#
            ));
        }
        out.push_str("</div></main>");
        out
    }

    fn settle(doc: &mut HeadlessDocument, v: &mut Virtualizer<NodeId>, now: &mut u64) {
        for _ in 0..100_000 {
            for (owner, event) in doc.take_events() {
                if owner == Observer::Controller {
                    v.handle_event(doc, event, *now);
                }
            }
            let frame_at = (*now / 16 + 1) * 16;
            match (v.next_deadline(), v.wants_frame()) {
                (Some(due), _) if due <= *now => v.run_due_timers(doc, *now),
                (Some(due), true) if due < frame_at => {
                    *now = due;
                    v.run_due_timers(doc, *now);
                }
                (_, true) => {
                    *now = frame_at;
                    v.run_frame(doc, *now);
                }
                (Some(due), false) => {
                    *now = due;
                    v.run_due_timers(doc, *now);
                }
                (None, false) if doc.has_pending_events() => {}
                (None, false) => return,
            }
        }
        panic!("virtualizer did not settle");
    }

    fn installed(turns: usize, turn_height: u32) -> (HeadlessDocument, Virtualizer<NodeId>, u64) {
        let mut doc =
            HeadlessDocument::from_body_markup(900.0, &conversation(turns, turn_height)).unwrap();
        let mut v = Virtualizer::new(VirtualizerConfig::default(), SharedSelector::default());
        let mut now = 0;
        let outcome = v.install(&mut doc, now).unwrap();
        assert_eq!(outcome, InstallOutcome::Installed { tracked: turns });
        settle(&mut doc, &mut v, &mut now);
        (doc, v, now)
    }

    #[test]
    fn install_is_idempotent_and_picks_the_scroller() {
        let (mut doc, mut v, now) = installed(6, 300);
        let scroller = doc.element_by_id("scroller").unwrap();
        assert_eq!(v.scroll_container(), Some(&scroller));
        assert_eq!(
            v.install(&mut doc, now).unwrap(),
            InstallOutcome::AlreadyInstalled
        );
        assert_eq!(v.items().len(), 6);
        assert_eq!(v.installed_selector(), Some("[data-message-author-role]"));
    }

    #[test]
    fn install_without_turns_stays_uninstalled() {
        let mut doc = HeadlessDocument::from_body_markup(600.0, "<main><p>empty</p></main>").unwrap();
        let mut v = Virtualizer::new(VirtualizerConfig::default(), SharedSelector::default());
        assert_eq!(v.install(&mut doc, 0).unwrap(), InstallOutcome::NoTurns);
        assert!(!v.is_installed());
        assert!(doc.active_subscriptions().is_empty());
    }

    #[test]
    fn invalid_published_selector_is_an_error() {
        let mut doc = HeadlessDocument::from_body_markup(600.0, &conversation(2, 100)).unwrap();
        let shared = SharedSelector::new(Some("main >".into()));
        let mut v = Virtualizer::new(VirtualizerConfig::default(), shared);
        assert!(matches!(
            v.install(&mut doc, 0),
            Err(DomError::InvalidSelector(_))
        ));
        assert!(!v.is_installed());
    }

    #[test]
    fn initial_pass_mounts_only_the_window() {
        let (doc, v, _) = installed(20, 400);
        // 800px viewport + 1200px overscan below: slots [0, 2000] intersect.
        let mounted: Vec<bool> = v.items().iter().map(|i| i.mounted).collect();
        let expected: Vec<bool> = (0..20).map(|i| i * 400 <= 2000).collect();
        assert_eq!(mounted, expected);
        let scroller = doc.element_by_id("scroller").unwrap();
        assert_eq!(doc.scroll_height(&scroller), 8000.0);
        assert_eq!(v.stats().total_height, 8000.0);
        assert_eq!(v.last_pass().map(|p| p.reason), Some(PassReason::Install));
    }

    #[test]
    fn scroll_events_are_guarded_until_the_pass_finishes() {
        let (mut doc, mut v, mut now) = installed(20, 400);
        let scroller = doc.element_by_id("scroller").unwrap();
        v.drain_pass_log();

        doc.set_scroll_top(&scroller, 3000.0);
        v.on_scroll(&scroller);
        v.on_scroll(&scroller);
        assert!(v.wants_frame());
        settle(&mut doc, &mut v, &mut now);

        let scroll_passes = v
            .drain_pass_log()
            .into_iter()
            .filter(|p| p.reason == PassReason::Scroll)
            .count();
        assert_eq!(scroll_passes, 1);
        assert!(!v.items()[0].mounted);
        assert!(v.items()[9].mounted);
    }

    #[test]
    fn reinserting_a_tracked_turn_starts_no_pass() {
        let (mut doc, mut v, now) = installed(4, 300);
        v.drain_pass_log();
        let element = v.items()[0].element;
        v.on_nodes_added(&mut doc, &[element], now);
        assert!(v.is_idle());
        assert!(v.drain_pass_log().is_empty());
    }

    #[test]
    fn following_targets_the_lowest_turn_not_the_newest() {
        let (mut doc, mut v, mut now) = installed(3, 300);
        let scroller = doc.element_by_id("scroller").unwrap();
        doc.set_scroll_top(&scroller, 100.0);
        settle(&mut doc, &mut v, &mut now);

        // A reply rendered above the existing turns is tracked last.
        let first = doc.element_by_id("t0").unwrap();
        let reply = doc.create_element("div").unwrap();
        doc.set_attribute(&reply, "data-message-author-role", "assistant");
        doc.set_style(&reply, "height", "100px");
        doc.insert_before(&scroller, &reply, Some(&first)).unwrap();
        settle(&mut doc, &mut v, &mut now);

        assert_eq!(v.items().len(), 4);
        assert_eq!(v.items()[3].element, reply);
        let lowest = bottom_most(&doc, v.items().iter().filter(|i| i.mounted)).unwrap();
        assert_eq!(lowest.element, doc.element_by_id("t2").unwrap());
        assert_eq!(doc.scroll_top(&scroller), 200.0);
    }

    #[test]
    fn missing_resize_observer_falls_back_to_window_events() {
        let mut doc = HeadlessDocument::from_body_markup(900.0, &conversation(3, 100))
            .unwrap()
            .without_resize_observer();
        let mut v = Virtualizer::new(VirtualizerConfig::default(), SharedSelector::default());
        v.install(&mut doc, 0).unwrap();
        let kinds: Vec<_> = doc
            .active_subscriptions()
            .iter()
            .map(|s| s.kind.clone())
            .collect();
        let scroller = doc.element_by_id("scroller").unwrap();
        assert_eq!(
            kinds,
            vec![
                SubscriptionKind::Scroll(scroller),
                SubscriptionKind::WindowResize,
                SubscriptionKind::Mutations,
            ]
        );
    }

    #[test]
    fn disable_clears_everything_and_allows_reinstall() {
        let (mut doc, mut v, mut now) = installed(10, 400);
        doc.set_scroll_top(&doc.element_by_id("scroller").unwrap(), 1000.0);
        assert!(v.refresh(&mut doc, now));
        assert!(v.disable(&mut doc));
        assert!(!v.disable(&mut doc));
        assert!(v.is_idle());
        assert!(doc.active_subscriptions().is_empty());
        assert!(doc.query_all("[data-nv-ph]").unwrap().is_empty());
        assert_eq!(v.stats(), VirtualizerStats::default());

        assert_eq!(
            v.enable(&mut doc, now).unwrap(),
            InstallOutcome::Installed { tracked: 10 }
        );
        settle(&mut doc, &mut v, &mut now);
        assert!(v.stats().mounted > 0);
    }

    #[test]
    fn dominant_container_prefers_first_seen_on_ties() {
        let mk = |c: u32| TrackedItem {
            element: 0u32,
            placeholder: 0,
            mounted: false,
            height: 0.0,
            cached_markup: None,
            parent: 0,
            anchor: None,
            scroll_container: c,
            assistant: false,
        };
        assert_eq!(dominant_container(&[mk(7), mk(9), mk(9), mk(7)]), Some(7));
        assert_eq!(dominant_container(&[mk(7), mk(9), mk(9)]), Some(9));
        assert_eq!(dominant_container::<u32>(&[]), None);
    }

    #[test]
    fn stats_serialize_in_camel_case() {
        let stats = VirtualizerStats {
            total: 3,
            mounted: 1,
            total_height: 168.0,
        };
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["totalHeight"], 168.0);
        assert_eq!(json["mounted"], 1);
    }
}
