#![forbid(unsafe_code)]

//! Turn selector discovery.
//!
//! Finds one CSS selector that matches exactly the conversation turns of the
//! hosted page, publishes it to the [`SharedSelector`] cell, and keeps it
//! current across client-side navigation.
//!
//! Resolution order:
//!
//! 1. The cached selector, while it still matches something.
//! 2. Known candidates, first with at least `min_matches` matches.
//! 3. Structural fallback: the first direct child of a root container with at
//!    least `min_children` children yields `"<css path> > *"`.
//! 4. Otherwise wait for insertions and retry on each batch.
//!
//! ```text
//! Idle ──run──▶ Searching ──found──▶ Resolved
//!                   │                   ▲
//!                   └──none──▶ Waiting ─┘ (insertion raises matches)
//! ```

use crate::config::DiscoveryConfig;
use crate::dom::{DocumentHost, Observer, Subscription, SubscriptionKind, count_matches};
use crate::scheduler::TaskQueue;
use crate::shared::SharedSelector;
use serde::Serialize;
use std::fmt;

/// Discovery lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryState {
    Idle,
    Searching,
    Waiting,
    Resolved,
}

impl DiscoveryState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Searching => "searching",
            Self::Waiting => "waiting",
            Self::Resolved => "resolved",
        }
    }
}

/// Where an accepted selector came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    /// Index into the configured candidate list.
    Candidate(usize),
    Structural,
    Cached,
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Candidate(idx) => write!(f, "candidate#{idx}"),
            Self::Structural => f.write_str("structural"),
            Self::Cached => f.write_str("cached"),
        }
    }
}

/// An accepted selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryOutcome {
    pub selector: String,
    pub source: DiscoverySource,
    pub matches: usize,
}

/// Result of one discovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryStep {
    Ready(DiscoveryOutcome),
    Waiting,
}

/// The selector discovery loader.
#[derive(Debug)]
pub struct SelectorDiscovery<N> {
    config: DiscoveryConfig,
    shared: SharedSelector,
    state: DiscoveryState,
    watch: Option<Subscription<N>>,
    reruns: TaskQueue<()>,
}

impl<N: Clone + PartialEq + fmt::Debug> SelectorDiscovery<N> {
    #[must_use]
    pub fn new(config: DiscoveryConfig, shared: SharedSelector) -> Self {
        Self {
            config,
            shared,
            state: DiscoveryState::Idle,
            watch: None,
            reruns: TaskQueue::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.watch.is_some()
    }

    /// First qualifying candidate, else the structural fallback.
    pub fn pick_selector<H>(&self, host: &H) -> Option<DiscoveryOutcome>
    where
        H: DocumentHost<Node = N>,
    {
        for (idx, candidate) in self.config.candidates.iter().enumerate() {
            let Some(matches) = count_matches(host, candidate) else {
                continue;
            };
            if matches >= self.config.min_matches {
                return Some(DiscoveryOutcome {
                    selector: candidate.clone(),
                    source: DiscoverySource::Candidate(idx),
                    matches,
                });
            }
        }
        self.structural(host)
    }

    fn structural<H>(&self, host: &H) -> Option<DiscoveryOutcome>
    where
        H: DocumentHost<Node = N>,
    {
        let roots = match host.query_all(&self.config.root_containers) {
            Ok(roots) => roots,
            Err(err) => {
                tracing::debug!(%err, "root containers not queryable");
                return None;
            }
        };
        for root in &roots {
            for column in host.element_children(root) {
                let matches = host.element_children(&column).len();
                if matches >= self.config.min_children {
                    return Some(DiscoveryOutcome {
                        selector: format!("{} > *", css_path(host, &column)),
                        source: DiscoverySource::Structural,
                        matches,
                    });
                }
            }
        }
        None
    }

    /// Resolve now, or start watching insertions.
    pub fn run<H>(&mut self, host: &mut H) -> DiscoveryStep
    where
        H: DocumentHost<Node = N>,
    {
        self.state = DiscoveryState::Searching;
        if let Some(cached) = self.shared.get() {
            match count_matches(host, &cached) {
                Some(matches) if matches >= 1 => {
                    return self.resolve(
                        host,
                        DiscoveryOutcome {
                            selector: cached,
                            source: DiscoverySource::Cached,
                            matches,
                        },
                    );
                }
                _ => tracing::debug!(selector = %cached, "cached selector went stale"),
            }
        }
        if let Some(outcome) = self.pick_selector(host) {
            return self.resolve(host, outcome);
        }
        self.wait(host);
        DiscoveryStep::Waiting
    }

    /// Retry after an insertion batch while waiting.
    pub fn on_nodes_added<H>(&mut self, host: &mut H) -> Option<DiscoveryOutcome>
    where
        H: DocumentHost<Node = N>,
    {
        if self.state != DiscoveryState::Waiting {
            return None;
        }
        let cached = self.shared.get().and_then(|selector| {
            let matches = count_matches(host, &selector)?;
            (matches >= self.config.min_matches).then_some(DiscoveryOutcome {
                selector,
                source: DiscoverySource::Cached,
                matches,
            })
        });
        let outcome = cached.or_else(|| self.pick_selector(host))?;
        match self.resolve(host, outcome) {
            DiscoveryStep::Ready(outcome) => Some(outcome),
            DiscoveryStep::Waiting => None,
        }
    }

    /// Queue a deferred re-run after a route change.
    pub fn on_navigation(&mut self, now_ms: u64) {
        tracing::debug!(state = self.state.as_str(), "route changed");
        self.reruns.schedule_after(now_ms, 0, ());
    }

    /// Run due navigation re-runs; several collapse into one.
    pub fn run_due<H>(&mut self, host: &mut H, now_ms: u64) -> Option<DiscoveryStep>
    where
        H: DocumentHost<Node = N>,
    {
        let mut due = false;
        while self.reruns.pop_due(now_ms).is_some() {
            due = true;
        }
        due.then(|| self.run(host))
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.reruns.next_deadline()
    }

    /// Drop the insertion watch and pending re-runs.
    pub fn stop<H>(&mut self, host: &mut H)
    where
        H: DocumentHost<Node = N>,
    {
        self.unwatch(host);
        self.reruns.clear();
        self.state = DiscoveryState::Idle;
    }

    fn resolve<H>(&mut self, host: &mut H, outcome: DiscoveryOutcome) -> DiscoveryStep
    where
        H: DocumentHost<Node = N>,
    {
        self.unwatch(host);
        self.shared.set(Some(outcome.selector.clone()));
        self.state = DiscoveryState::Resolved;
        tracing::info!(
            selector = %outcome.selector,
            source = %outcome.source,
            matches = outcome.matches,
            "turn selector resolved"
        );
        DiscoveryStep::Ready(outcome)
    }

    fn wait<H>(&mut self, host: &mut H)
    where
        H: DocumentHost<Node = N>,
    {
        self.state = DiscoveryState::Waiting;
        if self.watch.is_some() {
            return;
        }
        let sub = Subscription::new(Observer::Loader, SubscriptionKind::Mutations);
        match host.subscribe(sub.clone()) {
            Ok(()) => {
                tracing::debug!("waiting for turns to appear");
                self.watch = Some(sub);
            }
            Err(err) => tracing::warn!(%err, "cannot observe insertions"),
        }
    }

    fn unwatch<H>(&mut self, host: &mut H)
    where
        H: DocumentHost<Node = N>,
    {
        if let Some(sub) = self.watch.take() {
            host.unsubscribe(&sub);
        }
    }
}

/// `body > tag:nth-child(i) > …` path from `<body>` down to `node`.
pub fn css_path<H: DocumentHost>(host: &H, node: &H::Node) -> String {
    let body = host.body();
    let mut segments = Vec::new();
    let mut cursor = node.clone();
    while body.as_ref() != Some(&cursor) {
        let Some(parent) = host.parent_element(&cursor) else {
            break;
        };
        let index = host
            .element_children(&parent)
            .iter()
            .position(|c| *c == cursor)
            .map_or(1, |i| i + 1);
        segments.push(format!("{}:nth-child({index})", host.tag_name(&cursor)));
        cursor = parent;
    }
    segments.push("body".to_owned());
    segments.reverse();
    segments.join(" > ")
}
