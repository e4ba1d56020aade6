#![forbid(unsafe_code)]

//! Pending host notifications, coalesced the way browsers deliver them.
//!
//! Insertions accumulate into one batch per observer. Removal, scroll and
//! resize notifications collapse: a second identical event for the same
//! observer before delivery is dropped.

use crate::dom::{HostEvent, Observer, Subscription, SubscriptionKind};

/// Notifications waiting to be delivered.
#[derive(Debug, Clone)]
pub struct EventInbox<N> {
    added: Vec<(Observer, Vec<N>)>,
    other: Vec<(Observer, HostEvent<N>)>,
}

impl<N> Default for EventInbox<N> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            other: Vec::new(),
        }
    }
}

impl<N: Clone + PartialEq> EventInbox<N> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append inserted nodes to `owner`'s batch.
    pub fn nodes_added(&mut self, owner: Observer, nodes: impl IntoIterator<Item = N>) {
        let at = match self.added.iter().position(|(o, _)| *o == owner) {
            Some(at) => at,
            None => {
                self.added.push((owner, Vec::new()));
                self.added.len() - 1
            }
        };
        self.added[at].1.extend(nodes);
    }

    pub fn push(&mut self, owner: Observer, event: HostEvent<N>) {
        match event {
            HostEvent::NodesAdded(nodes) => self.nodes_added(owner, nodes),
            event => {
                if !self.other.iter().any(|(o, e)| *o == owner && *e == event) {
                    self.other.push((owner, event));
                }
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.other.is_empty() && self.added.iter().all(|(_, nodes)| nodes.is_empty())
    }

    /// Drain in delivery order: insertion batches first, then the rest.
    pub fn drain(&mut self) -> Vec<(Observer, HostEvent<N>)> {
        let mut out: Vec<(Observer, HostEvent<N>)> = self
            .added
            .drain(..)
            .filter(|(_, nodes)| !nodes.is_empty())
            .map(|(owner, nodes)| (owner, HostEvent::NodesAdded(nodes)))
            .collect();
        out.append(&mut self.other);
        out
    }

    /// Discard what `removed` would have delivered. `remaining` is the
    /// subscription set after removal; a resize event survives while the
    /// owner still watches some resize source.
    pub fn forget(&mut self, removed: &Subscription<N>, remaining: &[Subscription<N>]) {
        let owner = removed.owner;
        match &removed.kind {
            SubscriptionKind::Mutations => {
                self.added.retain(|(o, _)| *o != owner);
                self.other
                    .retain(|(o, e)| !(*o == owner && *e == HostEvent::NodesRemoved));
            }
            SubscriptionKind::Scroll(node) => self.other.retain(|(o, e)| {
                !(*o == owner && matches!(e, HostEvent::Scroll(n) if n == node))
            }),
            SubscriptionKind::ElementResize(_) | SubscriptionKind::WindowResize => {
                let still_watching = remaining.iter().any(|s| {
                    s.owner == owner
                        && matches!(
                            s.kind,
                            SubscriptionKind::ElementResize(_) | SubscriptionKind::WindowResize
                        )
                });
                if !still_watching {
                    self.other
                        .retain(|(o, e)| !(*o == owner && *e == HostEvent::Resize));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn insertions_batch_per_owner_and_come_first() {
        let mut inbox = EventInbox::new();
        inbox.push(Observer::Controller, HostEvent::Scroll(9));
        inbox.nodes_added(Observer::Controller, [1, 2]);
        inbox.nodes_added(Observer::Loader, [1]);
        inbox.nodes_added(Observer::Controller, [3]);
        assert_eq!(
            inbox.drain(),
            vec![
                (Observer::Controller, HostEvent::NodesAdded(vec![1, 2, 3])),
                (Observer::Loader, HostEvent::NodesAdded(vec![1])),
                (Observer::Controller, HostEvent::Scroll(9)),
            ]
        );
        assert!(inbox.is_empty());
    }

    #[test]
    fn scroll_and_resize_collapse() {
        let mut inbox = EventInbox::new();
        for _ in 0..3 {
            inbox.push(Observer::Controller, HostEvent::Scroll(4));
            inbox.push(Observer::Controller, HostEvent::Resize);
        }
        inbox.push(Observer::Controller, HostEvent::Scroll(5));
        assert_eq!(inbox.drain().len(), 3);
    }

    #[test]
    fn forget_keeps_resize_while_another_source_remains() {
        let mut inbox = EventInbox::new();
        inbox.push(Observer::Controller, HostEvent::Resize);
        inbox.push(Observer::Controller, HostEvent::Scroll(1));
        inbox.nodes_added(Observer::Controller, [7]);
        inbox.push(Observer::Controller, HostEvent::NodesRemoved);

        let element = Subscription::new(Observer::Controller, SubscriptionKind::ElementResize(1));
        let window = Subscription::new(Observer::Controller, SubscriptionKind::WindowResize);
        inbox.forget(&element, std::slice::from_ref(&window));
        inbox.forget(
            &Subscription::new(Observer::Controller, SubscriptionKind::Mutations),
            &[],
        );
        assert_eq!(
            inbox.drain(),
            vec![
                (Observer::Controller, HostEvent::Resize),
                (Observer::Controller, HostEvent::Scroll(1)),
            ]
        );

        inbox.push(Observer::Controller, HostEvent::Resize);
        inbox.forget(&window, &[]);
        assert!(inbox.is_empty());
    }
}
