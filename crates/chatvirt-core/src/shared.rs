#![forbid(unsafe_code)]

//! Shared turn-selector cell.
//!
//! Discovery publishes the accepted selector here; the controller reads it at
//! install time. Cloning a [`SharedSelector`] yields another handle to the
//! same cell.
//!
//! # Invariants
//!
//! 1. `version` increments by exactly 1 on each value-changing `set`.
//! 2. Setting the current value is a no-op (no version bump, no callbacks).
//! 3. Subscribers are notified in registration order, outside the borrow.
//! 4. Dropped [`SelectorSubscription`] guards are pruned on the next notify.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

type CallbackRc = Rc<dyn Fn(Option<&str>)>;
type CallbackWeak = Weak<dyn Fn(Option<&str>)>;

struct Inner {
    value: Option<String>,
    version: u64,
    subscribers: Vec<CallbackWeak>,
}

/// Version-tracked `Option<String>` with change notification.
#[derive(Clone)]
pub struct SharedSelector {
    inner: Rc<RefCell<Inner>>,
}

/// Keeps a selector callback alive; dropping it unsubscribes.
pub struct SelectorSubscription {
    _guard: CallbackRc,
}

impl fmt::Debug for SelectorSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorSubscription").finish_non_exhaustive()
    }
}

impl fmt::Debug for SharedSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("SharedSelector")
            .field("value", &inner.value)
            .field("version", &inner.version)
            .field("subscriber_count", &inner.subscribers.len())
            .finish()
    }
}

impl Default for SharedSelector {
    fn default() -> Self {
        Self::new(None)
    }
}

impl SharedSelector {
    #[must_use]
    pub fn new(value: Option<String>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                value,
                version: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    #[must_use]
    pub fn get(&self) -> Option<String> {
        self.inner.borrow().value.clone()
    }

    /// Current value, or `fallback` when nothing has been published.
    #[must_use]
    pub fn get_or(&self, fallback: &str) -> String {
        self.inner
            .borrow()
            .value
            .clone()
            .unwrap_or_else(|| fallback.to_owned())
    }

    /// Publish a value. Returns whether it changed.
    ///
    /// # Panics
    ///
    /// Panics if called re-entrantly from within a subscriber callback.
    pub fn set(&self, value: Option<String>) -> bool {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.value == value {
                return false;
            }
            inner.value = value;
            inner.version += 1;
        }
        self.notify();
        true
    }

    pub fn subscribe(&self, callback: impl Fn(Option<&str>) + 'static) -> SelectorSubscription {
        let strong: CallbackRc = Rc::new(callback);
        self.inner
            .borrow_mut()
            .subscribers
            .push(Rc::downgrade(&strong));
        SelectorSubscription { _guard: strong }
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.borrow().version
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().subscribers.len()
    }

    fn notify(&self) {
        let callbacks: Vec<CallbackRc> = {
            let mut inner = self.inner.borrow_mut();
            inner.subscribers.retain(|w| w.strong_count() > 0);
            inner.subscribers.iter().filter_map(Weak::upgrade).collect()
        };
        let value = self.inner.borrow().value.clone();
        for callback in &callbacks {
            callback(value.as_deref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn set_bumps_version_only_on_change() {
        let cell = SharedSelector::default();
        assert_eq!(cell.get(), None);
        assert!(cell.set(Some("a".into())));
        assert!(!cell.set(Some("a".into())));
        assert_eq!(cell.version(), 1);
        assert!(cell.set(None));
        assert_eq!(cell.version(), 2);
        assert_eq!(cell.get_or("[x]"), "[x]");
    }

    #[test]
    fn clones_share_state() {
        let a = SharedSelector::default();
        let b = a.clone();
        a.set(Some("main > *".into()));
        assert_eq!(b.get().as_deref(), Some("main > *"));
    }

    #[test]
    fn dropped_subscription_stops_callbacks() {
        let cell = SharedSelector::default();
        let hits = Rc::new(Cell::new(0));
        let seen = Rc::clone(&hits);
        let guard = cell.subscribe(move |_| seen.set(seen.get() + 1));
        cell.set(Some("a".into()));
        drop(guard);
        cell.set(Some("b".into()));
        assert_eq!(hits.get(), 1);
        assert_eq!(cell.subscriber_count(), 0);
    }
}
