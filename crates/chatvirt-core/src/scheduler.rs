#![forbid(unsafe_code)]

//! Cooperative task queue driven by the host clock.
//!
//! Nothing here sleeps or spawns. The host arms a real timer for
//! [`TaskQueue::next_deadline`] and an animation frame when
//! [`TaskQueue::wants_frame`] is true, then hands control back:
//!
//! ```text
//! setTimeout fires      → pop_due(now)   // timers with due <= now, in order
//! requestAnimationFrame → take_frame()   // tasks queued before this frame
//! ```
//!
//! Timers with equal due times run in scheduling order. Frame tasks queued
//! while a frame is being processed wait for the next frame.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

#[derive(Debug)]
struct Timer<T> {
    due_ms: u64,
    seq: u64,
    task: T,
}

impl<T> PartialEq for Timer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due_ms == other.due_ms && self.seq == other.seq
    }
}

impl<T> Eq for Timer<T> {}

impl<T> PartialOrd for Timer<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Timer<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap: earliest due first, then earliest scheduled.
        other
            .due_ms
            .cmp(&self.due_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Timer and animation-frame queues.
#[derive(Debug)]
pub struct TaskQueue<T> {
    timers: BinaryHeap<Timer<T>>,
    frame: VecDeque<T>,
    next_seq: u64,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self {
            timers: BinaryHeap::new(),
            frame: VecDeque::new(),
            next_seq: 0,
        }
    }
}

impl<T> TaskQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` once `now_ms + delay_ms` has passed.
    pub fn schedule_after(&mut self, now_ms: u64, delay_ms: u64, task: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.push(Timer {
            due_ms: now_ms.saturating_add(delay_ms),
            seq,
            task,
        });
    }

    /// Run `task` on the next animation frame.
    pub fn schedule_frame(&mut self, task: T) {
        self.frame.push_back(task);
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.peek().map(|t| t.due_ms)
    }

    #[must_use]
    pub fn wants_frame(&self) -> bool {
        !self.frame.is_empty()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.timers.is_empty() && self.frame.is_empty()
    }

    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Pop the earliest timer due at or before `now_ms`.
    pub fn pop_due(&mut self, now_ms: u64) -> Option<T> {
        if self.timers.peek()?.due_ms > now_ms {
            return None;
        }
        self.timers.pop().map(|t| t.task)
    }

    /// Take every task queued for the current frame.
    pub fn take_frame(&mut self) -> Vec<T> {
        self.frame.drain(..).collect()
    }

    /// Drop all pending work.
    pub fn clear(&mut self) {
        self.timers.clear();
        self.frame.clear();
    }
}
