//! A capacity-bounded, closable FIFO used as the input of every pipeline node.
//!
//! Pushers block while the queue is full and poppers block while it is empty. Closing the
//! queue wakes everyone: pushes fail from then on, while pops keep returning the messages
//! already queued until it is drained. A closed queue can be reopened so a node can be run
//! again without being rebuilt.

use crate::errors::{PipelineError, Result};
use crate::stats::NamedStats;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A thread-safe bounded FIFO with an explicit close signal.
pub struct BoundedMessageQueue<T> {
    name: String,
    capacity: usize,
    inner: Mutex<QueueInner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    pushed: AtomicU64,
    popped: AtomicU64,
}

impl<T> BoundedMessageQueue<T> {
    /// Creates an open queue holding at most `capacity` items.
    ///
    /// # Panics
    /// - Will panic if `capacity` is zero.
    #[must_use]
    pub fn new(name: &str, capacity: usize) -> Self {
        assert!(capacity > 0, "Queue capacity must be greater than zero");
        Self {
            name: name.to_owned(),
            capacity,
            inner: Mutex::new(QueueInner { items: VecDeque::with_capacity(capacity), closed: false }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
        }
    }

    /// Appends `item`, blocking while the queue is full.
    ///
    /// # Errors
    /// - Returns [`PipelineError::QueueClosed`] if the queue is closed, either before the call
    ///   or while waiting for space. The item is dropped.
    pub fn push(&self, item: T) -> Result<()> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(PipelineError::QueueClosed { queue: self.name.clone() });
            }
            if inner.items.len() < self.capacity {
                inner.items.push_back(item);
                self.pushed.fetch_add(1, Ordering::Relaxed);
                self.not_empty.notify_one();
                return Ok(());
            }
            self.not_full.wait(&mut inner);
        }
    }

    /// Removes the oldest item, blocking while the queue is empty and open. Returns `None`
    /// once the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                self.popped.fetch_add(1, Ordering::Relaxed);
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Closes the queue and wakes every blocked pusher and popper. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        drop(inner);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Reopens a closed queue so it accepts pushes again.
    pub fn reopen(&self) {
        self.inner.lock().closed = false;
    }

    /// Discards everything still queued and returns how many items were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.items.len();
        inner.items.clear();
        drop(inner);
        self.not_full.notify_all();
        dropped
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue depth, capacity, open/closed state and traffic counters.
    #[must_use]
    pub fn sample_stats(&self) -> NamedStats {
        let (depth, closed) = {
            let inner = self.inner.lock();
            (inner.items.len(), inner.closed)
        };
        let mut stats = NamedStats::new();
        stats.insert("queue_depth".to_owned(), depth as f64);
        stats.insert("queue_capacity".to_owned(), self.capacity as f64);
        stats.insert("queue_closed".to_owned(), if closed { 1.0 } else { 0.0 });
        stats.insert("messages_pushed".to_owned(), self.pushed.load(Ordering::Relaxed) as f64);
        stats.insert("messages_popped".to_owned(), self.popped.load(Ordering::Relaxed) as f64);
        stats
    }
}
