use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// FIFO work queue shared between the transport thread and the worker pool.
///
/// Semantically unbounded: `push` never blocks for capacity (ingress applies
/// the soft watermark before pushing). `pop` blocks until an item arrives or
/// the queue is terminated. Both ends stamp monotonic timestamps so the
/// watchdog can tell a busy queue from a wedged one.
pub struct EventQueue<T> {
    inner: Mutex<QueueInner<T>>,
    available: Condvar,
}

struct QueueInner<T> {
    items: VecDeque<Entry<T>>,
    terminated: bool,
    deadlock_threshold: Option<Duration>,
    last_push: Option<Instant>,
    last_pop: Option<Instant>,
}

struct Entry<T> {
    item: T,
    enqueued_at: Instant,
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                terminated: false,
                deadlock_threshold: None,
                last_push: None,
                last_pop: None,
            }),
            available: Condvar::new(),
        }
    }

    // The queue must stay usable after a worker panic elsewhere in the
    // process, so poisoned locks are recovered rather than propagated.
    fn lock(&self) -> MutexGuard<'_, QueueInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an item. Returns `false` if the queue has been terminated,
    /// in which case the item is dropped.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.lock();
        if inner.terminated {
            return false;
        }
        let now = Instant::now();
        inner.items.push_back(Entry {
            item,
            enqueued_at: now,
        });
        inner.last_push = Some(now);
        drop(inner);
        self.available.notify_one();
        true
    }

    /// Blocks until an item is available or the queue is terminated.
    /// `None` means terminated; no further items will ever be delivered.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.lock();
        loop {
            if let Some(entry) = inner.items.pop_front() {
                inner.last_pop = Some(Instant::now());
                return Some(entry.item);
            }
            if inner.terminated {
                return None;
            }
            inner = self
                .available
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Current depth. Observability only; the value is stale the moment the
    /// lock is released.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Permanently unblocks all consumers. Items still queued are dropped;
    /// subsequent pushes are rejected silently.
    pub fn terminate(&self) {
        let mut inner = self.lock();
        inner.terminated = true;
        inner.items.clear();
        drop(inner);
        self.available.notify_all();
    }

    pub fn set_deadlock_threshold(&self, threshold: Duration) {
        self.lock().deadlock_threshold = Some(threshold);
    }

    /// True iff the queue is non-empty, the oldest queued item has waited
    /// longer than the configured threshold, and no pop has succeeded in
    /// that interval. Always false when no threshold is configured.
    pub fn is_deadlocked(&self) -> bool {
        let inner = self.lock();
        let Some(threshold) = inner.deadlock_threshold else {
            return false;
        };
        let Some(front) = inner.items.front() else {
            return false;
        };
        front.enqueued_at.elapsed() >= threshold
            && inner
                .last_pop
                .map_or(true, |at| at.elapsed() >= threshold)
    }
}
