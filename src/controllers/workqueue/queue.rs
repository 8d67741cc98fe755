//! # De-duplicating Work Queue
//!
//! FIFO of keys with two guarantees:
//!
//! - adding a key that is already pending is a no-op, so bursts coalesce
//! - a key is handed to at most one worker at a time; adding it while it is
//!   being processed marks it dirty, and it is queued again once, when the
//!   worker calls [`WorkQueue::done`]
//!
//! `done` must be called exactly once for every key returned by `get`.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::observability::metrics;

/// Bound for anything used as a queue key
pub trait QueueKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> QueueKey for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

impl<T> Default for QueueState<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            shutting_down: false,
        }
    }
}

pub struct WorkQueue<T> {
    name: String,
    state: Mutex<QueueState<T>>,
    ready: Notify,
    /// Cancels pending `add_after` timers on shutdown
    timers: CancellationToken,
}

impl<T: QueueKey> WorkQueue<T> {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
            timers: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&self, item: T) {
        let mut state = self.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }

        metrics::record_workqueue_add(&self.name);
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            trace!(queue = %self.name, key = ?item, "Key is being processed, holding it");
            return;
        }

        state.queue.push_back(item);
        metrics::set_workqueue_depth(&self.name, state.queue.len());
        drop(state);
        self.ready.notify_one();
    }

    /// Add `item` once `delay` has passed. Dropped if the queue shuts down first.
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let queue: Weak<Self> = Arc::downgrade(self);
        let cancelled = self.timers.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(queue) = queue.upgrade() {
                        queue.add(item);
                    }
                }
            }
        });
    }

    /// Wait for the next key. `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.processing.insert(item.clone());
                    state.dirty.remove(&item);
                    metrics::set_workqueue_depth(&self.name, state.queue.len());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.ready.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Finish processing `item`; requeues it if it was added meanwhile
    pub fn done(&self, item: &T) {
        let mut state = self.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            metrics::set_workqueue_depth(&self.name, state.queue.len());
            drop(state);
            self.ready.notify_one();
        }
    }

    /// Stop accepting keys and wake every waiting worker
    pub fn shut_down(&self) {
        self.state.lock().shutting_down = true;
        self.timers.cancel();
        self.ready.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
