//! # Work Queue
//!
//! [`WorkQueue`] handles de-duplicated delivery; [`RateLimiter`] implementations
//! decide retry timing. [`RateLimitingQueue`] puts the two together for controllers.

pub mod queue;
pub mod rate_limiter;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::observability::metrics;

pub use queue::{QueueKey, WorkQueue};
pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkQueueError {
    #[error("unable to sync caches for {controller}")]
    CacheSyncFailed { controller: String },

    #[error("work queue {name:?} is shutting down")]
    ShuttingDown { name: String },
}

pub struct RateLimitingQueue<T: QueueKey> {
    queue: Arc<WorkQueue<T>>,
    limiter: Box<dyn RateLimiter<T>>,
}

impl<T: QueueKey> RateLimitingQueue<T> {
    pub fn new<S: Into<String>>(name: S, limiter: Box<dyn RateLimiter<T>>) -> Self {
        Self {
            queue: Arc::new(WorkQueue::new(name)),
            limiter,
        }
    }

    /// Queue using [`default_controller_rate_limiter`]
    pub fn with_default_limiter<S: Into<String>>(name: S) -> Self {
        Self::new(name, Box::new(default_controller_rate_limiter()))
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    pub fn add(&self, item: T) {
        self.queue.add(item);
    }

    pub fn add_after(&self, item: T, delay: Duration) {
        self.queue.add_after(item, delay);
    }

    /// Requeue `item` after the limiter's delay
    pub fn add_rate_limited(&self, item: T) {
        if self.queue.is_shutting_down() {
            return;
        }
        metrics::record_workqueue_retry(self.queue.name());
        let delay = self.limiter.when(&item);
        self.queue.add_after(item, delay);
    }

    /// Clear retry history; does not remove a pending key
    pub fn forget(&self, item: &T) {
        self.limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> usize {
        self.limiter.num_requeues(item)
    }

    pub async fn get(&self) -> Option<T> {
        self.queue.get().await
    }

    pub fn done(&self, item: &T) {
        self.queue.done(item);
    }

    pub fn shut_down(&self) {
        self.queue.shut_down();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_shutting_down()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
