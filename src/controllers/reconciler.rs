//! # Reconciliation Loop
//!
//! [`Controller`] drives a [`Reconciler`] from a [`RateLimitingQueue`]:
//!
//! 1. wait until every observed-state cache reports synced
//! 2. start `workers` tasks, each popping one key at a time
//! 3. success forgets the key's backoff history; an error or a panic goes to
//!    the [`ErrorSink`] and the key is requeued with backoff, without limit
//! 4. on stop, shut the queue down and wait for the workers to drain
//!
//! The queue guarantees a key is never reconciled by two workers at once.

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::controllers::workqueue::{QueueKey, RateLimitingQueue, WorkQueueError};
use crate::core::error::{ApiServerError, ApiServerResult};
use crate::middleware::panic_recovery::panic_message;
use crate::observability::metrics;

/// Brings observed state for one key in line with desired state
#[async_trait]
pub trait Reconciler<K: Send + Sync>: Send + Sync {
    async fn reconcile(&self, key: &K) -> ApiServerResult<()>;
}

/// Destination for non-fatal reconciliation errors
pub trait ErrorSink: Send + Sync {
    fn handle_error(&self, controller: &str, key: &str, err: &ApiServerError);
}

/// Logs every error at `error` level
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn handle_error(&self, controller: &str, key: &str, err: &ApiServerError) {
        error!(
            controller = controller,
            key = key,
            error_type = err.error_type(),
            error = %err,
            "{} failed with : {}",
            key,
            err
        );
    }
}

/// Reports whether an observed-state cache has completed its initial fill
pub type InformerSynced = Arc<dyn Fn() -> bool + Send + Sync>;

const CACHE_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll until every cache is synced. `false` if `stop` fires first.
pub async fn wait_for_cache_sync(
    controller: &str,
    synced: &[InformerSynced],
    stop: &CancellationToken,
) -> bool {
    info!(controller = controller, "Waiting for caches to sync for {} controller", controller);
    loop {
        if synced.iter().all(|is_synced| is_synced()) {
            info!(controller = controller, "Caches are synced for {} controller", controller);
            return true;
        }
        tokio::select! {
            _ = stop.cancelled() => {
                error!(controller = controller, "Unable to sync caches for {} controller", controller);
                return false;
            }
            _ = tokio::time::sleep(CACHE_SYNC_POLL_INTERVAL) => {}
        }
    }
}

pub struct Controller<K: QueueKey> {
    name: String,
    queue: Arc<RateLimitingQueue<K>>,
    reconciler: Arc<dyn Reconciler<K>>,
    cache_synced: Vec<InformerSynced>,
    errors: Arc<dyn ErrorSink>,
}

impl<K: QueueKey> Controller<K> {
    pub fn new<S: Into<String>>(
        name: S,
        queue: Arc<RateLimitingQueue<K>>,
        reconciler: Arc<dyn Reconciler<K>>,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            reconciler,
            cache_synced: Vec::new(),
            errors: Arc::new(LogErrorSink),
        }
    }

    pub fn with_cache_synced(mut self, synced: InformerSynced) -> Self {
        self.cache_synced.push(synced);
        self
    }

    pub fn with_error_sink(mut self, errors: Arc<dyn ErrorSink>) -> Self {
        self.errors = errors;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> Arc<RateLimitingQueue<K>> {
        Arc::clone(&self.queue)
    }

    /// Run until `stop` fires. Fails only when the caches never sync.
    pub async fn run(self, workers: usize, stop: CancellationToken) -> Result<(), WorkQueueError> {
        let controller = Arc::new(self);
        info!(controller = %controller.name, "Starting {} controller", controller.name);

        if !wait_for_cache_sync(&controller.name, &controller.cache_synced, &stop).await {
            controller.queue.shut_down();
            return Err(WorkQueueError::CacheSyncFailed {
                controller: controller.name.clone(),
            });
        }

        let handles: Vec<_> = (0..workers.max(1))
            .map(|worker| {
                let controller = Arc::clone(&controller);
                tokio::spawn(async move {
                    while controller.process_next_work_item().await {}
                    debug!(controller = %controller.name, worker, "Worker exited");
                })
            })
            .collect();

        stop.cancelled().await;
        controller.queue.shut_down();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(controller = %controller.name, error = %e, "Worker task failed");
            }
        }

        info!(controller = %controller.name, "Shutting down {} controller", controller.name);
        Ok(())
    }

    /// Handle one key. `false` once the queue has shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.reconciler.reconcile(&key))
            .catch_unwind()
            .await;
        metrics::record_workqueue_work_duration(self.queue.name(), started.elapsed());

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(payload) => Some(ApiServerError::internal(format!(
                "panic: {}",
                panic_message(payload.as_ref())
            ))),
        };

        match failure {
            None => self.queue.forget(&key),
            Some(err) => {
                self.errors
                    .handle_error(&self.name, &format!("{:?}", key), &err);
                self.queue.add_rate_limited(key.clone());
            }
        }
        self.queue.done(&key);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FlakyReconciler {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl Reconciler<String> for FlakyReconciler {
        async fn reconcile(&self, _key: &String) -> ApiServerResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(ApiServerError::internal("not yet"));
            }
            Ok(())
        }
    }

    struct PanickingReconciler;

    #[async_trait]
    impl Reconciler<String> for PanickingReconciler {
        async fn reconcile(&self, _key: &String) -> ApiServerResult<()> {
            panic!("sync exploded");
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        errors: Mutex<Vec<String>>,
    }

    impl ErrorSink for RecordingSink {
        fn handle_error(&self, _controller: &str, key: &str, err: &ApiServerError) {
            self.errors.lock().push(format!("{}: {}", key, err));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn error_requeues_until_success() {
        let queue = Arc::new(RateLimitingQueue::with_default_limiter("test"));
        let reconciler = Arc::new(FlakyReconciler {
            calls: AtomicUsize::new(0),
            fail_first: 2,
        });
        let sink = Arc::new(RecordingSink::default());
        let controller = Controller::new("test", Arc::clone(&queue), reconciler.clone())
            .with_error_sink(sink.clone());

        queue.add("v1.apps".to_string());
        assert!(controller.process_next_work_item().await);
        assert_eq!(queue.num_requeues(&"v1.apps".to_string()), 1);

        assert!(controller.process_next_work_item().await);
        assert_eq!(queue.num_requeues(&"v1.apps".to_string()), 2);

        assert!(controller.process_next_work_item().await);
        assert_eq!(queue.num_requeues(&"v1.apps".to_string()), 0);
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sink.errors.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn panic_is_reported_and_requeued() {
        let queue = Arc::new(RateLimitingQueue::with_default_limiter("test"));
        let sink = Arc::new(RecordingSink::default());
        let controller = Controller::new("test", Arc::clone(&queue), Arc::new(PanickingReconciler))
            .with_error_sink(sink.clone());

        queue.add("crd".to_string());
        assert!(controller.process_next_work_item().await);
        assert_eq!(queue.num_requeues(&"crd".to_string()), 1);
        assert!(sink.errors.lock()[0].contains("sync exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_cache_sync_before_working() {
        let synced = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&synced);
        let queue = Arc::new(RateLimitingQueue::with_default_limiter("test"));
        let reconciler = Arc::new(FlakyReconciler {
            calls: AtomicUsize::new(0),
            fail_first: 0,
        });
        let controller = Controller::new("test", Arc::clone(&queue), reconciler.clone())
            .with_cache_synced(Arc::new(move || flag.load(Ordering::SeqCst)));

        queue.add("v1.".to_string());
        let stop = CancellationToken::new();
        let running = tokio::spawn(controller.run(2, stop.clone()));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 0);

        synced.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 1);

        stop.cancel();
        assert_eq!(running.await.unwrap(), Ok(()));
        assert!(queue.is_shutting_down());
    }

    #[tokio::test]
    async fn unsynced_cache_fails_on_stop() {
        let queue = Arc::new(RateLimitingQueue::<String>::with_default_limiter("test"));
        let controller = Controller::new(
            "never",
            queue,
            Arc::new(FlakyReconciler {
                calls: AtomicUsize::new(0),
                fail_first: 0,
            }),
        )
        .with_cache_synced(Arc::new(|| false));
        let stop = CancellationToken::new();
        stop.cancel();
        assert_eq!(
            controller.run(1, stop).await,
            Err(WorkQueueError::CacheSyncFailed {
                controller: "never".to_string()
            })
        );
    }
}
