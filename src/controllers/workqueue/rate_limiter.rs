//! Requeue delay policies for failed keys.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::time::Duration;
use tokio::time::Instant;

use super::queue::QueueKey;

/// Decides how long a key waits before it is retried
pub trait RateLimiter<T>: Send + Sync {
    /// Delay for the next retry of `item`; counts as a failure
    fn when(&self, item: &T) -> Duration;

    /// Clear the failure history of `item`
    fn forget(&self, item: &T);

    /// Failures recorded for `item` since it was last forgotten
    fn num_requeues(&self, item: &T) -> usize;
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`
pub struct ItemExponentialFailureRateLimiter<T: QueueKey> {
    failures: DashMap<T, u32>,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T: QueueKey> ItemExponentialFailureRateLimiter<T> {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            failures: DashMap::new(),
            base_delay,
            max_delay,
        }
    }
}

impl<T: QueueKey> RateLimiter<T> for ItemExponentialFailureRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        let exponent = {
            let mut failures = self.failures.entry(item.clone()).or_insert(0);
            let exponent = *failures;
            *failures = failures.saturating_add(1);
            exponent
        };

        let backoff = self.base_delay.as_secs_f64() * 2f64.powi(exponent.min(i32::MAX as u32) as i32);
        if !backoff.is_finite() || backoff > self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(backoff)
    }

    fn forget(&self, item: &T) {
        self.failures.remove(item);
    }

    fn num_requeues(&self, item: &T) -> usize {
        self.failures.get(item).map(|f| *f as usize).unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by every key: `qps` refill, `burst` capacity.
/// Each call reserves a token; once the bucket is empty the delay grows with the deficit.
pub struct BucketRateLimiter<T> {
    bucket: Mutex<Bucket>,
    qps: f64,
    burst: f64,
    _key: PhantomData<fn(&T)>,
}

impl<T> BucketRateLimiter<T> {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
            qps,
            burst: f64::from(burst),
            _key: PhantomData,
        }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter<T> {
    fn when(&self, _item: &T) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;

        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 || self.qps <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(-bucket.tokens / self.qps)
    }

    fn forget(&self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> usize {
        0
    }
}

/// Worst case of several limiters
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> usize {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Per-key exponential backoff from 5ms to 1000s, combined with an overall
/// 10 qps / 100 burst bucket
pub fn default_controller_rate_limiter<T: QueueKey>() -> MaxOfRateLimiter<T> {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}
