//! Rate limiting of stage execution
//!
//! Token buckets keyed by task type. The notification stage gets its own rate
//! so a burst of finished pipelines does not flood the mail relay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use orbital_core::models::TaskType;

/// Rate applied to stages without a dedicated setting, in tasks per second.
const DEFAULT_STAGE_RATE: f64 = 50.0;

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket holding two seconds of burst, and never less than one
    /// token so that slow rates still admit a task.
    fn with_rate(rate: f64) -> Self {
        let capacity = (rate * 2.0).max(1.0);
        Self {
            tokens: capacity,
            capacity,
            refill_rate: rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available.
    fn take(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let missing = 1.0 - self.tokens;
        Err(Duration::from_secs_f64((missing / self.refill_rate).max(0.0)))
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<TaskType, TokenBucket>>>,
    default_rate: f64,
    notify_rate: f64,
}

impl RateLimiter {
    /// `notify_rate` caps the notification stage; every other stage uses the
    /// default rate.
    pub fn new(notify_rate: f64) -> Self {
        Self::with_rates(DEFAULT_STAGE_RATE, notify_rate)
    }

    pub fn with_rates(default_rate: f64, notify_rate: f64) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            default_rate,
            notify_rate,
        }
    }

    fn rate_for(&self, task_type: TaskType) -> f64 {
        match task_type {
            TaskType::SendNotification => self.notify_rate,
            _ => self.default_rate,
        }
    }

    async fn take(&self, task_type: TaskType) -> Result<f64, Duration> {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(task_type)
            .or_insert_with(|| TokenBucket::with_rate(self.rate_for(task_type)));
        bucket.take().map(|()| bucket.tokens)
    }

    /// Wait until a token for `task_type` is available and take it.
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self, task_type: TaskType) {
        loop {
            match self.take(task_type).await {
                Ok(remaining) => {
                    tracing::trace!(
                        task_type = %task_type,
                        tokens_remaining = remaining,
                        "Rate limit token acquired"
                    );
                    return;
                }
                Err(wait) => {
                    tracing::debug!(
                        task_type = %task_type,
                        wait_ms = wait.as_millis() as u64,
                        "Rate limit reached, waiting for token"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Take a token without waiting.
    pub async fn try_acquire(&self, task_type: TaskType) -> bool {
        self.take(task_type).await.is_ok()
    }

    pub async fn available_tokens(&self, task_type: TaskType) -> f64 {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(task_type)
            .or_insert_with(|| TokenBucket::with_rate(self.rate_for(task_type)));
        bucket.refill();
        bucket.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notification_bucket_capacity() {
        let limiter = RateLimiter::with_rates(5.0, 2.0);

        assert_eq!(limiter.available_tokens(TaskType::SendNotification).await, 4.0);
        assert_eq!(limiter.available_tokens(TaskType::WriteDocument).await, 10.0);
    }

    #[tokio::test]
    async fn test_try_acquire_drains_bucket() {
        let limiter = RateLimiter::with_rates(5.0, 1.0);

        // capacity 2.0 at 1 token/sec
        assert!(limiter.try_acquire(TaskType::SendNotification).await);
        assert!(limiter.try_acquire(TaskType::SendNotification).await);
        assert!(!limiter.try_acquire(TaskType::SendNotification).await);

        // other stages keep their own bucket
        assert!(limiter.try_acquire(TaskType::SetStatus).await);
    }

    #[tokio::test]
    async fn test_refill_after_drain() {
        let limiter = RateLimiter::new(10.0);

        for _ in 0..20 {
            limiter.acquire(TaskType::SendNotification).await;
        }
        let drained = limiter.available_tokens(TaskType::SendNotification).await;
        assert!(drained < 1.0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let refilled = limiter.available_tokens(TaskType::SendNotification).await;
        assert!(refilled > drained);
    }

    #[tokio::test]
    async fn test_slow_rate_still_admits_tasks() {
        let limiter = RateLimiter::new(0.2);
        assert_eq!(limiter.available_tokens(TaskType::SendNotification).await, 1.0);

        tokio::time::timeout(
            Duration::from_secs(1),
            limiter.acquire(TaskType::SendNotification),
        )
        .await
        .expect("a full bucket admits one task immediately");
        assert!(!limiter.try_acquire(TaskType::SendNotification).await);
    }

    #[tokio::test]
    async fn test_slow_rate_refills_a_whole_token() {
        // Capacity floors at one token; one token every 2.5 seconds.
        let limiter = RateLimiter::new(0.4);
        assert!(limiter.try_acquire(TaskType::SendNotification).await);

        tokio::time::timeout(
            Duration::from_secs(4),
            limiter.acquire(TaskType::SendNotification),
        )
        .await
        .expect("a token refills within 2.5 seconds at 0.4 tokens/s");
    }

    #[tokio::test]
    async fn test_acquire_waits_for_token() {
        let limiter = RateLimiter::with_rates(5.0, 20.0);
        while limiter.try_acquire(TaskType::SendNotification).await {}

        tokio::time::timeout(
            Duration::from_secs(1),
            limiter.acquire(TaskType::SendNotification),
        )
        .await
        .expect("token should refill within a second");
    }
}
