//! Token-bucket rate limiter with refunds
//!
//! Sized by the embedding provider's published rate (e.g. 50 requests per
//! 10 s). Callers borrow a token per batch; refundable failures (network,
//! timeout, 5xx) return the token, non-refundable failures (4xx, 429) do
//! not. Waiters queue FIFO behind an async mutex, with an optional deadline.

use std::time::Duration;

use tokio::time::Instant;

/// Internal bucket state
struct Bucket {
    tokens: usize,
    last_refill: Instant,
}

/// Token-bucket rate limiter
pub struct RateLimiter {
    capacity: usize,
    /// Time to mint one token
    per_token: Duration,
    bucket: std::sync::Mutex<Bucket>,
    /// Serializes waiters so acquisition is FIFO
    queue: tokio::sync::Mutex<()>,
}

impl RateLimiter {
    /// A bucket holding `capacity` tokens, refilled evenly over `window`
    pub fn new(capacity: usize, window: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            per_token: window / capacity as u32,
            bucket: std::sync::Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            queue: tokio::sync::Mutex::new(()),
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        if bucket.tokens >= self.capacity {
            bucket.last_refill = Instant::now();
            return;
        }
        let elapsed = bucket.last_refill.elapsed();
        let minted = (elapsed.as_nanos() / self.per_token.as_nanos().max(1)) as usize;
        if minted > 0 {
            bucket.tokens = (bucket.tokens + minted).min(self.capacity);
            bucket.last_refill += self.per_token * minted as u32;
        }
    }

    fn try_take(&self) -> Option<Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut bucket);
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            None
        } else {
            // Time until the next token is minted
            Some(
                self.per_token
                    .saturating_sub(bucket.last_refill.elapsed()),
            )
        }
    }

    /// Borrow a token, waiting for a refill if the bucket is empty
    pub async fn acquire(&self) {
        let _queue = self.queue.lock().await;
        loop {
            match self.try_take() {
                None => return,
                Some(wait) => tokio::time::sleep(wait.max(Duration::from_millis(1))).await,
            }
        }
    }

    /// Borrow a token before `deadline`. Returns false when the deadline
    /// passes first; no token is consumed in that case.
    pub async fn acquire_before(&self, deadline: Instant) -> bool {
        tokio::time::timeout_at(deadline, self.acquire()).await.is_ok()
    }

    /// Return a token after a refundable failure
    pub fn refund(&self) {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        bucket.tokens = (bucket.tokens + 1).min(self.capacity);
    }

    /// Currently available tokens, after refill accounting
    pub fn available(&self) -> usize {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        self.refill(&mut bucket);
        bucket.tokens
    }
}

// ============================================================================
// TESTS
// ============================================================================
