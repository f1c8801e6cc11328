use std::{
    collections::HashMap,
    time::Duration,
};

use tokio::{
    sync::Mutex,
    time::Instant,
};

// Buckets untouched for this long are dropped on the next admission check.
// A full refill takes 60s, so eviction never grants tokens a live bucket
// would not have accrued anyway.
const IDLE_BUCKET_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_secs: u64,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_sec: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: now,
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn retry_after_secs(&self) -> u64 {
        let needed = 1.0 - self.tokens;
        (needed / self.refill_per_sec).ceil().max(1.0) as u64
    }
}

/// Per-client token-bucket admission. One mutex guards the map and every
/// bucket in it, so concurrent decisions for the same client are linearized
/// by lock acquisition order.
pub struct ClientRateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    capacity: f64,
    refill_per_sec: f64,
}

impl ClientRateLimiter {
    pub fn new(max_requests_per_minute: u32) -> Self {
        let capacity = max_requests_per_minute.max(1) as f64;
        Self {
            buckets: Mutex::new(HashMap::new()),
            capacity,
            refill_per_sec: capacity / 60.0,
        }
    }

    pub async fn check(&self, client_id: &str) -> AdmissionDecision {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        buckets.retain(|_, bucket| now.duration_since(bucket.last_refill) < IDLE_BUCKET_TTL);

        let bucket = buckets
            .entry(client_id.to_string())
            .or_insert_with(|| TokenBucket::new(self.capacity, self.refill_per_sec, now));

        if bucket.try_take(now) {
            AdmissionDecision {
                allowed: true,
                remaining: bucket.tokens.floor() as u64,
                retry_after_secs: 0,
            }
        } else {
            AdmissionDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs: bucket.retry_after_secs(),
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn bucket_count(&self) -> usize {
        self.buckets.lock().await.len()
    }
}
