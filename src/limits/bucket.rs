//! In-process token buckets.
//!
//! Buckets are created on first sight of a key and evicted once idle for
//! `idle_ttl`, which keeps memory bounded by the set of recently active
//! clients. State is per process; nothing here is shared across instances.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::Decision;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

#[derive(Debug)]
pub struct TokenBucketLimiter {
    rate: f64,
    burst: f64,
    idle_ttl: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl TokenBucketLimiter {
    /// `rate` tokens per second, at most `burst` saved up.
    #[must_use]
    pub fn new(rate: f64, burst: u32, idle_ttl: Duration) -> Self {
        Self {
            rate: rate.max(f64::MIN_POSITIVE),
            burst: f64::from(burst.max(1)),
            idle_ttl,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, key: &str) -> Decision {
        self.check_at(key, Instant::now()).await
    }

    pub async fn check_at(&self, key: &str, now: Instant) -> Decision {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let remaining = bucket.tokens.floor() as u64;
            Decision::Allowed { remaining }
        } else {
            let wait = (1.0 - bucket.tokens) / self.rate;
            Decision::Limited {
                retry_after: Duration::try_from_secs_f64(wait).unwrap_or(Duration::MAX),
            }
        }
    }

    /// Evict buckets idle for longer than `idle_ttl`.
    pub async fn sweep_at(&self, now: Instant) -> usize {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        let idle_ttl = self.idle_ttl;
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last) < idle_ttl);
        before - buckets.len()
    }

    pub async fn len(&self) -> usize {
        self.buckets.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buckets.lock().await.is_empty()
    }

    /// Sweep every `idle_ttl` until the returned task is aborted.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(limiter.idle_ttl.max(Duration::from_secs(1)));
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = limiter.sweep_at(Instant::now()).await;
                if evicted > 0 {
                    debug!(evicted, "evicted idle rate limit buckets");
                }
            }
        })
    }
}
