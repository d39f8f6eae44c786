//! Per-client token-bucket quota.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock, duration_ms};
use crate::config::RateLimitConfig;

/// Outcome of one quota check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuotaDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Bucket capacity.
    pub limit: u32,
    /// Tokens left after this request.
    pub remaining: u32,
    /// Epoch milliseconds of the next refill.
    pub reset_at_ms: i64,
}

impl QuotaDecision {
    /// Next refill as an RFC 3339 timestamp with millisecond precision.
    #[must_use]
    pub fn reset_rfc3339(&self) -> String {
        DateTime::<Utc>::from_timestamp_millis(self.reset_at_ms)
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Decides whether a client may make another request.
pub trait QuotaChecker: Send + Sync {
    /// Spend one unit of `key`'s quota.
    fn consume(&self, key: &str) -> QuotaDecision;
}

#[derive(Clone, Copy, Debug)]
struct Bucket {
    tokens: u32,
    last_refill_ms: i64,
}

impl Bucket {
    /// Tokens after applying every whole refill interval elapsed by `now`.
    fn refilled(self, now: i64, interval: i64, refill: u32, capacity: u32) -> Self {
        let elapsed = now.saturating_sub(self.last_refill_ms);
        if elapsed < interval {
            return self;
        }
        let intervals = elapsed / interval;
        let added = u64::try_from(intervals).unwrap_or(u64::MAX).saturating_mul(u64::from(refill));
        let tokens = u64::from(self.tokens).saturating_add(added).min(u64::from(capacity));
        Self {
            tokens: u32::try_from(tokens).unwrap_or(capacity),
            last_refill_ms: self.last_refill_ms.saturating_add(intervals.saturating_mul(interval)),
        }
    }
}

/// In-process token buckets keyed by client.
///
/// A new client starts with a full bucket. Every elapsed `interval` adds
/// `refill` tokens, capped at `capacity`.
pub struct TokenBucketLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Bucket>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    /// Create a limiter on the system clock.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a limiter with an explicit clock.
    #[must_use]
    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            clock,
        }
    }

    /// Number of tracked clients.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }

    /// Drop buckets that would be full again, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let interval = self.interval_ms();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            bucket.refilled(now, interval, self.config.refill, self.config.capacity).tokens < self.config.capacity
        });
        before.saturating_sub(self.buckets.len())
    }

    fn interval_ms(&self) -> i64 {
        duration_ms(self.config.interval).max(1)
    }
}

impl QuotaChecker for TokenBucketLimiter {
    fn consume(&self, key: &str) -> QuotaDecision {
        let now = self.clock.now_ms();
        let interval = self.interval_ms();
        let capacity = self.config.capacity;

        let mut entry = self.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            last_refill_ms: now,
        });
        let mut bucket = entry.refilled(now, interval, self.config.refill, capacity);
        let allowed = bucket.tokens > 0;
        if allowed {
            bucket.tokens -= 1;
        }
        *entry = bucket;

        QuotaDecision {
            allowed,
            limit: capacity,
            remaining: bucket.tokens,
            reset_at_ms: bucket.last_refill_ms.saturating_add(interval),
        }
    }
}

/// Background task that periodically sweeps idle buckets.
pub struct BucketSweeper {
    limiter: Arc<TokenBucketLimiter>,
    shutdown: CancellationToken,
}

impl BucketSweeper {
    /// Create a sweeper for `limiter`.
    #[must_use]
    pub fn new(limiter: Arc<TokenBucketLimiter>) -> Self {
        Self {
            limiter,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the sweeper when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the sweeper as a tokio task.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        let interval = self.limiter.config.sweep_interval;
        if interval.is_zero() {
            info!("Rate limit sweeper is disabled");
            return;
        }
        info!(?interval, "Starting rate limit sweeper");

        loop {
            tokio::select! {
                () = tokio::time::sleep(interval) => {
                    let removed = self.limiter.sweep();
                    debug!(removed, tracked = self.limiter.tracked(), "Swept idle rate limit buckets");
                }
                () = self.shutdown.cancelled() => {
                    info!("Rate limit sweeper shutting down");
                    break;
                }
            }
        }
    }
}
