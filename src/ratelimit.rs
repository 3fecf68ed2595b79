//! Token-bucket rate limiting, one bucket per credential.
//!
//! Bucket state lives in the key/value store so the limit holds across
//! gateway replicas. The read-refill-consume-write step runs as one
//! atomic operation on the store side ([`KvStore::bucket_take`]);
//! concurrent calls for the same credential cannot interleave.
//!
//! A token bucket rather than a fixed window: windows allow a burst of
//! 2× capacity at the boundary, a bucket bounds any interval of length
//! W to capacity + refill_rate × W.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::kv::KvStore;

/// Outcome of a rate-limit check, carried into response headers.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    /// Bucket capacity.
    pub limit: u32,
    /// Whole tokens left after this request.
    pub remaining: u32,
    /// Unix seconds when the bucket is full again.
    pub reset_at: u64,
    /// How long to wait for the next token; set when denied.
    pub retry_after: Option<Duration>,
}

/// Per-credential token-bucket rate limiter.
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    key_prefix: String,
    capacity: u32,
    window: Duration,
}

impl RateLimiter {
    /// Create a limiter allowing `capacity` requests per `window` with
    /// continuous refill.
    pub fn new(
        kv: Arc<dyn KvStore>,
        key_prefix: impl Into<String>,
        capacity: u32,
        window: Duration,
    ) -> Self {
        Self {
            kv,
            key_prefix: key_prefix.into(),
            capacity,
            window,
        }
    }

    fn refill_per_second(&self) -> f64 {
        self.capacity as f64 / self.window.as_secs_f64()
    }

    /// Check and consume one token for `credential`.
    ///
    /// Fails open when the store is unreachable: availability is
    /// preferred over enforcement, and the outage is logged.
    pub async fn check_and_consume(&self, credential: &str) -> RateDecision {
        let now = unix_now();

        if self.capacity == 0 {
            // Nothing ever refills an empty bucket.
            return RateDecision {
                allowed: false,
                limit: 0,
                remaining: 0,
                reset_at: now + self.window.as_secs(),
                retry_after: Some(self.window),
            };
        }

        let key = format!("{}:{}", self.key_prefix, credential);
        let rate = self.refill_per_second();
        // Bucket state may idle for a full window and still matter.
        let state_ttl = self.window * 2;

        match self
            .kv
            .bucket_take(&key, self.capacity as f64, rate, state_ttl)
            .await
        {
            Ok(take) if take.allowed => RateDecision {
                allowed: true,
                limit: self.capacity,
                remaining: take.tokens.floor() as u32,
                reset_at: now + ((self.capacity as f64 - take.tokens) / rate).ceil() as u64,
                retry_after: None,
            },
            Ok(take) => {
                let wait = (1.0 - take.tokens).max(0.0) / rate;
                RateDecision {
                    allowed: false,
                    limit: self.capacity,
                    remaining: 0,
                    reset_at: now + wait.ceil() as u64,
                    retry_after: Some(Duration::from_secs_f64(wait)),
                }
            }
            Err(e) => {
                let shown: String = credential.chars().take(8).collect();
                warn!(credential = %shown, error = %e, "rate limiter unavailable, failing open");
                RateDecision {
                    allowed: true,
                    limit: self.capacity,
                    remaining: self.capacity,
                    reset_at: now,
                    retry_after: None,
                }
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
