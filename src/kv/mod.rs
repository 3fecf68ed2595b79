//! Key/value store interface and implementations.
//!
//! The cache, single-flight locks, and rate-limit buckets all live in a
//! remote key/value store. Components depend only on the [`KvStore`]
//! trait; any store providing byte-transparent values, per-key TTL,
//! atomic set-if-absent, compare-and-delete, a scripted token-bucket
//! step, prefix scan, and a liveness probe is acceptable.

mod memory;
mod redis;

pub use memory::MemoryKv;
pub use redis::RedisKv;

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::{MimirError, Result};

/// Outcome of one atomic token-bucket step.
#[derive(Debug, Clone, Copy)]
pub struct BucketTake {
    /// Whether a token was consumed.
    pub allowed: bool,
    /// Tokens remaining after the step (fractional during refill).
    pub tokens: f64,
}

/// Typed interface over the remote key/value store.
///
/// Values are opaque byte strings. Every mutation used for coordination
/// (locks, buckets) is atomic on the store side.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a value with a TTL.
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Write a value with a TTL only if the key is absent.
    /// Returns true when the write happened.
    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Delete a key.
    async fn del(&self, key: &str) -> Result<()>;

    /// Delete a key only if its current value equals `expected`.
    /// Returns true when the key was deleted.
    async fn del_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Enumerate keys bearing `prefix`. Cursor-based on the store side;
    /// linear in the number of stored keys.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Perform one atomic token-bucket step on `key`: lazily refill at
    /// `refill_per_second` up to `capacity`, then consume one token if
    /// at least one is available. The bucket state expires after `ttl`
    /// of inactivity.
    async fn bucket_take(
        &self,
        key: &str,
        capacity: f64,
        refill_per_second: f64,
        ttl: Duration,
    ) -> Result<BucketTake>;

    /// Liveness probe.
    async fn ping(&self) -> Result<()>;

    /// Probe with exponential backoff: `attempts` tries, delays doubling
    /// from `initial_delay` between them.
    async fn ping_with_retry(&self, attempts: u32, initial_delay: Duration) -> Result<()> {
        let mut delay = initial_delay;
        let mut last_err = None;
        for attempt in 0..attempts {
            match self.ping().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if attempt + 1 < attempts {
                        warn!(
                            attempt = attempt + 1,
                            attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "kv store unreachable, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| MimirError::Kv("store unreachable".to_string())))
    }
}
