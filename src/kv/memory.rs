//! In-process [`KvStore`] with real TTL expiry.
//!
//! Backs tests and single-process deployments. Expiry is lazy: entries
//! past their deadline are treated as absent on access. Bucket updates
//! are serialised by the same mutex that guards the map, which gives
//! the atomicity the trait requires within one process.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{BucketTake, KvStore};
use crate::Result;

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    expires_at: Instant,
}

/// In-memory key/value store.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl MemoryKv {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(key) {
            if existing.live(now) {
                return Ok(false);
            }
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn del_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.live(now) && entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.live(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn bucket_take(
        &self,
        key: &str,
        capacity: f64,
        refill_per_second: f64,
        ttl: Duration,
    ) -> Result<BucketTake> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap();
        let stale = !matches!(buckets.get(key), Some(bucket) if now < bucket.expires_at);
        if stale {
            buckets.insert(
                key.to_string(),
                Bucket {
                    tokens: capacity,
                    last_refill: now,
                    expires_at: now + ttl,
                },
            );
        }
        let bucket = buckets.get_mut(key).expect("bucket inserted above");

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = capacity.min(bucket.tokens + elapsed * refill_per_second);
        bucket.last_refill = now;
        bucket.expires_at = now + ttl;

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }
        Ok(BucketTake {
            allowed,
            tokens: bucket.tokens,
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
