//! Redis-backed [`KvStore`] implementation.
//!
//! Uses a single multiplexed connection (cheap to clone per operation).
//! Compare-and-delete and the token-bucket step run as Lua scripts so
//! they are atomic with respect to concurrent callers on any replica.
//! The bucket clock comes from the server's `TIME`, keeping refill
//! arithmetic consistent across gateway instances.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::info;

use super::{BucketTake, KvStore};
use crate::{MimirError, Result};

/// Delete the key only when it still holds the expected value.
const DEL_IF_EQ: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// One token-bucket step: lazy refill from the server clock, then
/// consume a token when at least one is available. Tokens are returned
/// as a string to survive Lua's integer conversion of return values.
const BUCKET_TAKE: &str = r#"
local capacity = tonumber(ARGV[1])
local refill = tonumber(ARGV[2])
local ttl_ms = tonumber(ARGV[3])
local t = redis.call('TIME')
local now = tonumber(t[1]) + tonumber(t[2]) / 1000000
local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
    tokens = capacity
    ts = now
end
tokens = math.min(capacity, tokens + (now - ts) * refill)
local allowed = 0
if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
end
redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'ts', tostring(now))
redis.call('PEXPIRE', KEYS[1], ttl_ms)
return {allowed, tostring(tokens)}
"#;

/// [`KvStore`] backed by a Redis-protocol server.
#[derive(Clone)]
pub struct RedisKv {
    conn: MultiplexedConnection,
    del_if_eq: Script,
    bucket_take: Script,
}

impl RedisKv {
    /// Connect to the store at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| MimirError::Configuration(format!("invalid kv endpoint {url}: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(kv_err)?;
        Ok(Self {
            conn,
            del_if_eq: Script::new(DEL_IF_EQ),
            bucket_take: Script::new(BUCKET_TAKE),
        })
    }

    /// Connect with exponential backoff: `attempts` tries, delays
    /// doubling from `initial_delay`. Used by startup probing, where an
    /// unreachable store is fatal only after all attempts.
    pub async fn connect_with_retry(
        url: &str,
        attempts: u32,
        initial_delay: Duration,
    ) -> Result<Self> {
        let mut delay = initial_delay;
        let mut last_err = None;
        for attempt in 0..attempts {
            match Self::connect(url).await {
                Ok(kv) => {
                    kv.ping().await?;
                    info!(url, "connected to kv store");
                    return Ok(kv);
                }
                Err(e @ MimirError::Configuration(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "kv store unreachable, retrying"
                    );
                    if attempt + 1 < attempts {
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

fn kv_err(e: redis::RedisError) -> MimirError {
    MimirError::Kv(e.to_string())
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(kv_err)?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        // SET NX returns nil when the key already exists.
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(result.is_some())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await.map_err(kv_err)?;
        Ok(())
    }

    async fn del_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .del_if_eq
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(deleted > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(kv_err)?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn bucket_take(
        &self,
        key: &str,
        capacity: f64,
        refill_per_second: f64,
        ttl: Duration,
    ) -> Result<BucketTake> {
        let mut conn = self.conn.clone();
        let (allowed, tokens): (i64, String) = self
            .bucket_take
            .key(key)
            .arg(capacity)
            .arg(refill_per_second)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(kv_err)?;
        let tokens = tokens
            .parse::<f64>()
            .map_err(|e| MimirError::Kv(format!("malformed bucket state: {e}")))?;
        Ok(BucketTake {
            allowed: allowed == 1,
            tokens,
        })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(kv_err)?;
        Ok(())
    }
}
