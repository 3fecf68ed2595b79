//! Cache-layer semantics atop the key/value store.
//!
//! Responses are keyed by a fingerprint of `(prompt, model)`. Each entry
//! is two keys under the same TTL: the response text at
//! `<prefix>:<fingerprint>`, and a sidecar at
//! `<prefix>:<fingerprint>:embedding` carrying the original prompt plus
//! the embedding as a little-endian float array. An entry whose sidecar
//! write failed still serves exact hits.
//!
//! Semantic lookup is a linear scan over all stored sidecars. That is
//! acceptable while the stored count stays modest (a few thousand
//! entries); beyond that an approximate-nearest-neighbor index should
//! replace the walk behind [`SemanticCache::find_semantic_match`].
//!
//! Single-flight locks live under a separate prefix so the semantic
//! scan never touches them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::kv::KvStore;
use crate::telemetry;
use crate::Result;

/// Stable fingerprint for `(prompt, model)`.
///
/// SHA-256 over the length-framed prompt followed by the model
/// identifier, hex-encoded. Byte-equal inputs produce equal
/// fingerprints across processes and restarts; no normalization is
/// applied.
pub fn fingerprint(prompt: &str, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((prompt.len() as u64).to_le_bytes());
    hasher.update(prompt.as_bytes());
    hasher.update(model.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cosine similarity, clamped to [-1, 1]. Zero-norm vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
}

/// Encode the sidecar blob: `[u32 LE prompt_len][prompt][f32 LE ...]`.
///
/// Floats are serialized byte-exact so a stored embedding survives the
/// round-trip bit-for-bit.
fn encode_sidecar(prompt: &str, embedding: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + prompt.len() + embedding.len() * 4);
    out.extend_from_slice(&(prompt.len() as u32).to_le_bytes());
    out.extend_from_slice(prompt.as_bytes());
    for value in embedding {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Decode a sidecar blob. Returns `None` on any framing violation.
fn decode_sidecar(bytes: &[u8]) -> Option<(String, Vec<f32>)> {
    let prompt_len = u32::from_le_bytes(bytes.get(..4)?.try_into().ok()?) as usize;
    let prompt_end = 4usize.checked_add(prompt_len)?;
    let prompt = std::str::from_utf8(bytes.get(4..prompt_end)?).ok()?.to_string();
    let vector_bytes = bytes.get(prompt_end..)?;
    if vector_bytes.len() % 4 != 0 {
        return None;
    }
    let embedding = vector_bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Some((prompt, embedding))
}

/// An exact-lookup result.
#[derive(Debug, Clone)]
pub struct CachedEntry {
    /// Original prompt, when the sidecar is present.
    pub prompt: Option<String>,
    pub response: String,
    pub embedding: Option<Vec<f32>>,
}

/// One stored entry as seen by the semantic scan.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub fingerprint: String,
    pub prompt: String,
    pub response: String,
    pub embedding: Vec<f32>,
}

/// Best semantic match at or above the threshold.
#[derive(Debug, Clone)]
pub struct SemanticMatch {
    pub fingerprint: String,
    pub prompt: String,
    pub response: String,
    pub similarity: f32,
}

/// Aggregate cache counters for the operator summary endpoint.
///
/// Best-effort in-process numbers; they reset on restart and are not
/// authoritative state.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_requests: u64,
    pub exact_hits: u64,
    pub semantic_hits: u64,
    pub misses: u64,
    pub hit_rate_percent: f64,
    pub stored_items: u64,
}

/// Cache component over the key/value store.
pub struct SemanticCache {
    kv: Arc<dyn KvStore>,
    key_prefix: String,
    lock_prefix: String,
    exact_hits: AtomicU64,
    semantic_hits: AtomicU64,
    misses: AtomicU64,
}

impl SemanticCache {
    /// Create a cache using `key_prefix` for entries and `lock_prefix`
    /// for single-flight locks.
    pub fn new(
        kv: Arc<dyn KvStore>,
        key_prefix: impl Into<String>,
        lock_prefix: impl Into<String>,
    ) -> Self {
        Self {
            kv,
            key_prefix: key_prefix.into(),
            lock_prefix: lock_prefix.into(),
            exact_hits: AtomicU64::new(0),
            semantic_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn response_key(&self, fingerprint: &str) -> String {
        format!("{}:{}", self.key_prefix, fingerprint)
    }

    fn embedding_key(&self, fingerprint: &str) -> String {
        format!("{}:{}:embedding", self.key_prefix, fingerprint)
    }

    fn lock_key(&self, fingerprint: &str) -> String {
        format!("{}:{}", self.lock_prefix, fingerprint)
    }

    /// Exact lookup by fingerprint.
    pub async fn get_exact(&self, fingerprint: &str) -> Result<Option<CachedEntry>> {
        let Some(raw) = self.kv.get(&self.response_key(fingerprint)).await? else {
            return Ok(None);
        };
        let response = String::from_utf8_lossy(&raw).into_owned();

        let (prompt, embedding) = match self.kv.get(&self.embedding_key(fingerprint)).await? {
            Some(blob) => match decode_sidecar(&blob) {
                Some((prompt, vector)) => (Some(prompt), Some(vector)),
                None => {
                    warn!(fingerprint, "discarding undecodable embedding sidecar");
                    (None, None)
                }
            },
            None => (None, None),
        };

        Ok(Some(CachedEntry {
            prompt,
            response,
            embedding,
        }))
    }

    /// Enumerate every stored entry that carries an embedding.
    ///
    /// Linear in the number of stored entries.
    pub async fn scan_all(&self) -> Result<Vec<StoredEntry>> {
        let prefix = format!("{}:", self.key_prefix);
        let keys = self.kv.scan_prefix(&prefix).await?;
        let mut entries = Vec::new();
        for key in keys {
            if key.ends_with(":embedding") {
                continue;
            }
            let fingerprint = key[prefix.len()..].to_string();
            // Entries may expire between the scan and these reads.
            let Some(raw) = self.kv.get(&key).await? else {
                continue;
            };
            let Some(blob) = self.kv.get(&self.embedding_key(&fingerprint)).await? else {
                continue;
            };
            let Some((prompt, embedding)) = decode_sidecar(&blob) else {
                continue;
            };
            entries.push(StoredEntry {
                fingerprint,
                prompt,
                response: String::from_utf8_lossy(&raw).into_owned(),
                embedding,
            });
        }
        Ok(entries)
    }

    /// Find the best-scoring stored entry whose cosine similarity to
    /// `query` is at or above `threshold`.
    ///
    /// Ties keep the first entry encountered in scan order. Entries
    /// whose stored dimension differs from the query (producer version
    /// skew) are skipped.
    pub async fn find_semantic_match(
        &self,
        query: &[f32],
        threshold: f32,
    ) -> Result<Option<SemanticMatch>> {
        let entries = self.scan_all().await?;
        let mut best: Option<SemanticMatch> = None;
        for entry in entries {
            if entry.embedding.len() != query.len() {
                debug!(
                    fingerprint = %entry.fingerprint,
                    stored = entry.embedding.len(),
                    query = query.len(),
                    "skipping entry with mismatched embedding dimension"
                );
                continue;
            }
            let similarity = cosine_similarity(query, &entry.embedding);
            if similarity < threshold {
                continue;
            }
            let better = match best {
                Some(ref current) => similarity > current.similarity,
                None => true,
            };
            if better {
                best = Some(SemanticMatch {
                    fingerprint: entry.fingerprint,
                    prompt: entry.prompt,
                    response: entry.response,
                    similarity,
                });
            }
        }
        Ok(best)
    }

    /// Store a response and, when available, its prompt + embedding
    /// sidecar under the same TTL.
    ///
    /// The response write comes first and its failure propagates; a
    /// failed sidecar write only degrades the entry to exact-hit-only.
    pub async fn set(
        &self,
        fingerprint: &str,
        prompt: &str,
        response: &str,
        embedding: Option<&[f32]>,
        ttl: Duration,
    ) -> Result<()> {
        self.kv
            .set_ex(&self.response_key(fingerprint), response.as_bytes(), ttl)
            .await?;
        if let Some(vector) = embedding {
            if let Err(e) = self
                .kv
                .set_ex(
                    &self.embedding_key(fingerprint),
                    &encode_sidecar(prompt, vector),
                    ttl,
                )
                .await
            {
                warn!(
                    fingerprint,
                    error = %e,
                    "embedding sidecar write failed; entry serves exact hits only"
                );
            }
        }
        Ok(())
    }

    /// Attempt to acquire the single-flight lock for `fingerprint`.
    /// Returns false when another holder has it.
    pub async fn try_acquire_lock(
        &self,
        fingerprint: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<bool> {
        self.kv
            .set_nx_ex(&self.lock_key(fingerprint), holder_id.as_bytes(), ttl)
            .await
    }

    /// Release the lock only if we still hold it. A lock that expired
    /// and was re-acquired by another holder is left alone.
    pub async fn release_lock(&self, fingerprint: &str, holder_id: &str) -> Result<bool> {
        self.kv
            .del_if_eq(&self.lock_key(fingerprint), holder_id.as_bytes())
            .await
    }

    /// Record an exact hit in the counters and outcome metrics.
    pub fn record_exact_hit(&self) {
        self.exact_hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::CACHE_OUTCOMES_TOTAL, "type" => "exact").increment(1);
    }

    /// Record a semantic hit in the counters and outcome metrics.
    pub fn record_semantic_hit(&self) {
        self.semantic_hits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::CACHE_OUTCOMES_TOTAL, "type" => "semantic").increment(1);
    }

    /// Record a miss in the counters and outcome metrics.
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(telemetry::CACHE_OUTCOMES_TOTAL, "type" => "miss").increment(1);
    }

    /// Aggregate counters plus a stored-item estimate (one prefix scan).
    pub async fn stats(&self) -> Result<CacheStats> {
        let exact_hits = self.exact_hits.load(Ordering::Relaxed);
        let semantic_hits = self.semantic_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = exact_hits + semantic_hits + misses;
        let hit_rate = if total > 0 {
            (exact_hits + semantic_hits) as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        let prefix = format!("{}:", self.key_prefix);
        let stored_items = self
            .kv
            .scan_prefix(&prefix)
            .await?
            .iter()
            .filter(|key| !key.ends_with(":embedding"))
            .count() as u64;

        Ok(CacheStats {
            total_requests: total,
            exact_hits,
            semantic_hits,
            misses,
            hit_rate_percent: (hit_rate * 100.0).round() / 100.0,
            stored_items,
        })
    }

    /// Delete every entry under the cache prefix. Returns the number of
    /// keys removed. Operator/test tooling; not exposed over HTTP.
    pub async fn clear(&self) -> Result<u64> {
        let prefix = format!("{}:", self.key_prefix);
        let keys = self.kv.scan_prefix(&prefix).await?;
        let mut deleted = 0u64;
        for key in &keys {
            self.kv.del(key).await?;
            deleted += 1;
        }
        Ok(deleted)
    }
}
