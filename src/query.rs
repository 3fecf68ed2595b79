//! Query orchestration: the exact → semantic → single-flight → LLM
//! pipeline.
//!
//! Ordering guarantees, in pipeline order:
//! - the embedding is computed before the lock is sought, so a
//!   successful completion can store it on write-back;
//! - the lock is acquired before any completion call this orchestrator
//!   issues, and released before returning, on every owned-lock path;
//! - after acquiring the lock the cache is re-checked (exact and
//!   semantic) before spending money, since another holder may have
//!   filled it between our first checks and the acquisition;
//! - cache writes happen only after a successful completion.
//!
//! A waiter that times out on a held lock proceeds without it: the
//! holder may have crashed, and a possible duplicate completion is
//! preferred over unavailability. Waiters poll the cache rather than
//! the lock, because the entry becomes visible slightly before the lock
//! release.
//!
//! The completion → cache-write → lock-release sequence runs in a
//! spawned task the handler awaits. If the client disconnects and the
//! request future is dropped, the task still finishes: a response that
//! was paid for reaches the cache, and the lock is released.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::{CachedEntry, SemanticCache};
use crate::embedding::EmbeddingClient;
use crate::llm::{Completion, LlmService};
use crate::types::{HitType, QueryRequest, QueryResponse};
use crate::{MimirError, Result};

/// The query execution pipeline.
pub struct QueryService {
    cache: Arc<SemanticCache>,
    embeddings: Arc<EmbeddingClient>,
    llm: Arc<LlmService>,
    default_model: String,
    response_ttl: Duration,
    lock_ttl: Duration,
    lock_poll: Duration,
}

impl QueryService {
    /// Create the pipeline over its collaborators.
    pub fn new(
        cache: Arc<SemanticCache>,
        embeddings: Arc<EmbeddingClient>,
        llm: Arc<LlmService>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            embeddings,
            llm,
            default_model: default_model.into(),
            response_ttl: Duration::from_secs(3600),
            lock_ttl: Duration::from_secs(30),
            lock_poll: Duration::from_millis(100),
        }
    }

    /// Set the TTL for cached responses.
    pub fn response_ttl(mut self, ttl: Duration) -> Self {
        self.response_ttl = ttl;
        self
    }

    /// Set the single-flight lock TTL. Also the wait deadline for
    /// requests that lose the lock race.
    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Set the interval at which lock waiters poll the cache.
    pub fn lock_poll(mut self, interval: Duration) -> Self {
        self.lock_poll = interval;
        self
    }

    /// Execute one validated query.
    pub async fn execute(&self, request: &QueryRequest) -> Result<QueryResponse> {
        let started = Instant::now();
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let fp = crate::cache::fingerprint(&request.prompt, &model);

        // Exact lookup first: one read against a linear scan.
        if let Some(entry) = self.cache.get_exact(&fp).await? {
            self.cache.record_exact_hit();
            info!(latency_ms = elapsed_ms(started), "exact cache hit");
            return Ok(hit_response(
                entry.response,
                HitType::Exact,
                1.0,
                request.prompt.clone(),
                started,
            ));
        }

        // Embedding before the lock, so write-back can store it.
        // Failure degrades to the completion path.
        let query_embedding = match self.embeddings.embed(&request.prompt).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                error!(error = %e, "embedding failed; skipping semantic stage");
                None
            }
        };

        if let Some(ref embedding) = query_embedding {
            if let Some(found) = self
                .cache
                .find_semantic_match(embedding, request.similarity_threshold)
                .await?
            {
                self.cache.record_semantic_hit();
                info!(
                    similarity = found.similarity,
                    latency_ms = elapsed_ms(started),
                    "semantic cache hit"
                );
                return Ok(hit_response(
                    found.response,
                    HitType::Semantic,
                    found.similarity,
                    found.prompt,
                    started,
                ));
            }
        }

        // Single-flight: one completion per fingerprint in the steady
        // state. The kv store resolves the set-if-absent race.
        let holder_id = Uuid::new_v4().to_string();
        let acquired = self
            .cache
            .try_acquire_lock(&fp, &holder_id, self.lock_ttl)
            .await?;

        if !acquired {
            if let Some(entry) = self.wait_for_entry(&fp).await? {
                self.cache.record_exact_hit();
                return Ok(hit_response(
                    entry.response,
                    HitType::Exact,
                    1.0,
                    request.prompt.clone(),
                    started,
                ));
            }
            // The holder may have crashed; trade a possible duplicate
            // completion for availability.
            warn!("lock wait deadline expired; proceeding without single-flight");
            let completion = self
                .fill(&fp, request, &model, query_embedding, None)
                .await?;
            self.cache.record_miss();
            return Ok(miss_response(completion, started));
        }

        // Double-check under the lock before spending money.
        match self
            .double_check(&fp, query_embedding.as_deref(), request, started)
            .await
        {
            Ok(Some(response)) => {
                self.release_quietly(&fp, &holder_id).await;
                return Ok(response);
            }
            Ok(None) => {}
            Err(e) => {
                self.release_quietly(&fp, &holder_id).await;
                return Err(e);
            }
        }

        let completion = self
            .fill(&fp, request, &model, query_embedding, Some(holder_id))
            .await?;
        self.cache.record_miss();
        info!(
            tokens = completion.input_tokens + completion.output_tokens,
            cost = completion.cost,
            latency_ms = elapsed_ms(started),
            "cache miss served by completion"
        );
        Ok(miss_response(completion, started))
    }

    /// Re-run the exact and semantic lookups after acquiring the lock.
    async fn double_check(
        &self,
        fp: &str,
        embedding: Option<&[f32]>,
        request: &QueryRequest,
        started: Instant,
    ) -> Result<Option<QueryResponse>> {
        if let Some(entry) = self.cache.get_exact(fp).await? {
            self.cache.record_exact_hit();
            return Ok(Some(hit_response(
                entry.response,
                HitType::Exact,
                1.0,
                request.prompt.clone(),
                started,
            )));
        }
        if let Some(embedding) = embedding {
            if let Some(found) = self
                .cache
                .find_semantic_match(embedding, request.similarity_threshold)
                .await?
            {
                self.cache.record_semantic_hit();
                return Ok(Some(hit_response(
                    found.response,
                    HitType::Semantic,
                    found.similarity,
                    found.prompt,
                    started,
                )));
            }
        }
        Ok(None)
    }

    /// Poll the cache while another holder works, up to the lock TTL.
    async fn wait_for_entry(&self, fp: &str) -> Result<Option<CachedEntry>> {
        let deadline = Instant::now() + self.lock_ttl;
        while Instant::now() < deadline {
            tokio::time::sleep(self.lock_poll).await;
            if let Some(entry) = self.cache.get_exact(fp).await? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Call the completion endpoint, write back on success, and release
    /// the lock when one is held.
    ///
    /// Runs detached so request cancellation cannot abandon a received
    /// completion before the cache write, nor leave the lock to expire
    /// on its own.
    async fn fill(
        &self,
        fp: &str,
        request: &QueryRequest,
        model: &str,
        embedding: Option<Vec<f32>>,
        holder_id: Option<String>,
    ) -> Result<Completion> {
        let cache = Arc::clone(&self.cache);
        let llm = Arc::clone(&self.llm);
        let fp = fp.to_string();
        let prompt = request.prompt.clone();
        let model = model.to_string();
        let temperature = request.temperature;
        let max_tokens = request.max_output_tokens;
        let ttl = self.response_ttl;

        let task = tokio::spawn(async move {
            let result = llm.complete(&prompt, &model, temperature, max_tokens).await;
            let result = match result {
                Ok(completion) => {
                    if let Err(e) = cache
                        .set(&fp, &prompt, &completion.text, embedding.as_deref(), ttl)
                        .await
                    {
                        warn!(error = %e, "cache write failed after completion");
                    }
                    Ok(completion)
                }
                Err(e) => Err(e),
            };
            if let Some(holder_id) = holder_id {
                if let Err(e) = cache.release_lock(&fp, &holder_id).await {
                    warn!(error = %e, "lock release failed; ttl will reclaim it");
                }
            }
            result
        });

        task.await
            .map_err(|e| MimirError::Internal(format!("completion task failed: {e}")))?
    }

    async fn release_quietly(&self, fp: &str, holder_id: &str) {
        if let Err(e) = self.cache.release_lock(fp, holder_id).await {
            warn!(error = %e, "lock release failed; ttl will reclaim it");
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

fn hit_response(
    response: String,
    hit_type: HitType,
    similarity: f32,
    matched_prompt: String,
    started: Instant,
) -> QueryResponse {
    QueryResponse {
        response,
        cache_hit: true,
        hit_type: Some(hit_type),
        similarity_score: Some(similarity),
        matched_prompt: Some(matched_prompt),
        tokens_used: 0,
        cost: 0.0,
        latency_ms: elapsed_ms(started),
    }
}

fn miss_response(completion: Completion, started: Instant) -> QueryResponse {
    QueryResponse {
        response: completion.text,
        cache_hit: false,
        hit_type: None,
        similarity_score: None,
        matched_prompt: None,
        tokens_used: completion.input_tokens + completion.output_tokens,
        cost: completion.cost,
        latency_ms: elapsed_ms(started),
    }
}
