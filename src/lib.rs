//! Mimir - Semantic caching gateway for LLM completions
//!
//! Mimir sits between client applications and a remote LLM completion
//! service. Identical prompts are answered from an exact-match cache;
//! semantically close prompts are answered from a similarity search
//! over stored embeddings; everything else goes to the completion
//! endpoint behind a circuit breaker, with a distributed single-flight
//! lock ensuring concurrent identical requests pay for at most one
//! completion.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use mimir::cache::SemanticCache;
//! use mimir::embedding::EmbeddingClient;
//! use mimir::kv::{KvStore, RedisKv};
//! use mimir::llm::{CircuitBreaker, LlmClient, LlmService};
//! use mimir::query::QueryService;
//! use mimir::types::QueryRequest;
//!
//! # async fn run() -> mimir::Result<()> {
//! let kv: Arc<dyn KvStore> = Arc::new(RedisKv::connect("redis://127.0.0.1:6379").await?);
//! let cache = Arc::new(SemanticCache::new(Arc::clone(&kv), "mimir:cache", "mimir:lock"));
//! let embeddings = Arc::new(EmbeddingClient::new(
//!     "https://embed.example/v1/embed", None, 384, Duration::from_secs(5),
//! ));
//! let llm = Arc::new(LlmService::new(
//!     LlmClient::new("https://llm.example/v1/chat/completions", None),
//!     CircuitBreaker::new(5, Duration::from_secs(60)),
//! ));
//!
//! let service = QueryService::new(cache, embeddings, llm, "llama-3.1-8b-instant");
//! let result = service.execute(&QueryRequest::new("what is python")).await?;
//! println!("{} (cache_hit: {})", result.response, result.cache_hit);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod cache;
pub mod config;
pub mod embedding;
pub mod error;
pub mod kv;
pub mod lifecycle;
pub mod llm;
pub mod query;
pub mod ratelimit;
pub mod server;
pub mod telemetry;
pub mod types;

// Re-export main types at crate root
pub use error::{MimirError, Result};

pub use auth::{Authenticator, Role};
pub use cache::{CacheStats, SemanticCache};
pub use embedding::EmbeddingClient;
pub use kv::{KvStore, MemoryKv, RedisKv};
pub use lifecycle::{InFlightGuard, Lifecycle};
pub use llm::{BreakerState, CircuitBreaker, Completion, LlmClient, LlmService};
pub use query::QueryService;
pub use ratelimit::{RateDecision, RateLimiter};
pub use types::{HitType, QueryRequest, QueryResponse};
