//! Configuration loading for mimird.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. `--config <path>` (CLI flag)
//! 2. `~/.mimir/config.toml` (user)
//! 3. `/etc/mimir/config.toml` (system)
//!
//! API keys for the remote producers are read from environment variables
//! (`MIMIR_LLM_API_KEY`, `MIMIR_EMBEDDING_API_KEY`), never from the config
//! file, so the file can be world-readable.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{MimirError, Result};

/// Gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Server network and lifecycle configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to (default: 127.0.0.1:8470).
    #[serde(default = "default_address")]
    pub address: String,
    /// Hard deadline for the shutdown drain (default: 10).
    #[serde(default = "default_drain_seconds")]
    pub shutdown_drain_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            shutdown_drain_seconds: default_drain_seconds(),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1:8470".to_string()
}

fn default_drain_seconds() -> u64 {
    10
}

/// Credential configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Header the bearer credential is read from (default: x-api-key).
    #[serde(default = "default_credential_header")]
    pub credential_header_name: String,
    /// Credentials granted the admin role.
    #[serde(default)]
    pub admin_credentials: Vec<String>,
    /// Credentials granted the user role.
    #[serde(default)]
    pub user_credentials: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credential_header_name: default_credential_header(),
            admin_credentials: Vec::new(),
            user_credentials: Vec::new(),
        }
    }
}

fn default_credential_header() -> String {
    "x-api-key".to_string()
}

/// Token-bucket rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket capacity per credential (default: 100).
    #[serde(default = "default_rate_capacity")]
    pub capacity: u32,
    /// Refill window in seconds (default: 60). Refill rate is
    /// capacity / window.
    #[serde(default = "default_rate_window")]
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_rate_capacity(),
            window_seconds: default_rate_window(),
        }
    }
}

fn default_rate_capacity() -> u32 {
    100
}

fn default_rate_window() -> u64 {
    60
}

/// Key/value store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KvConfig {
    /// Store endpoint (default: redis://127.0.0.1:6379).
    #[serde(default = "default_kv_endpoint")]
    pub endpoint: String,
    /// Prefix for cache entries (default: mimir:cache).
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Prefix for single-flight locks (default: mimir:lock).
    /// Distinct from the cache prefix so the semantic scan never walks
    /// lock keys.
    #[serde(default = "default_lock_prefix")]
    pub lock_prefix: String,
    /// Prefix for rate-limit buckets (default: mimir:rl).
    #[serde(default = "default_rl_prefix")]
    pub rate_limit_prefix: String,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            endpoint: default_kv_endpoint(),
            key_prefix: default_key_prefix(),
            lock_prefix: default_lock_prefix(),
            rate_limit_prefix: default_rl_prefix(),
        }
    }
}

fn default_kv_endpoint() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "mimir:cache".to_string()
}

fn default_lock_prefix() -> String {
    "mimir:lock".to_string()
}

fn default_rl_prefix() -> String {
    "mimir:rl".to_string()
}

/// Embedding producer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    /// Full URL of the embedding endpoint.
    #[serde(default)]
    pub endpoint: String,
    /// Expected vector length (default: 384).
    #[serde(default = "default_embedding_dim")]
    pub dimension: usize,
    /// Per-request timeout in seconds (default: 5).
    #[serde(default = "default_embedding_timeout")]
    pub timeout_seconds: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            dimension: default_embedding_dim(),
            timeout_seconds: default_embedding_timeout(),
        }
    }
}

fn default_embedding_dim() -> usize {
    384
}

fn default_embedding_timeout() -> u64 {
    5
}

/// Completion producer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    /// Full URL of the chat-completions endpoint.
    #[serde(default)]
    pub endpoint: String,
    /// Model used when a request names none.
    #[serde(default = "default_llm_model")]
    pub model_default: String,
    /// Per-attempt timeout in seconds (default: 30).
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,
    /// Attempts including the initial request (default: 3).
    #[serde(default = "default_llm_attempts")]
    pub max_attempts: u32,
    /// Cost per 1000 input tokens, in abstract currency units.
    #[serde(default)]
    pub input_cost_per_1k: f64,
    /// Cost per 1000 output tokens, in abstract currency units.
    #[serde(default)]
    pub output_cost_per_1k: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model_default: default_llm_model(),
            timeout_seconds: default_llm_timeout(),
            max_attempts: default_llm_attempts(),
            input_cost_per_1k: 0.0,
            output_cost_per_1k: 0.0,
        }
    }
}

fn default_llm_model() -> String {
    "llama-3.1-8b-instant".to_string()
}

fn default_llm_timeout() -> u64 {
    30
}

fn default_llm_attempts() -> u32 {
    3
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before opening (default: 5).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds before an open breaker probes again (default: 60).
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_seconds: default_cooldown(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> u64 {
    60
}

/// Cache behavior configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// TTL for cached responses in seconds (default: 3600).
    #[serde(default = "default_response_ttl")]
    pub response_ttl_seconds: u64,
    /// TTL for single-flight locks in seconds (default: 30). Also the
    /// deadline for waiters polling a held lock.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_seconds: u64,
    /// Default semantic similarity threshold (default: 0.75).
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold_default: f32,
    /// Maximum accepted prompt length in bytes (default: 2048).
    #[serde(default = "default_max_prompt_bytes")]
    pub max_prompt_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            response_ttl_seconds: default_response_ttl(),
            lock_ttl_seconds: default_lock_ttl(),
            similarity_threshold_default: default_similarity_threshold(),
            max_prompt_bytes: default_max_prompt_bytes(),
        }
    }
}

fn default_response_ttl() -> u64 {
    3600
}

fn default_lock_ttl() -> u64 {
    30
}

fn default_similarity_threshold() -> f32 {
    0.75
}

fn default_max_prompt_bytes() -> usize {
    2048
}

/// Producer name → API key environment variable.
const PRODUCER_ENV_VARS: &[(&str, &str)] = &[
    ("llm", "MIMIR_LLM_API_KEY"),
    ("embedding", "MIMIR_EMBEDDING_API_KEY"),
];

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.mimir/config.toml`
    /// 3. `/etc/mimir/config.toml`
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        let content = fs::read_to_string(&path).map_err(|e| {
            MimirError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            MimirError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    /// Resolve the config file path. An explicit path must exist;
    /// otherwise the first existing entry of [`search_paths`](Self::search_paths)
    /// wins.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return if path.exists() {
                Ok(path.to_path_buf())
            } else {
                Err(MimirError::Configuration(format!(
                    "config file not found: {path:?}"
                )))
            };
        }

        Self::search_paths()
            .into_iter()
            .find(|candidate| candidate.exists())
            .ok_or_else(|| {
                let listed: Vec<String> = Self::search_paths()
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect();
                MimirError::Configuration(format!(
                    "no config file found in any of: {}",
                    listed.join(", ")
                ))
            })
    }

    /// Default search locations, most specific first: the per-user
    /// config shadows the system-wide one.
    fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".mimir").join("config.toml"));
        }
        paths.push(PathBuf::from("/etc/mimir/config.toml"));
        paths
    }

    /// Check configuration consistency. Failures here are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.auth.admin_credentials.is_empty() && self.auth.user_credentials.is_empty() {
            return Err(MimirError::Configuration(
                "no credentials configured; set [auth] admin_credentials or user_credentials"
                    .to_string(),
            ));
        }
        if self.embedding.dimension == 0 {
            return Err(MimirError::Configuration(
                "[embedding] dimension must be greater than zero".to_string(),
            ));
        }
        if self.llm.endpoint.is_empty() {
            return Err(MimirError::Configuration(
                "[llm] endpoint is required".to_string(),
            ));
        }
        if self.llm.max_attempts == 0 {
            return Err(MimirError::Configuration(
                "[llm] max_attempts must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.window_seconds == 0 {
            return Err(MimirError::Configuration(
                "[rate_limit] window_seconds must be greater than zero".to_string(),
            ));
        }
        if self.cache.max_prompt_bytes == 0 {
            return Err(MimirError::Configuration(
                "[cache] max_prompt_bytes must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.cache.similarity_threshold_default) {
            return Err(MimirError::Configuration(
                "[cache] similarity_threshold_default must be between 0.0 and 1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// API key for a producer from its environment variable.
    pub fn api_key(producer: &str) -> Option<String> {
        PRODUCER_ENV_VARS
            .iter()
            .find(|(name, _)| *name == producer)
            .and_then(|(_, env_var)| std::env::var(env_var).ok())
    }

    /// Drain deadline as a [`Duration`].
    pub fn drain_deadline(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_drain_seconds)
    }
}
