//! Request and response types for the query pipeline.

use serde::{Deserialize, Serialize};

use crate::{MimirError, Result};

fn default_temperature() -> f32 {
    0.7
}

fn default_max_output_tokens() -> u32 {
    500
}

fn default_similarity_threshold() -> f32 {
    0.75
}

/// An authenticated query against the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    /// User prompt. Byte length is bounded by configuration.
    pub prompt: String,
    /// Model identifier. Defaults to the configured model when absent.
    #[serde(default)]
    pub model: Option<String>,
    /// Sampling temperature, 0.0–2.0.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Maximum tokens in the completion.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Minimum cosine similarity for a semantic cache hit, 0.0–1.0.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
}

impl QueryRequest {
    /// Create a request for the given prompt with default parameters.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            similarity_threshold: default_similarity_threshold(),
        }
    }

    /// Set the model identifier.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the similarity threshold.
    pub fn similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    /// Validate field bounds. `max_prompt_bytes` comes from configuration.
    pub fn validate(&self, max_prompt_bytes: usize) -> Result<()> {
        if self.prompt.is_empty() {
            return Err(MimirError::Validation("prompt must not be empty".into()));
        }
        if self.prompt.len() > max_prompt_bytes {
            return Err(MimirError::Validation(format!(
                "prompt exceeds {max_prompt_bytes} bytes"
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(MimirError::Validation(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.max_output_tokens == 0 {
            return Err(MimirError::Validation(
                "max_output_tokens must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(MimirError::Validation(
                "similarity_threshold must be between 0.0 and 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// How a cached response matched the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitType {
    /// Fingerprint present in the cache; response returned verbatim.
    Exact,
    /// Stored embedding within the similarity threshold.
    Semantic,
}

impl HitType {
    /// Label value used in cache outcome metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            HitType::Exact => "exact",
            HitType::Semantic => "semantic",
        }
    }
}

/// Result of a query, cached or freshly computed.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub response: String,
    pub cache_hit: bool,
    pub hit_type: Option<HitType>,
    pub similarity_score: Option<f32>,
    pub matched_prompt: Option<String>,
    /// Total tokens consumed. Zero on cache hits.
    pub tokens_used: u64,
    /// Completion cost in configured currency units. Zero on cache hits.
    pub cost: f64,
    pub latency_ms: f64,
}
