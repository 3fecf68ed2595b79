//! Remote embedding producer client.
//!
//! Text in, fixed-length vector out. One attempt per request, no retry:
//! embedding failures degrade the pipeline (the semantic stage is
//! skipped), so spending backoff time here would only add latency to a
//! request that can already proceed.

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;

use crate::{MimirError, Result};

/// Client for the embedding endpoint.
///
/// The endpoint takes `{"inputs": text}` and returns one vector per
/// input, nested: `[[f32; dim]]`.
#[derive(Clone)]
pub struct EmbeddingClient {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
    dimension: usize,
}

impl EmbeddingClient {
    /// Create a client for `endpoint` expecting `dimension`-length vectors.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        dimension: usize,
        timeout: Duration,
    ) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            endpoint: endpoint.into(),
            api_key,
            dimension,
        }
    }

    /// Expected vector length.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Embed a single text.
    ///
    /// A vector whose length differs from the configured dimension is a
    /// configuration error (producer version skew), not a request error.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut request = self.http.post(&self.endpoint).json(&EmbedRequest { inputs: text });
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| MimirError::Embedding(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MimirError::Embedding(format!(
                "embedding endpoint returned {status}"
            )));
        }

        let values: Vec<Vec<f32>> = response
            .json()
            .await
            .map_err(|e| MimirError::Embedding(e.to_string()))?;

        let vector = values
            .into_iter()
            .next()
            .ok_or_else(|| MimirError::Embedding("empty embedding response".to_string()))?;

        if vector.len() != self.dimension {
            return Err(MimirError::Configuration(format!(
                "embedding dimension mismatch: expected {}, producer returned {}",
                self.dimension,
                vector.len()
            )));
        }

        Ok(vector)
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a str,
}
