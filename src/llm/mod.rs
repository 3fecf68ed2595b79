//! Completion producer client with retry, cost accounting, and a
//! circuit breaker.
//!
//! [`LlmClient`] speaks the chat-completions wire shape and retries
//! transient failures with exponential backoff. [`LlmService`] wraps it
//! with a [`CircuitBreaker`] and emits token/cost/breaker metrics; the
//! orchestrator only ever talks to the service.

mod breaker;

pub use breaker::{BreakerState, CircuitBreaker};

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::telemetry;
use crate::{MimirError, Result};

/// A successful completion with usage accounting.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Cost in configured currency units.
    pub cost: f64,
}

/// HTTP client for the chat-completions endpoint.
pub struct LlmClient {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
    max_attempts: u32,
    initial_backoff: Duration,
    input_cost_per_1k: f64,
    output_cost_per_1k: f64,
}

impl LlmClient {
    /// Create a client for the chat-completions endpoint at `endpoint`.
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into(),
            api_key,
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            input_cost_per_1k: 0.0,
            output_cost_per_1k: 0.0,
        }
    }

    /// Set the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set maximum attempts (including the initial request). 1 = no retry.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the base delay before the first retry. Delays double per
    /// attempt from here.
    pub fn initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    /// Set per-direction costs in currency units per 1000 tokens.
    pub fn costs(mut self, input_per_1k: f64, output_per_1k: f64) -> Self {
        self.input_cost_per_1k = input_per_1k;
        self.output_cost_per_1k = output_per_1k;
        self
    }

    /// Request a completion, retrying transient failures.
    ///
    /// Connection errors, per-attempt timeouts, 5xx, and 429 are retried
    /// with 1 s / 2 s / 4 s backoff; credential rejections (401/403) and
    /// malformed response bodies fail immediately.
    pub async fn complete(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Completion> {
        let mut last_err = None;
        for attempt in 0..self.max_attempts {
            match self.attempt(prompt, model, temperature, max_tokens).await {
                Ok(completion) => return Ok(completion),
                Err(e) if e.is_transient() => {
                    if attempt + 1 < self.max_attempts {
                        let delay = self.initial_backoff * 2u32.saturating_pow(attempt);
                        warn!(
                            attempt = attempt + 1,
                            max_attempts = self.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "retrying completion after transient error"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(MimirError::EmptyResponse))
    }

    async fn attempt(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Completion> {
        let body = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature,
            max_tokens,
        };

        let mut request = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&body);
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| MimirError::Http(e.to_string()))?;

        let status = response.status();
        match status.as_u16() {
            200..=299 => {}
            401 | 403 => return Err(MimirError::AuthConfig),
            code => {
                let message = response.text().await.unwrap_or_default();
                return Err(MimirError::Api { status: code, message });
            }
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| MimirError::MalformedResponse(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(MimirError::EmptyResponse)?;
        if choice.message.content.is_empty() {
            return Err(MimirError::EmptyResponse);
        }
        let usage = parsed.usage.unwrap_or_default();

        Ok(Completion {
            text: choice.message.content,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cost: self.cost(usage.prompt_tokens, usage.completion_tokens),
        })
    }

    /// Cost for a token count pair, in currency units.
    fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_cost_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_cost_per_1k
    }
}

/// Completion client behind the circuit breaker.
///
/// While the breaker is open, calls fail immediately with
/// [`MimirError::LlmUnavailable`] and never reach the remote. Exhausted
/// retries are mapped to the same error; a credential rejection keeps
/// its own kind so it surfaces as a configuration problem.
pub struct LlmService {
    client: LlmClient,
    breaker: CircuitBreaker,
}

impl LlmService {
    /// Wrap a client with a breaker.
    pub fn new(client: LlmClient, breaker: CircuitBreaker) -> Self {
        Self { client, breaker }
    }

    /// The wrapped breaker, for state inspection.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Request a completion through the breaker.
    pub async fn complete(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Completion> {
        if !self.breaker.allow_request() {
            self.publish_state();
            return Err(MimirError::LlmUnavailable);
        }

        let result = self
            .client
            .complete(prompt, model, temperature, max_tokens)
            .await;

        match &result {
            Ok(completion) => {
                self.breaker.record_success();
                metrics::counter!(telemetry::LLM_TOKENS_TOTAL, "direction" => "input")
                    .increment(completion.input_tokens);
                metrics::counter!(telemetry::LLM_TOKENS_TOTAL, "direction" => "output")
                    .increment(completion.output_tokens);
                // Counters are integral: cost accumulates in
                // micro-units of the configured currency.
                metrics::counter!(telemetry::LLM_COST_TOTAL)
                    .increment((completion.cost * 1_000_000.0).round() as u64);
            }
            Err(_) => self.breaker.record_failure(),
        }
        self.publish_state();

        result.map_err(|e| match e {
            MimirError::AuthConfig => MimirError::AuthConfig,
            other => {
                warn!(error = %other, "completion failed after retries");
                MimirError::LlmUnavailable
            }
        })
    }

    fn publish_state(&self) {
        metrics::gauge!(telemetry::BREAKER_STATE).set(self.breaker.state().gauge_value());
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}
