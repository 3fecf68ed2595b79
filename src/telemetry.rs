//! Telemetry metric name constants and recorder installation.
//!
//! Centralised metric names for mimir operations. The daemon installs a
//! prometheus recorder at startup via [`install_recorder`]; library
//! consumers may install any `metrics` recorder instead. Without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `mimir_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `endpoint` — API route (e.g. "/v1/query")
//! - `status` — HTTP status code at request exit
//! - `type` — cache outcome: "exact" | "semantic" | "miss"
//! - `direction` — token direction: "input" | "output"

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::{MimirError, Result};

/// Total HTTP requests, incremented at request exit.
///
/// Labels: `endpoint`, `status`.
pub const REQUESTS_TOTAL: &str = "mimir_requests_total";

/// Request duration in seconds, observed from admission to response.
///
/// Labels: `endpoint`.
pub const REQUEST_DURATION_SECONDS: &str = "mimir_request_duration_seconds";

/// Cache outcomes.
///
/// Labels: `type` ("exact" | "semantic" | "miss").
pub const CACHE_OUTCOMES_TOTAL: &str = "mimir_cache_outcomes_total";

/// Total tokens consumed by completion calls.
///
/// Labels: `direction` ("input" | "output").
pub const LLM_TOKENS_TOTAL: &str = "mimir_llm_tokens_total";

/// Cumulative completion cost, in millionths of the configured
/// currency unit (counters are integral; divide by 1e6 when reading).
pub const LLM_COST_TOTAL: &str = "mimir_llm_cost_total";

/// Currently admitted, not yet completed requests.
pub const IN_FLIGHT_REQUESTS: &str = "mimir_in_flight_requests";

/// Breaker state gauge: 0 = closed, 1 = half-open, 2 = open.
pub const BREAKER_STATE: &str = "mimir_breaker_state";

/// Duration histogram buckets, spanning cache hits (single-digit ms)
/// to completion calls (tens of seconds).
pub const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0,
];

/// Install a prometheus recorder and return the handle used by the
/// scrape endpoint. Call once at startup.
pub fn install_recorder() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(REQUEST_DURATION_SECONDS.to_string()),
            DURATION_BUCKETS,
        )
        .map_err(|e| MimirError::Configuration(format!("invalid histogram buckets: {e}")))?
        .install_recorder()
        .map_err(|e| MimirError::Configuration(format!("failed to install metrics recorder: {e}")))
}
