//! HTTP surface tests: admission, authentication, rate limiting, and
//! the operational endpoints, against a server bound to an ephemeral
//! port.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusHandle;
use mimir::auth::Authenticator;
use mimir::cache::SemanticCache;
use mimir::embedding::EmbeddingClient;
use mimir::kv::{KvStore, MemoryKv};
use mimir::lifecycle::Lifecycle;
use mimir::llm::{CircuitBreaker, LlmClient, LlmService};
use mimir::query::QueryService;
use mimir::ratelimit::RateLimiter;
use mimir::server::{AppState, HttpServer};
use mimir::telemetry;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const USER_KEY: &str = "user-secret";

/// The metrics recorder is process-global; install it once for the
/// whole test binary.
fn metrics_handle() -> PrometheusHandle {
    static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
    HANDLE
        .get_or_init(|| telemetry::install_recorder().expect("install recorder"))
        .clone()
}

struct Harness {
    base_url: String,
    lifecycle: Arc<Lifecycle>,
    _embed_server: MockServer,
    _llm_server: MockServer,
}

async fn harness(rate_capacity: u32) -> Harness {
    let embed_server = MockServer::start().await;
    let llm_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/embed"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!([[1.0, 0.0, 0.0]])),
        )
        .mount(&embed_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "an answer"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}
        })))
        .mount(&llm_server)
        .await;

    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let cache = Arc::new(SemanticCache::new(
        Arc::clone(&kv),
        "test:cache",
        "test:lock",
    ));
    let embeddings = Arc::new(EmbeddingClient::new(
        format!("{}/embed", embed_server.uri()),
        None,
        3,
        Duration::from_secs(2),
    ));
    let llm = Arc::new(LlmService::new(
        LlmClient::new(format!("{}/v1/chat/completions", llm_server.uri()), None)
            .max_attempts(1),
        CircuitBreaker::new(5, Duration::from_secs(60)),
    ));
    let query = QueryService::new(Arc::clone(&cache), embeddings, llm, "m1")
        .lock_ttl(Duration::from_millis(500))
        .lock_poll(Duration::from_millis(20));

    let lifecycle = Lifecycle::new(Duration::from_secs(2));
    let state = Arc::new(AppState {
        auth: Authenticator::new("x-api-key", vec![], vec![USER_KEY.to_string()]),
        limiter: RateLimiter::new(
            Arc::clone(&kv),
            "test:rl",
            rate_capacity,
            Duration::from_secs(60),
        ),
        query,
        cache,
        kv,
        lifecycle: Arc::clone(&lifecycle),
        metrics: metrics_handle(),
        max_prompt_bytes: 2048,
    });

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = HttpServer::bind(addr, state).await.unwrap();
    let base_url = format!("http://{}", server.local_addr().unwrap());
    tokio::spawn(async move {
        let _ = server.serve().await;
    });

    Harness {
        base_url,
        lifecycle,
        _embed_server: embed_server,
        _llm_server: llm_server,
    }
}

fn query_body(prompt: &str) -> serde_json::Value {
    serde_json::json!({"prompt": prompt})
}

#[tokio::test]
async fn root_and_health_bypass_auth() {
    let h = harness(100).await;
    let http = reqwest::Client::new();

    let root: serde_json::Value = http
        .get(&h.base_url)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(root["service"], "mimir");

    let health = http
        .get(format!("{}/health", h.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);
    let body: serde_json::Value = health.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn metrics_scrape_is_open() {
    let h = harness(100).await;
    let response = reqwest::Client::new()
        .get(format!("{}/metrics", h.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn missing_credential_is_rejected() {
    let h = harness(100).await;
    let response = reqwest::Client::new()
        .post(format!("{}/v1/query", h.base_url))
        .json(&query_body("hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "unauthenticated");
}

#[tokio::test]
async fn unknown_credential_is_rejected() {
    let h = harness(100).await;
    let response = reqwest::Client::new()
        .post(format!("{}/v1/query", h.base_url))
        .header("x-api-key", "wrong")
        .json(&query_body("hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn query_round_trip_with_rate_headers() {
    let h = harness(100).await;
    let http = reqwest::Client::new();

    let response = http
        .post(format!("{}/v1/query", h.base_url))
        .header("x-api-key", USER_KEY)
        .json(&query_body("what is python"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("x-ratelimit-limit").unwrap(),
        "100"
    );
    assert!(response.headers().contains_key("x-ratelimit-remaining"));
    assert!(response.headers().contains_key("x-ratelimit-reset"));
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["cache_hit"], false);
    assert_eq!(body["response"], "an answer");

    // Replay is an exact hit.
    let replay: serde_json::Value = http
        .post(format!("{}/v1/query", h.base_url))
        .header("x-api-key", USER_KEY)
        .json(&query_body("what is python"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(replay["cache_hit"], true);
    assert_eq!(replay["hit_type"], "exact");
    assert_eq!(replay["tokens_used"], 0);
}

#[tokio::test]
async fn rate_limit_denial_carries_retry_after() {
    let h = harness(1).await;
    let http = reqwest::Client::new();

    let first = http
        .post(format!("{}/v1/query", h.base_url))
        .header("x-api-key", USER_KEY)
        .json(&query_body("hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);

    let second = http
        .post(format!("{}/v1/query", h.base_url))
        .header("x-api-key", USER_KEY)
        .json(&query_body("hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 429);
    assert!(second.headers().contains_key("retry-after"));
    assert_eq!(second.headers().get("x-ratelimit-remaining").unwrap(), "0");
    let body: serde_json::Value = second.json().await.unwrap();
    assert_eq!(body["error"], "rate_limited");
}

#[tokio::test]
async fn validation_failures_are_400() {
    let h = harness(100).await;
    let http = reqwest::Client::new();

    for body in [
        query_body(""),
        query_body(&"a".repeat(2049)),
        serde_json::json!({"prompt": "ok", "temperature": 3.0}),
    ] {
        let response = http
            .post(format!("{}/v1/query", h.base_url))
            .header("x-api-key", USER_KEY)
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], "validation_error");
    }
}

#[tokio::test]
async fn malformed_body_is_400() {
    let h = harness(100).await;
    let response = reqwest::Client::new()
        .post(format!("{}/v1/query", h.base_url))
        .header("x-api-key", USER_KEY)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn shutdown_rejects_queries_but_keeps_health() {
    let h = harness(100).await;
    let http = reqwest::Client::new();

    h.lifecycle.begin_shutdown();

    let response = http
        .post(format!("{}/v1/query", h.base_url))
        .header("x-api-key", USER_KEY)
        .json(&query_body("hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "service_unavailable");

    let health = http
        .get(format!("{}/health", h.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);
}

#[tokio::test]
async fn cache_summary_requires_auth() {
    let h = harness(100).await;
    let http = reqwest::Client::new();

    let denied = http
        .get(format!("{}/v1/metrics", h.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 401);

    let allowed = http
        .get(format!("{}/v1/metrics", h.base_url))
        .header("x-api-key", USER_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);
    let body: serde_json::Value = allowed.json().await.unwrap();
    assert!(body.get("stored_items").is_some());
    assert!(body.get("hit_rate_percent").is_some());
}

#[tokio::test]
async fn unknown_route_is_404() {
    let h = harness(100).await;
    let response = reqwest::Client::new()
        .get(format!("{}/nope", h.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}
