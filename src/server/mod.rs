//! HTTP API surface.
//!
//! Serves the query endpoint plus the operational endpoints over
//! HTTP/1.1. Authentication and rate limiting run before any business
//! logic; the allow-list below names the endpoints that bypass
//! credentials (load balancers and scrapers carry none).
//!
//! | Route            | Auth  | Purpose                               |
//! |------------------|-------|---------------------------------------|
//! | `GET /`          | none  | service banner                        |
//! | `GET /health`    | none  | healthy iff the kv store answers ping |
//! | `GET /metrics`   | none  | prometheus scrape                     |
//! | `GET /v1/metrics`| any   | cache counters as JSON                |
//! | `POST /v1/query` | any   | the query pipeline                    |

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::cache::SemanticCache;
use crate::kv::KvStore;
use crate::lifecycle::Lifecycle;
use crate::query::QueryService;
use crate::ratelimit::{RateDecision, RateLimiter};
use crate::telemetry;
use crate::types::QueryRequest;
use crate::{MimirError, Result};

/// Maximum accepted request body size in bytes.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Everything a request handler needs, wired once at startup.
pub struct AppState {
    pub auth: Authenticator,
    pub limiter: RateLimiter,
    pub query: QueryService,
    pub cache: Arc<SemanticCache>,
    pub kv: Arc<dyn KvStore>,
    pub lifecycle: Arc<Lifecycle>,
    pub metrics: PrometheusHandle,
    pub max_prompt_bytes: usize,
}

/// HTTP/1.1 server for the gateway API.
pub struct HttpServer {
    listener: TcpListener,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Bind `addr` and prepare to serve. Port 0 picks an ephemeral
    /// port; see [`local_addr`](Self::local_addr).
    pub async fn bind(addr: SocketAddr, state: Arc<AppState>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MimirError::Configuration(format!("failed to bind {addr}: {e}")))?;
        Ok(Self { listener, state })
    }

    /// The address the listener actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| MimirError::Internal(e.to_string()))
    }

    /// Accept and serve connections until the task is cancelled.
    ///
    /// Connections keep being accepted during shutdown drain so that
    /// late requests receive a proper 503 instead of a refused socket.
    pub async fn serve(&self) -> Result<()> {
        info!(addr = %self.local_addr()?, "http server listening");

        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let io = TokioIo::new(stream);
            let state = Arc::clone(&self.state);

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let state = Arc::clone(&state);
                    async move { Ok::<_, Infallible>(handle_request(req, state).await) }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(remote = %remote, error = %e, "connection error");
                }
            });
        }
    }
}

/// Route a request and record exit metrics.
async fn handle_request(req: Request<Incoming>, state: Arc<AppState>) -> Response<Full> {
    let started = Instant::now();
    let endpoint = endpoint_label(req.uri().path());

    let response = route(req, &state).await;

    let status = response.status().as_u16().to_string();
    metrics::counter!(
        telemetry::REQUESTS_TOTAL,
        "endpoint" => endpoint.clone(),
        "status" => status
    )
    .increment(1);
    metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS, "endpoint" => endpoint)
        .record(started.elapsed().as_secs_f64());

    response
}

type Full = http_body_util::Full<Bytes>;

async fn route(req: Request<Incoming>, state: &Arc<AppState>) -> Response<Full> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    match (method, path.as_str()) {
        (Method::GET, "/") => json_response(
            StatusCode::OK,
            &json!({
                "service": "mimir",
                "version": env!("CARGO_PKG_VERSION"),
            }),
        ),
        (Method::GET, "/health") => handle_health(state).await,
        (Method::GET, "/metrics") => text_response(state.metrics.render()),
        (Method::GET, "/v1/metrics") => handle_cache_stats(req, state).await,
        (Method::POST, "/v1/query") => handle_query(req, state).await,
        _ => error_body(
            StatusCode::NOT_FOUND,
            "not_found",
            "no such endpoint",
            None,
        ),
    }
}

/// Healthy iff the kv store answers its liveness probe.
async fn handle_health(state: &Arc<AppState>) -> Response<Full> {
    match state.kv.ping().await {
        Ok(()) => json_response(StatusCode::OK, &json!({"status": "healthy"})),
        Err(e) => {
            warn!(error = %e, "health probe failed");
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &json!({"status": "degraded"}),
            )
        }
    }
}

/// Authenticated cache counter summary.
async fn handle_cache_stats(req: Request<Incoming>, state: &Arc<AppState>) -> Response<Full> {
    let credential = header_value(&req, state.auth.header_name());
    if let Err(e) = state.auth.authenticate(credential.as_deref()) {
        return error_response(&e, None);
    }
    match state.cache.stats().await {
        Ok(stats) => json_response(StatusCode::OK, &stats),
        Err(e) => error_response(&e, None),
    }
}

/// The query pipeline behind admission, authentication, and rate
/// limiting.
async fn handle_query(req: Request<Incoming>, state: &Arc<AppState>) -> Response<Full> {
    // Admission first: the shutdown flag is checked before the
    // in-flight count is incremented, and the guard's drop is the one
    // decrement site for every path out of this function.
    let _guard = match state.lifecycle.admit() {
        Ok(guard) => guard,
        Err(e) => return error_response(&e, None),
    };

    let credential = header_value(&req, state.auth.header_name());
    if let Err(e) = state.auth.authenticate(credential.as_deref()) {
        return error_response(&e, None);
    }
    // Authenticate ensured the credential is present.
    let credential = credential.unwrap_or_default();

    let decision = state.limiter.check_and_consume(&credential).await;
    if !decision.allowed {
        let retry_after = decision.retry_after.unwrap_or(Duration::ZERO);
        return error_response(&MimirError::RateLimited { retry_after }, Some(&decision));
    }

    let body = match read_body(req).await {
        Ok(bytes) => bytes,
        Err(e) => return error_response(&e, Some(&decision)),
    };
    let request: QueryRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return error_response(
                &MimirError::Validation(format!("malformed request body: {e}")),
                Some(&decision),
            )
        }
    };
    if let Err(e) = request.validate(state.max_prompt_bytes) {
        return error_response(&e, Some(&decision));
    }

    match state.query.execute(&request).await {
        Ok(result) => {
            let mut response = json_response(StatusCode::OK, &result);
            apply_rate_headers(&mut response, &decision);
            response
        }
        Err(e) => error_response(&e, Some(&decision)),
    }
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes> {
    Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|_| MimirError::Validation(format!("request body exceeds {MAX_BODY_BYTES} bytes")))
}

fn header_value(req: &Request<Incoming>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

/// Keep the metric label space bounded to known routes.
fn endpoint_label(path: &str) -> String {
    match path {
        "/" | "/health" | "/metrics" | "/v1/metrics" | "/v1/query" => path.to_string(),
        _ => "other".to_string(),
    }
}

fn json_response<T: serde::Serialize>(status: StatusCode, body: &T) -> Response<Full> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .expect("static response parts are valid")
}

fn text_response(body: String) -> Response<Full> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4")
        .body(Full::new(Bytes::from(body)))
        .expect("static response parts are valid")
}

/// Structured error body with the machine code the error maps to.
/// Internal details (kv addresses, upstream payloads) stay out of the
/// message for 5xx-class errors.
fn error_response(error: &MimirError, decision: Option<&RateDecision>) -> Response<Full> {
    let status = StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = match error {
        MimirError::Validation(_)
        | MimirError::Unauthenticated
        | MimirError::RateLimited { .. }
        | MimirError::ShuttingDown
        | MimirError::LlmUnavailable => error.to_string(),
        _ => "an unexpected error occurred".to_string(),
    };
    let mut response = error_body(status, error.code(), &message, decision);
    if let MimirError::RateLimited { retry_after } = error {
        if let Ok(value) = retry_after.as_secs().max(1).to_string().parse() {
            response.headers_mut().insert("retry-after", value);
        }
    }
    response
}

fn error_body(
    status: StatusCode,
    code: &str,
    message: &str,
    decision: Option<&RateDecision>,
) -> Response<Full> {
    let mut response = json_response(status, &json!({"error": code, "message": message}));
    if let Some(decision) = decision {
        apply_rate_headers(&mut response, decision);
    }
    response
}

fn apply_rate_headers(response: &mut Response<Full>, decision: &RateDecision) {
    let headers = response.headers_mut();
    if let Ok(value) = decision.limit.to_string().parse() {
        headers.insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = decision.remaining.to_string().parse() {
        headers.insert("x-ratelimit-remaining", value);
    }
    if let Ok(value) = decision.reset_at.to_string().parse() {
        headers.insert("x-ratelimit-reset", value);
    }
}
