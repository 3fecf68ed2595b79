//! mimird — Mimir semantic caching gateway daemon.
//!
//! Wires the query pipeline from configuration and serves it over HTTP
//! until a termination signal arrives, then drains in-flight requests
//! before exiting.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use mimir::auth::Authenticator;
use mimir::cache::SemanticCache;
use mimir::config::Config;
use mimir::embedding::EmbeddingClient;
use mimir::kv::{KvStore, RedisKv};
use mimir::lifecycle::Lifecycle;
use mimir::llm::{CircuitBreaker, LlmClient, LlmService};
use mimir::query::QueryService;
use mimir::ratelimit::RateLimiter;
use mimir::server::{AppState, HttpServer};
use mimir::telemetry;
use mimir::MimirError;

/// Mimir daemon — semantic caching gateway for LLM completions.
#[derive(Parser)]
#[command(name = "mimird")]
#[command(version)]
#[command(about = "Mimir semantic caching gateway daemon")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    config.validate()?;

    let metrics_handle = telemetry::install_recorder()?;

    // The kv store is the one dependency probed at startup; the
    // embedding and completion producers are failure-tolerated at
    // request time instead.
    let kv: Arc<dyn KvStore> = Arc::new(
        RedisKv::connect_with_retry(&config.kv.endpoint, 3, Duration::from_secs(1)).await?,
    );

    let cache = Arc::new(SemanticCache::new(
        Arc::clone(&kv),
        config.kv.key_prefix.clone(),
        config.kv.lock_prefix.clone(),
    ));

    let embeddings = Arc::new(EmbeddingClient::new(
        config.embedding.endpoint.clone(),
        Config::api_key("embedding"),
        config.embedding.dimension,
        Duration::from_secs(config.embedding.timeout_seconds),
    ));

    let llm_client = LlmClient::new(config.llm.endpoint.clone(), Config::api_key("llm"))
        .timeout(Duration::from_secs(config.llm.timeout_seconds))
        .max_attempts(config.llm.max_attempts)
        .costs(config.llm.input_cost_per_1k, config.llm.output_cost_per_1k);
    let breaker = CircuitBreaker::new(
        config.breaker.failure_threshold,
        Duration::from_secs(config.breaker.cooldown_seconds),
    );
    let llm = Arc::new(LlmService::new(llm_client, breaker));

    let query = QueryService::new(
        Arc::clone(&cache),
        embeddings,
        llm,
        config.llm.model_default.clone(),
    )
    .response_ttl(Duration::from_secs(config.cache.response_ttl_seconds))
    .lock_ttl(Duration::from_secs(config.cache.lock_ttl_seconds));

    let limiter = RateLimiter::new(
        Arc::clone(&kv),
        config.kv.rate_limit_prefix.clone(),
        config.rate_limit.capacity,
        Duration::from_secs(config.rate_limit.window_seconds),
    );

    let auth = Authenticator::new(
        config.auth.credential_header_name.clone(),
        config.auth.admin_credentials.clone(),
        config.auth.user_credentials.clone(),
    );

    let lifecycle = Lifecycle::new(config.drain_deadline());

    let addr: SocketAddr = config
        .server
        .address
        .parse()
        .map_err(|e| MimirError::Configuration(format!("invalid address: {e}")))?;

    let state = Arc::new(AppState {
        auth,
        limiter,
        query,
        cache,
        kv,
        lifecycle: Arc::clone(&lifecycle),
        metrics: metrics_handle,
        max_prompt_bytes: config.cache.max_prompt_bytes,
    });

    let server = HttpServer::bind(addr, state).await?;
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.serve().await {
            warn!(error = %e, "http server stopped");
        }
    });

    info!(version = env!("CARGO_PKG_VERSION"), %addr, "mimird started");

    shutdown_signal().await;
    info!("shutdown signal received; draining in-flight requests");
    lifecycle.begin_shutdown();
    if !lifecycle.drain().await {
        warn!("drain deadline expired; abandoning remaining requests");
    }
    server_task.abort();
    info!("mimird stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
