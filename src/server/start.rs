use anyhow::{Result, anyhow};
use axum::middleware::{from_fn_with_state, map_response};
use axum::{Router, routing::get};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use super::error::handle_panic;
use super::headers::security_headers;
use super::http::{AppState, fallback, health, ready, status};
use super::limit::{RateLimiter, limit_request_body, limit_requests, purge_stale_clients};
use crate::connection::{ConnectionManager, RetryPolicy};
use crate::db::{AnyStore, Datastore};
use crate::lifecycle::Lifecycle;
use crate::utils::generate_request_id;

/// Request admission limits applied to every route
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HttpPolicy {
    /// The largest accepted request body in bytes
    pub body_limit: usize,
    /// The number of requests a client may make in each window
    pub rate_limit_max: u32,
    /// The length of the rate limiting window
    pub rate_limit_window: Duration,
    /// How long in-flight requests may run once shutdown begins
    pub drain_timeout: Duration,
}

impl Default for HttpPolicy {
    fn default() -> Self {
        Self {
            body_limit: 10 * 1024,
            rate_limit_max: 100,
            rate_limit_window: Duration::from_secs(15 * 60),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration for server startup
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub db_uri: String,
    pub store: AnyStore,
    pub version: String,
    pub environment: String,
    pub retry: RetryPolicy,
    pub http: HttpPolicy,
}

/// Build the application router with its middleware stack
pub fn build_router<D: Datastore>(
    state: AppState<D>,
    policy: &HttpPolicy,
    rate_limiter: Arc<RateLimiter>,
) -> Router {
    // Create tracing layer for request logging
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &axum::http::Request<_>| {
            let request_id = generate_request_id();
            tracing::info_span!(
                "http_request",
                request_id = %request_id,
                method = %request.method(),
                uri = %request.uri(),
            )
        })
        .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
            debug!(
                method = %request.method(),
                uri = %request.uri(),
                "HTTP request started"
            );
        })
        .on_response(
            |response: &axum::http::Response<_>, latency: Duration, _span: &tracing::Span| {
                let status = response.status();
                if status.is_server_error() {
                    warn!(
                        status = %status,
                        latency_ms = latency.as_millis(),
                        "HTTP request failed"
                    );
                } else {
                    info!(
                        status = %status,
                        latency_ms = latency.as_millis(),
                        "HTTP request completed"
                    );
                }
            },
        );
    // Layers run outermost first: tracing, panics, headers, body size, rate limit
    Router::new()
        .route("/health", get(health::<D>))
        .route("/ready", get(ready::<D>))
        .route("/api/v1/status", get(status::<D>))
        .fallback(fallback)
        .method_not_allowed_fallback(fallback)
        .with_state(state)
        .layer(from_fn_with_state(rate_limiter, limit_requests))
        .layer(from_fn_with_state(policy.body_limit, limit_request_body))
        .layer(map_response(security_headers))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(trace_layer)
}

/// Serve requests until shutdown begins, then stop accepting new connections.
///
/// In-flight requests get at most `drain_timeout` to complete once shutdown
/// has begun; anything still running after that is abandoned.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    lifecycle: Arc<Lifecycle>,
    drain_timeout: Duration,
) -> Result<()> {
    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let lifecycle = lifecycle.clone();
        async move { lifecycle.shutdown_requested().await }
    })
    .into_future();
    tokio::pin!(server);
    tokio::select! {
        served = &mut server => return Ok(served?),
        _ = lifecycle.shutdown_requested() => {}
    }
    // Bound the time spent waiting for open connections
    match tokio::time::timeout(drain_timeout, server).await {
        Ok(served) => Ok(served?),
        Err(_) => {
            warn!(
                drain_timeout_secs = drain_timeout.as_secs_f64(),
                "Abandoned in-flight requests after the drain timeout"
            );
            Ok(())
        }
    }
}

/// Start the HTTP server and the database connection task
pub async fn start_server(config: ServerConfig) -> Result<()> {
    // Record when the process started serving
    let started_at = Instant::now();
    // Output debugging information
    info!(
        port = config.port,
        db_uri = %config.db_uri,
        namespace = config.store.surreal.namespace.as_deref(),
        database = config.store.surreal.database.as_deref(),
        version = %config.version,
        environment = %config.environment,
        max_attempts = config.retry.max_attempts,
        rate_limit_max = config.http.rate_limit_max,
        rate_limit_window_secs = config.http.rate_limit_window.as_secs(),
        body_limit = config.http.body_limit,
        drain_timeout_secs = config.http.drain_timeout.as_secs(),
        "Server configuration loaded"
    );
    // Failing to bind is the only fatal startup error
    let bind_address = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(bind_address)
        .await
        .map_err(|e| anyhow!("Failed to bind to address {bind_address}: {e}"))?;
    // Create the connection manager
    let connections = Arc::new(ConnectionManager::new(config.store, config.db_uri));
    let lifecycle = Arc::new(Lifecycle::new());
    let state = AppState {
        connections: connections.clone(),
        version: config.version,
        environment: config.environment,
        started_at,
    };
    // Create the rate limiter and keep its memory bounded
    let rate_limiter = Arc::new(RateLimiter::new(
        config.http.rate_limit_max,
        config.http.rate_limit_window,
    )?);
    tokio::spawn(purge_stale_clients(rate_limiter.clone(), Duration::from_secs(60)));
    let router = build_router(state, &config.http, rate_limiter);
    info!(%bind_address, "Server running on port {}", config.port);
    // Connect to the database while already serving requests
    let retry = tokio::spawn({
        let connections = connections.clone();
        let policy = config.retry;
        async move { connections.connect_with_retry(&policy).await }
    });
    // Begin shutdown on the first termination signal
    tokio::spawn(lifecycle.clone().watch_signals());
    // Serve the router until shutdown begins
    let served = serve(listener, router, lifecycle.clone(), config.http.drain_timeout).await;
    // Make sure the shutdown sequence runs even if serving failed
    lifecycle.begin_shutdown("server stopped");
    lifecycle.shutdown(&connections, retry).await?;
    served
}
