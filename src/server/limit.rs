use anyhow::{Result, anyhow};
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode, header::CONTENT_LENGTH};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use metrics::counter;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// The body returned to clients that exceeded their request allowance
pub const RATE_LIMIT_MESSAGE: &str = "Too many requests from this IP";

/// The body returned when a request body exceeds the size limit
pub const BODY_LIMIT_MESSAGE: &str = "Request body too large";

/// Identify a client by its forwarded or peer IP address
pub fn client_key<B>(req: &Request<B>) -> String {
    // Try to extract the client IP from proxy headers first
    let ip = req
        .headers()
        .get("X-Forwarded-For")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            req.headers()
                .get("X-Real-IP")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
        });
    if let Some(ip) = ip {
        debug!(ip = ip, "Extracted client IP address from headers");
        return ip.to_string();
    }
    // Otherwise, try to retrieve the connection info
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        debug!(ip = ?addr.ip(), "Extracted client IP address from socket");
        return addr.ip().to_string();
    }
    // All unidentified clients share one allowance
    warn!("Could not extract client IP address from request, using default key");
    "unknown".to_string()
}

/// In-memory sliding window limiter keyed by client.
///
/// Each client keeps the instants of its accepted requests from the trailing
/// window. A request is accepted while fewer than `max_requests` of them remain,
/// so no window of that length ever holds more than `max_requests` accepted
/// requests from one client. Rejected requests are not recorded.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    clients: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    /// Allow `max_requests` per client in every `window`
    pub fn new(max_requests: u32, window: Duration) -> Result<Self> {
        // Output debugging information
        debug!(
            max_requests,
            window_secs = window.as_secs(),
            "Configuring the HTTP rate limiter"
        );
        if max_requests == 0 {
            return Err(anyhow!("The rate limit must allow at least one request"));
        }
        if window.is_zero() {
            return Err(anyhow!("The rate limit window must not be empty"));
        }
        Ok(Self {
            max_requests: max_requests as usize,
            window,
            clients: DashMap::new(),
        })
    }

    /// Count a request from `key`, or return how long until the client may retry
    pub fn check(&self, key: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut hits = self.clients.entry(key.to_string()).or_default();
        // Forget requests that have left the window
        while hits
            .front()
            .is_some_and(|hit| now.duration_since(*hit) >= self.window)
        {
            hits.pop_front();
        }
        if hits.len() < self.max_requests {
            hits.push_back(now);
            return Ok(());
        }
        let oldest = hits.front().copied().unwrap_or(now);
        Err(self.window.saturating_sub(now.duration_since(oldest)))
    }

    /// Drop clients with no request inside the window, returning how many remain
    pub fn purge(&self) -> usize {
        let now = Instant::now();
        self.clients.retain(|_, hits| {
            hits.back()
                .is_some_and(|last| now.duration_since(*last) < self.window)
        });
        self.clients.len()
    }
}

/// Reject clients that used up their allowance with 429
pub async fn limit_requests(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let key = client_key(&request);
    match limiter.check(&key) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            // Output debugging information
            warn!(
                client = %key,
                retry_after_secs = retry_after.as_secs(),
                "Rate limit exceeded"
            );
            // Increment rate limit error metrics
            counter!("healthsvc.total_rate_limit_errors").increment(1);
            (StatusCode::TOO_MANY_REQUESTS, RATE_LIMIT_MESSAGE).into_response()
        }
    }
}

/// Buffer the request body, rejecting it with 413 once it exceeds `limit` bytes
pub async fn limit_request_body(
    State(limit): State<usize>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    // A declared length over the limit is rejected without reading
    let declared = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|length| length > limit as u64) {
        debug!(limit, declared, "Rejected request with oversized Content-Length");
        return (StatusCode::PAYLOAD_TOO_LARGE, BODY_LIMIT_MESSAGE).into_response();
    }
    // Chunked or undeclared bodies are read up to the limit
    match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => next.run(Request::from_parts(parts, Body::from(bytes))).await,
        Err(e) => {
            debug!(limit, error = %e, "Rejected oversized request body");
            (StatusCode::PAYLOAD_TOO_LARGE, BODY_LIMIT_MESSAGE).into_response()
        }
    }
}

/// Periodically drop clients whose window has fully elapsed
pub async fn purge_stale_clients(limiter: Arc<RateLimiter>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let tracked_clients = limiter.purge();
        debug!(tracked_clients, "Purged stale rate limiter entries");
    }
}
