use anyhow::anyhow;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::{Json, response::IntoResponse};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use super::error::AppError;
use crate::connection::ConnectionManager;
use crate::db::Datastore;

/// Shared state handed to every request handler
pub struct AppState<D: Datastore> {
    /// The manager of the database connection
    pub connections: Arc<ConnectionManager<D>>,
    /// The application version reported by the status endpoint
    pub version: String,
    /// The deployment environment reported by the status endpoint
    pub environment: String,
    /// When the process started serving
    pub started_at: Instant,
}

impl<D: Datastore> Clone for AppState<D> {
    fn clone(&self) -> Self {
        Self {
            connections: self.connections.clone(),
            version: self.version.clone(),
            environment: self.environment.clone(),
            started_at: self.started_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Liveness {
    pub status: &'static str,
    pub timestamp: String,
    pub uptime: f64,
}

#[derive(Debug, Serialize)]
pub struct ApiStatus {
    pub message: &'static str,
    pub version: String,
    pub environment: String,
}

/// Liveness endpoint, independent of any downstream dependency
pub async fn health<D: Datastore>(State(state): State<AppState<D>>) -> Json<Liveness> {
    Json(Liveness {
        status: "healthy",
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        uptime: state.started_at.elapsed().as_secs_f64(),
    })
}

/// Readiness endpoint, reporting whether the database link is established
pub async fn ready<D: Datastore>(State(state): State<AppState<D>>) -> impl IntoResponse {
    match state.connections.is_ready() {
        Ok(true) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Ok(false) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not ready",
                "reason": "database not connected"
            })),
        ),
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "not ready",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Static API status endpoint
pub async fn status<D: Datastore>(State(state): State<AppState<D>>) -> Json<ApiStatus> {
    Json(ApiStatus {
        message: "API is running",
        version: state.version,
        environment: state.environment,
    })
}

/// Catch-all for requests no route accepts
pub async fn fallback(method: Method, uri: Uri) -> AppError {
    AppError::from(anyhow!("No route for {method} {uri}"))
}
