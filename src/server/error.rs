use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use metrics::counter;
use serde_json::json;
use std::any::Any;
use tracing::error;

/// Log a failure and produce the generic 500 response
pub fn internal_error_response(message: &str) -> Response {
    // Output debugging information
    error!(error = %message, "Error");
    // Increment error metrics
    counter!("healthsvc.total_errors").increment(1);
    // Never expose the underlying message to the client
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal Server Error" })),
    )
        .into_response()
}

/// An error raised while handling a request
#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        internal_error_response(&self.0.to_string())
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Convert a handler panic into the generic 500 response
pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "Unknown panic message".to_string()
    };
    internal_error_response(&format!("Handler panicked: {message}"))
}
