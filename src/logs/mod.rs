use metrics::{counter, gauge};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// The output format of log lines
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human readable lines
    Text,
    /// One JSON object per line
    Json,
}

/// Initialize structured logging and metrics collection
pub fn init_logging_and_metrics(format: LogFormat) {
    // Set up environment filter for log levels
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("healthsvc=info,tower_http=info"));
    // Initialize tracing subscriber with stdout output
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stdout),
            )
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stdout),
            )
            .init(),
    }
    // Output debugging information
    info!("Logging and tracing initialized");
    // Initialize metrics with default values
    gauge!("healthsvc.db_connected").set(0.0);
    counter!("healthsvc.db_connect_attempts").absolute(0);
    counter!("healthsvc.db_connect_failures").absolute(0);
    counter!("healthsvc.total_errors").absolute(0);
    counter!("healthsvc.total_rate_limit_errors").absolute(0);
    // Output debugging information
    info!("Metrics collection initialized");
}
