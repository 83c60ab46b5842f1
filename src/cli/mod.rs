use clap::Parser;
use std::time::Duration;

use crate::connection::RetryPolicy;
use crate::db::{AnyStore, MongoStore, SurrealStore};
use crate::logs::LogFormat;
use crate::server::{HttpPolicy, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "healthsvc")]
#[command(about = "HTTP health, readiness and status service")]
#[command(version)]
pub struct Cli {
    /// The TCP port to listen on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,
    /// The database connection string
    #[arg(
        long = "db-uri",
        env = "MONGODB_URI",
        default_value = "mongodb://mongodb:27017/myapp"
    )]
    pub db_uri: String,
    /// The database namespace to use
    #[arg(long, env = "SURREALDB_NS")]
    pub db_namespace: Option<String>,
    /// The database name to use
    #[arg(long, env = "SURREALDB_DB")]
    pub db_database: Option<String>,
    /// The database username to use
    #[arg(long, env = "SURREALDB_USER")]
    pub db_user: Option<String>,
    /// The database password to use
    #[arg(long, env = "SURREALDB_PASS", hide_env_values = true)]
    pub db_pass: Option<String>,
    /// The application version reported by the status endpoint
    #[arg(long, env = "APP_VERSION", default_value = "1.0.0")]
    pub app_version: String,
    /// The environment name reported by the status endpoint
    #[arg(long, env = "NODE_ENV", default_value = "development")]
    pub environment: String,
    /// The number of database connection attempts at startup
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u32).range(1..))]
    pub db_max_attempts: u32,
    /// The timeout of a single database connection attempt, in seconds
    #[arg(long, default_value_t = 5)]
    pub db_attempt_timeout_secs: u64,
    /// The pause between database connection attempts, in seconds
    #[arg(long, default_value_t = 5)]
    pub db_retry_delay_secs: u64,
    /// The number of requests a client may make in each window
    #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u32).range(1..))]
    pub rate_limit_max: u32,
    /// The length of the rate limiting window, in seconds
    #[arg(long, default_value_t = 900, value_parser = clap::value_parser!(u64).range(1..))]
    pub rate_limit_window_secs: u64,
    /// How long in-flight requests may run after shutdown begins, in seconds
    #[arg(long, default_value_t = 10)]
    pub shutdown_timeout_secs: u64,
    /// The log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Cli {
    /// Convert the parsed arguments into the server configuration
    pub fn into_config(self) -> ServerConfig {
        let attempt_timeout = Duration::from_secs(self.db_attempt_timeout_secs);
        ServerConfig {
            port: self.port,
            db_uri: self.db_uri,
            store: AnyStore {
                mongo: MongoStore {
                    server_selection_timeout: Some(attempt_timeout),
                },
                surreal: SurrealStore {
                    namespace: self.db_namespace,
                    database: self.db_database,
                    username: self.db_user,
                    password: self.db_pass,
                },
            },
            version: self.app_version,
            environment: self.environment,
            retry: RetryPolicy {
                max_attempts: self.db_max_attempts,
                attempt_timeout,
                retry_delay: Duration::from_secs(self.db_retry_delay_secs),
            },
            http: HttpPolicy {
                rate_limit_max: self.rate_limit_max,
                rate_limit_window: Duration::from_secs(self.rate_limit_window_secs),
                drain_timeout: Duration::from_secs(self.shutdown_timeout_secs),
                ..HttpPolicy::default()
            },
        }
    }
}
