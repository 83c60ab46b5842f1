use anyhow::{Result, anyhow};
use metrics::{counter, gauge};
use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::db::Datastore;
use crate::utils::format_duration;

/// The state of the outbound database link
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        })
    }
}

/// Fixed linear retry policy for establishing the database connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The number of connection attempts before giving up
    pub max_attempts: u32,
    /// The upper bound on a single connection attempt
    pub attempt_timeout: Duration,
    /// The pause between two consecutive attempts
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            attempt_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(5),
        }
    }
}

/// Owns the single outbound database connection and its state.
///
/// The retry loop is the only writer of the state. Request handlers only ever
/// read it through [`ConnectionManager::is_ready`].
pub struct ConnectionManager<D: Datastore> {
    /// The datastore client used to open and close the connection
    store: D,
    /// The connection string of the datastore
    uri: String,
    /// The current state of the link
    state: RwLock<ConnectionState>,
    /// The connection handle, present only while connected
    connection: Mutex<Option<D::Connection>>,
}

impl<D: Datastore> ConnectionManager<D> {
    pub fn new(store: D, uri: impl Into<String>) -> Self {
        Self {
            store,
            uri: uri.into(),
            state: RwLock::new(ConnectionState::Disconnected),
            connection: Mutex::new(None),
        }
    }

    /// The current state of the database link
    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the database link is currently established
    pub fn is_ready(&self) -> Result<bool> {
        self.state
            .read()
            .map(|state| *state == ConnectionState::Connected)
            .map_err(|e| anyhow!("Connection state is unavailable: {e}"))
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
        gauge!("healthsvc.db_connected").set(if state == ConnectionState::Connected {
            1.0
        } else {
            0.0
        });
    }

    /// Connect to the datastore, retrying on failure.
    ///
    /// Returns whether a connection was established. Exhausting every attempt
    /// leaves the manager in [`ConnectionState::Failed`] and is not an error.
    pub async fn connect_with_retry(&self, policy: &RetryPolicy) -> bool {
        // Start the measurement timer
        let start_time = Instant::now();
        // Mark the link as being established
        self.set_state(ConnectionState::Connecting);
        // Output debugging information
        info!(
            max_attempts = policy.max_attempts,
            attempt_timeout = %format_duration(policy.attempt_timeout),
            retry_delay = %format_duration(policy.retry_delay),
            "Connecting to database"
        );
        for attempt in 1..=policy.max_attempts {
            counter!("healthsvc.db_connect_attempts").increment(1);
            // Bound the attempt by the configured timeout
            let result = match time::timeout(policy.attempt_timeout, self.store.connect(&self.uri))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(anyhow!(
                    "Connection attempt timed out after {}",
                    format_duration(policy.attempt_timeout)
                )),
            };
            match result {
                Ok(connection) => {
                    *self.connection.lock().await = Some(connection);
                    self.set_state(ConnectionState::Connected);
                    info!(
                        attempt,
                        elapsed = %format_duration(start_time.elapsed()),
                        "Connected to database"
                    );
                    return true;
                }
                Err(e) => {
                    counter!("healthsvc.db_connect_failures").increment(1);
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "Database connection attempt {attempt}/{} failed",
                        policy.max_attempts
                    );
                }
            }
            // Wait before the next attempt
            if attempt < policy.max_attempts {
                time::sleep(policy.retry_delay).await;
            }
        }
        self.set_state(ConnectionState::Failed);
        error!(
            attempts = policy.max_attempts,
            elapsed = %format_duration(start_time.elapsed()),
            "Giving up on database connection, continuing without it"
        );
        false
    }

    /// Release the connection if one is held. Safe to call repeatedly.
    pub async fn close(&self) -> Result<()> {
        let connection = self.connection.lock().await.take();
        let Some(connection) = connection else {
            debug!(state = %self.state(), "No database connection to close");
            self.set_state(ConnectionState::Disconnected);
            return Ok(());
        };
        info!("Closing database connection");
        let result = self.store.close(connection).await;
        self.set_state(ConnectionState::Disconnected);
        match &result {
            Ok(()) => info!("Database connection closed"),
            Err(e) => error!(error = %e, "Failed to close database connection cleanly"),
        }
        result
    }

    #[cfg(test)]
    pub(crate) fn poison_state(&self) {
        std::thread::scope(|scope| {
            let writer: std::thread::ScopedJoinHandle<'_, ()> = scope.spawn(|| {
                let _guard = self.state.write().unwrap();
                panic!("poisoning connection state");
            });
            assert!(writer.join().is_err());
        });
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, state: ConnectionState) {
        self.set_state(state);
    }
}
