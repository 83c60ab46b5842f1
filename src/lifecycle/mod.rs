//! Process lifecycle: termination signals and the shutdown sequence.
//!
//! ```text
//! running --(SIGTERM / SIGINT)--> shutting-down --(listener drained,
//!     retry loop cancelled, connection closed)--> terminated
//! ```
//!
//! Only the first signal starts the sequence; later ones are ignored.

use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionManager;
use crate::db::Datastore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    Running = 0,
    ShuttingDown = 1,
    Terminated = 2,
}

impl From<u8> for LifecycleState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::ShuttingDown,
            _ => Self::Terminated,
        }
    }
}

/// Coordinates the single graceful shutdown of the process
pub struct Lifecycle {
    state: AtomicU8,
    shutdown: watch::Sender<bool>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            state: AtomicU8::new(LifecycleState::Running as u8),
            shutdown,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state.load(Ordering::SeqCst).into()
    }

    /// Move from running to shutting down. Returns false if shutdown had already begun.
    pub fn begin_shutdown(&self, reason: &str) -> bool {
        let started = self
            .state
            .compare_exchange(
                LifecycleState::Running as u8,
                LifecycleState::ShuttingDown as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if started {
            info!(reason, "Shutting down gracefully");
            self.shutdown.send_replace(true);
        } else {
            debug!(reason, "Shutdown already in progress, ignoring");
        }
        started
    }

    /// Resolves once shutdown has begun
    pub async fn shutdown_requested(&self) {
        let mut rx = self.shutdown.subscribe();
        // The sender lives as long as self, so this cannot fail
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Wait for the first termination signal and begin shutdown
    pub async fn watch_signals(self: Arc<Self>) {
        match termination_signal().await {
            Ok(name) => {
                self.begin_shutdown(name);
            }
            Err(e) => error!(error = %e, "Failed to install signal handlers"),
        }
    }

    /// Release resources once the listener has stopped accepting requests
    pub async fn shutdown<D: Datastore>(
        &self,
        connections: &ConnectionManager<D>,
        retry: JoinHandle<bool>,
    ) -> Result<()> {
        debug!(state = ?self.state(), "Releasing resources");
        // Stop any connection attempts still in flight
        retry.abort();
        match retry.await {
            Ok(connected) => debug!(connected, "Database connection task had finished"),
            Err(e) if e.is_cancelled() => info!("Cancelled pending database connection attempts"),
            Err(e) => warn!(error = %e, "Database connection task failed"),
        }
        // Close the database connection before exiting
        if let Err(e) = connections.close().await {
            error!(error = %e, "Error while closing database connection");
        }
        self.state
            .store(LifecycleState::Terminated as u8, Ordering::SeqCst);
        info!("Shutdown complete");
        Ok(())
    }
}

/// Wait for SIGTERM or SIGINT, returning the name of the signal received
async fn termination_signal() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionState, RetryPolicy};
    use crate::db::testing::{Behaviour, ScriptedStore};
    use std::time::Duration;

    #[test]
    fn test_starts_running() {
        assert_eq!(Lifecycle::new().state(), LifecycleState::Running);
    }

    #[test]
    fn test_shutdown_begins_only_once() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin_shutdown("SIGTERM"));
        assert_eq!(lifecycle.state(), LifecycleState::ShuttingDown);
        assert!(!lifecycle.begin_shutdown("SIGTERM"));
        assert_eq!(lifecycle.state(), LifecycleState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_shutdown_requested_resolves_after_begin() {
        let lifecycle = Arc::new(Lifecycle::new());
        let waiter = tokio::spawn({
            let lifecycle = lifecycle.clone();
            async move { lifecycle.shutdown_requested().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        lifecycle.begin_shutdown("test");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("shutdown should be observed")
            .unwrap();
        // Late subscribers observe it immediately
        lifecycle.shutdown_requested().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_connection() {
        let store = ScriptedStore::new(Behaviour::SucceedAfter(0));
        let connections = Arc::new(ConnectionManager::new(store.clone(), "mem://"));
        let retry = tokio::spawn({
            let connections = connections.clone();
            async move { connections.connect_with_retry(&RetryPolicy::default()).await }
        });
        // Let the connection task finish
        while connections.state() != ConnectionState::Connected {
            tokio::task::yield_now().await;
        }
        let lifecycle = Lifecycle::new();
        lifecycle.begin_shutdown("SIGTERM");
        lifecycle.shutdown(&connections, retry).await.unwrap();
        assert_eq!(store.closed(), 1);
        assert_eq!(connections.state(), ConnectionState::Disconnected);
        assert_eq!(lifecycle.state(), LifecycleState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_retries() {
        let store = ScriptedStore::new(Behaviour::Hang);
        let connections = Arc::new(ConnectionManager::new(store.clone(), "mem://"));
        let retry = tokio::spawn({
            let connections = connections.clone();
            async move { connections.connect_with_retry(&RetryPolicy::default()).await }
        });
        tokio::task::yield_now().await;
        let lifecycle = Lifecycle::new();
        lifecycle.begin_shutdown("SIGTERM");
        lifecycle.shutdown(&connections, retry).await.unwrap();
        assert_eq!(store.attempts().len(), 1);
        assert_eq!(store.closed(), 0);
        assert_eq!(connections.state(), ConnectionState::Disconnected);
        assert_eq!(lifecycle.state(), LifecycleState::Terminated);
    }
}
