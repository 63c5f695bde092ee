//! Process shutdown coordination.
//!
//! A [`Shutdown`] handle is cloned into every component that must wind
//! down when the process receives SIGTERM or SIGINT: the HTTP server stops
//! accepting requests, and the tenant manager drains its consumers within
//! the configured grace budget.
//!
//! # Example
//!
//! ```rust,ignore
//! let shutdown = Shutdown::new();
//! tokio::spawn(shutdown::signal_listener(shutdown.clone()));
//!
//! axum::serve(listener, app)
//!     .with_graceful_shutdown(async move { shutdown.requested().await })
//!     .await?;
//! ```

use tokio::sync::watch;
use tracing::info;

/// Clonable handle signalling that the process should wind down.
#[derive(Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Request shutdown. Idempotent; every waiter is released.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether shutdown has been requested.
    pub fn triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Complete once shutdown has been requested. Returns immediately if
    /// it already was.
    pub async fn requested(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for SIGTERM or SIGINT, then trigger the handle.
pub async fn signal_listener(shutdown: Shutdown) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }

    shutdown.trigger();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_releases_waiter() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();

        let handle = tokio::spawn(async move { waiter.requested().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.trigger();

        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("waiter not released")
            .unwrap();
    }

    #[tokio::test]
    async fn test_requested_after_trigger_is_immediate() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        assert!(shutdown.triggered());

        tokio::time::timeout(Duration::from_millis(10), shutdown.requested())
            .await
            .expect("should resolve immediately");
    }

    #[tokio::test]
    async fn test_not_triggered_initially() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.triggered());
    }
}
