//! Shutdown coordination
//!
//! A single [`Shutdown`] handle is created at startup and cloned into every
//! long-running component. Requesting shutdown is idempotent; components
//! either poll [`Shutdown::is_requested`] or await the underlying token.
//!
//! Shutdown runs in two phases. [`Shutdown::request`] stops ingress; the
//! final state flush waits on [`Shutdown::flush_token`], released by
//! [`Shutdown::complete`] once in-flight decisions have ended.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Process-wide shutdown flag
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    flush: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every component to wind down
    pub fn request(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token observed by workers and daemons
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Token of the final state flush, released by [`Shutdown::complete`]
    pub fn flush_token(&self) -> CancellationToken {
        self.flush.clone()
    }

    /// Ingress has drained; let the last components finish
    pub fn complete(&self) {
        self.request();
        self.flush.cancel();
    }

    /// Resolve once shutdown has been requested
    pub async fn requested(&self) {
        self.token.cancelled().await
    }

    /// Wait for SIGINT or SIGTERM, then request shutdown.
    ///
    /// Returns early if shutdown is requested by other means.
    pub async fn wait_for_signal(&self) {
        let signal = tokio::select! {
            signal = termination_signal() => signal,
            _ = self.token.cancelled() => return,
        };

        info!(signal, "Received termination signal");
        self.request();
    }
}

#[cfg(unix)]
async fn termination_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut term, mut int) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            warn!("Unable to install signal handlers: {}", e);
            return ctrl_c().await;
        }
    };

    tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = int.recv() => "SIGINT",
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "SIGINT",
        Err(e) => {
            warn!("Unable to listen for shutdown signal: {}", e);
            std::future::pending().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_is_seen_by_clones() {
        let shutdown = Shutdown::new();
        let token = shutdown.token();
        let other = shutdown.clone();

        assert!(!other.is_requested());
        shutdown.request();
        shutdown.request();

        assert!(other.is_requested());
        assert!(token.is_cancelled());
        other.requested().await;
    }

    #[tokio::test]
    async fn test_wait_for_signal_returns_on_request() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait_for_signal().await })
        };

        shutdown.request();
        waiter.await.unwrap();
        assert!(shutdown.is_requested());
    }

    #[test]
    fn test_flush_token_outlives_request() {
        let shutdown = Shutdown::new();
        let flush = shutdown.flush_token();

        shutdown.request();
        assert!(!flush.is_cancelled());

        shutdown.complete();
        assert!(flush.is_cancelled());
        assert!(shutdown.is_requested());
    }
}
