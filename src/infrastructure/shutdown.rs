//! Graceful Shutdown Handler
//!
//! Coordinated shutdown for the RPC server, replication agents and the binary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Shutdown coordinator for graceful termination.
///
/// Hands out cancellation tokens to background tasks and tracks open RPC
/// sessions so shutdown can wait for them to drain.
#[derive(Clone)]
pub struct ShutdownController {
    token: CancellationToken,
    active_sessions: Arc<AtomicUsize>,
    drain_complete: Arc<Notify>,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            active_sessions: Arc::new(AtomicUsize::new(0)),
            drain_complete: Arc::new(Notify::new()),
        }
    }

    /// Token cancelled when shutdown starts. Cancelling the child does not
    /// shut anything else down.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Initiate graceful shutdown. Idempotent.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("initiating graceful shutdown");
            self.token.cancel();
            if self.active_sessions() == 0 {
                self.drain_complete.notify_waiters();
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has been initiated.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    fn session_ended(&self) {
        let prev = self.active_sessions.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.is_shutdown() {
            self.drain_complete.notify_waiters();
        }
    }

    /// Wait for all sessions to drain (with timeout).
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = self.drain_complete.notified();
        if self.active_sessions() == 0 {
            return true;
        }

        tokio::select! {
            _ = drained => true,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    "drain timeout: {} sessions still active",
                    self.active_sessions()
                );
                false
            }
        }
    }

    /// Track an RPC session until the guard is dropped.
    pub fn session_guard(&self) -> SessionGuard {
        self.active_sessions.fetch_add(1, Ordering::SeqCst);
        SessionGuard {
            controller: self.clone(),
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for an open RPC session.
pub struct SessionGuard {
    controller: ShutdownController,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.controller.session_ended();
    }
}

/// Install signal handlers for graceful shutdown.
///
/// Completes when Ctrl+C or SIGTERM is received, after triggering shutdown.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn shutdown_signal(controller: ShutdownController) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
        _ = controller.cancelled() => {}
    }

    controller.shutdown();
}
