//! Graceful Shutdown
//!
//! Coordinates shutdown of the listeners and background tasks, and lets
//! the gateway drain in-flight proxied requests before exiting.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

/// Shutdown coordinator shared by every long-running component.
#[derive(Clone)]
pub struct ShutdownController {
    initiated: Arc<AtomicBool>,
    /// Proxied requests currently being handled
    in_flight: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
    drained: Arc<Notify>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            initiated: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            drained: Arc::new(Notify::new()),
        }
    }

    /// Subscribe to the shutdown broadcast.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate shutdown. Idempotent.
    pub fn shutdown(&self) {
        if !self.initiated.swap(true, Ordering::SeqCst) {
            tracing::info!("initiating graceful shutdown");
            let _ = self.shutdown_tx.send(());
            if self.in_flight() == 0 {
                self.drained.notify_waiters();
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been initiated.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        if self.is_shutdown() {
            return;
        }
        let _ = rx.recv().await;
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Track one proxied request until the guard drops.
    pub fn request_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            controller: self.clone(),
        }
    }

    fn request_finished(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.is_shutdown() {
            self.drained.notify_waiters();
        }
    }

    /// Wait for in-flight requests to finish, up to `timeout`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.drained.notified();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(timeout, drained).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!("drain timeout: {} requests still in flight", self.in_flight());
                false
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped in-flight request marker.
pub struct InFlightGuard {
    controller: ShutdownController,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.controller.request_finished();
    }
}

/// Wait for SIGINT or SIGTERM, then initiate shutdown.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn shutdown_signal(controller: ShutdownController) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
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
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
        _ = controller.wait() => {}
    }

    controller.shutdown();
}
