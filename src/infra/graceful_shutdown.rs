//! Graceful shutdown
//!
//! One coordinator per process. The HTTP server, the anomaly monitor tick
//! and the pending re-check worker all watch the same signal, so a SIGTERM
//! stops intake first and lets in-flight verifications finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Cloneable view of the shutdown state
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been initiated.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // A closed channel means the coordinator is gone; treat it as shutdown.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Owns the shutdown flag and fans it out to every background task
pub struct ShutdownCoordinator {
    initiated: AtomicBool,
    tx: watch::Sender<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            initiated: AtomicBool::new(false),
            tx,
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Initiate shutdown. Idempotent.
    pub fn shutdown(&self) {
        if self.initiated.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Initiating graceful shutdown");
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Completes on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Spawn `task`, dropping it when shutdown is signalled.
pub fn spawn_until_shutdown<F>(signal: ShutdownSignal, task: F) -> tokio::task::JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = signal.wait() => info!("Background task stopped by shutdown"),
            _ = task => {}
        }
    })
}

#[derive(Debug, Clone)]
pub struct GracefulShutdownConfig {
    /// Delay between the signal and closing the listener, so load balancers
    /// notice `/ready` failing first.
    pub shutdown_delay: Duration,
}

impl Default for GracefulShutdownConfig {
    fn default() -> Self {
        Self {
            shutdown_delay: Duration::from_secs(5),
        }
    }
}

/// Serve `router` until the coordinator signals shutdown.
pub async fn serve_with_shutdown(
    listener: tokio::net::TcpListener,
    router: axum::Router,
    coordinator: Arc<ShutdownCoordinator>,
    config: GracefulShutdownConfig,
) -> std::io::Result<()> {
    let signal = coordinator.signal();

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            signal.wait().await;
            info!(delay = ?config.shutdown_delay, "Draining before listener close");
            tokio::time::sleep(config.shutdown_delay).await;
        })
        .await
}
