//! Pending Re-check Worker
//!
//! Background service that periodically re-verifies submissions held
//! pending because a hard-block checker timed out or could not reach a
//! definite result.
//!
//! # Configuration
//!
//! - `RECHECK_INTERVAL_SECS` - How often to re-check (default: 300)
//! - `RECHECK_BATCH_SIZE` - Submissions per run (default: 50)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{error, info};

use super::service::VerificationService;
use crate::infra::ShutdownSignal;

/// Message types for re-check worker control
#[derive(Debug)]
pub enum RecheckMessage {
    /// Run a re-check now instead of waiting for the next tick
    RunNow,
    /// Shutdown the worker
    Shutdown,
}

pub struct RecheckWorker {
    service: Arc<VerificationService>,
    interval: Duration,
    batch_size: u32,
    control_tx: mpsc::Sender<RecheckMessage>,
    control_rx: mpsc::Receiver<RecheckMessage>,
}

impl RecheckWorker {
    pub fn new(service: Arc<VerificationService>) -> Self {
        let (control_tx, control_rx) = mpsc::channel(16);
        let interval = service.config().recheck_interval;
        let batch_size = service.config().recheck_batch_size;
        Self {
            service,
            interval,
            batch_size,
            control_tx,
            control_rx,
        }
    }

    /// Get a sender handle for controlling the worker
    pub fn control_handle(&self) -> mpsc::Sender<RecheckMessage> {
        self.control_tx.clone()
    }

    /// Run until shutdown or a `Shutdown` message.
    pub async fn run(mut self, shutdown: ShutdownSignal) {
        info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "Starting pending re-check worker"
        );

        let mut ticker = interval(self.interval);
        // The first tick completes immediately; nothing is pending at boot
        // that a request has not already tried.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    info!("Pending re-check worker shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                Some(msg) = self.control_rx.recv() => {
                    match msg {
                        RecheckMessage::RunNow => {
                            info!("Forcing pending re-check");
                            self.run_once().await;
                        }
                        RecheckMessage::Shutdown => {
                            info!("Pending re-check worker shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn run_once(&self) {
        if let Err(e) = self.service.recheck_pending(self.batch_size).await {
            error!(error = %e, "Error re-checking pending verifications");
        }
    }
}
