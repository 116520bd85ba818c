//! Periodic batch trigger
//!
//! Runs one batch per interval until Ctrl+C, SIGTERM or an explicit shutdown
//! signal. A batch in progress always runs to completion so no claimed item
//! is left in `processing` by a clean shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::processor::QueueProcessor;

/// Interval-driven batch runner
pub struct Scheduler {
    processor: Arc<QueueProcessor>,
    batch_size: usize,
    interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new(processor: Arc<QueueProcessor>, batch_size: usize, interval: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            processor,
            batch_size,
            interval,
            shutdown_tx,
        }
    }

    /// Sender that stops the loop after the current batch
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run until a process signal arrives
    pub async fn run(&self) -> Result<()> {
        info!(
            "Scheduler running: batch of {} every {:?}",
            self.batch_size, self.interval
        );

        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                _ = wait_for_sigterm() => info!("Received SIGTERM, shutting down"),
            }
            let _ = shutdown_tx.send(());
        });

        let batches = self.run_until_shutdown().await;
        info!("Scheduler stopped after {} batches", batches);
        Ok(())
    }

    /// Run batches on the interval until the shutdown channel fires.
    /// Returns the number of batches run.
    pub async fn run_until_shutdown(&self) -> u64 {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(self.interval);
        // A slow batch delays the next one instead of causing a burst
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut batches = 0;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown_rx.recv() => break,
            }

            match self.processor.process_batch(self.batch_size).await {
                Ok(report) => debug!("Batch {} report: {:?}", batches + 1, report),
                Err(e) => error!("Batch failed: {}", e),
            }
            batches += 1;
        }
        batches
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!("Failed to register SIGTERM handler: {}. Falling back to pending future.", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
