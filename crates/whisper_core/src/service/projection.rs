//! Background replay of deferred graph projections.
//!
//! # Responsibility
//! - Call `WhisperService::drain` on a fixed interval until cancelled.
//!
//! # Invariants
//! - A failed pass is logged and the loop keeps running.
//! - Cancellation stops the loop between passes, never in the middle of one.
//! - The worker stops on its own once the service is shut down.

use crate::service::whisper_service::{WhisperError, WhisperService};
use crate::store::{GraphIndex, PrimaryStore};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Periodic outbox drainer sharing a service with request handlers.
pub struct ProjectionWorker<P: PrimaryStore, G: GraphIndex> {
    service: Arc<WhisperService<P, G>>,
    interval: Duration,
    batch_size: u32,
    shutdown_token: CancellationToken,
}

impl<P, G> ProjectionWorker<P, G>
where
    P: PrimaryStore + 'static,
    G: GraphIndex + 'static,
{
    pub fn new(service: Arc<WhisperService<P, G>>, interval: Duration, batch_size: u32) -> Self {
        Self {
            service,
            interval,
            batch_size,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Returns a token that stops the worker when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Spawns the replay loop on the current tokio runtime.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(
            "event=projection_worker module=service status=start interval_ms={} batch={}",
            self.interval.as_millis(),
            self.batch_size
        );

        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.service.drain(self.batch_size).await {
                        Ok(report) => {
                            debug!(
                                "event=projection_worker module=service status=pass applied={} failed={} dead={} skipped={}",
                                report.applied, report.failed, report.dead, report.skipped
                            );
                        }
                        Err(WhisperError::Closed) => break,
                        Err(err) => {
                            warn!("event=projection_worker module=service status=warn error={err}");
                        }
                    }
                }
                _ = self.shutdown_token.cancelled() => break,
            }
        }

        info!("event=projection_worker module=service status=stopped");
    }
}
