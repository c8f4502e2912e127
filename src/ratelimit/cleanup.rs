//! Background maintenance for a running limiter.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::limiter::RateLimiter;

/// Handle to the loop started by [`spawn_cleanup`].
#[derive(Debug)]
pub struct CleanupHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CleanupHandle {
    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        // The loop may already be gone if the runtime is shutting down.
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Cleanup task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Every `interval`, purge expired counters, probe the distributed store and
/// log a metrics snapshot.
pub fn spawn_cleanup(limiter: Arc<RateLimiter>, interval: Duration) -> CleanupHandle {
    let interval = interval.max(Duration::from_millis(1));
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut timer = interval_at(Instant::now() + interval, interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = IntervalStream::new(timer);

        info!(interval_ms = interval.as_millis() as u64, "Cleanup loop started");

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                tick = ticks.next() => {
                    if tick.is_none() {
                        break;
                    }
                    run_once(&limiter).await;
                }
            }
        }

        info!("Cleanup loop stopped");
    });

    CleanupHandle { shutdown_tx, task }
}

async fn run_once(limiter: &RateLimiter) {
    let removed = limiter.purge_expired().await;
    let healthy = limiter.probe_distributed().await;
    let snapshot = limiter.metrics().snapshot();

    debug!(
        removed = removed,
        local_entries = limiter.local_store().len(),
        distributed_healthy = ?healthy,
        total_requests = snapshot.total_requests,
        blocked_requests = snapshot.blocked_requests,
        rate_limited_requests = snapshot.rate_limited_requests,
        challenge_requests = snapshot.challenge_requests,
        redirect_requests = snapshot.redirect_requests,
        degraded_checks = snapshot.degraded_checks,
        backend_errors = snapshot.backend_errors,
        "Cleanup tick"
    );
}
