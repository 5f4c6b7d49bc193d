//! Background refresh timer.
//!
//! A single task ticks at a fixed period and starts a refresh-all pass on
//! each tick, unless one (timer- or user-triggered) is still running.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::service::{FeedService, RefreshEntry};

/// Handle to the running refresh timer.
///
/// Dropping it stops the timer as well; [`shutdown`](Self::shutdown) also
/// waits for the timer task to exit.
pub struct RefreshScheduler {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl RefreshScheduler {
    /// Start refreshing every `period`, first pass one period from now.
    ///
    /// A zero `period` starts a timer that never fires.
    ///
    /// Each completed pass's outcome list is sent on `report` when given; a
    /// full or closed channel drops the report.
    pub fn spawn(
        service: FeedService,
        period: Duration,
        report: Option<mpsc::Sender<Vec<RefreshEntry>>>,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(run(service, period, report, stop_rx));
        Self {
            stop_tx: Some(stop_tx),
            handle,
        }
    }

    /// Stop ticking. A pass already in progress runs to completion.
    pub async fn shutdown(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            tracing::warn!(error = %e, "Refresh timer task ended abnormally");
        }
    }
}

async fn run(
    service: FeedService,
    period: Duration,
    report: Option<mpsc::Sender<Vec<RefreshEntry>>>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    if period.is_zero() {
        tracing::warn!("Refresh period is zero, background refresh disabled");
        let _ = stop_rx.await;
        return;
    }

    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::info!(period_secs = period.as_secs(), "Background refresh started");

    loop {
        tokio::select! {
            biased;

            // Also resolves when the handle is dropped
            _ = &mut stop_rx => break,

            _ = ticker.tick() => {
                if service.is_refreshing() {
                    tracing::debug!("Refresh still in flight, skipping tick");
                    continue;
                }
                let service = service.clone();
                let report = report.clone();
                tokio::spawn(async move {
                    let Some(entries) = service.try_refresh_all().await else {
                        tracing::debug!("Refresh started elsewhere, skipping tick");
                        return;
                    };
                    if let Some(tx) = report {
                        if let Err(e) = tx.try_send(entries) {
                            tracing::debug!(error = %e, "Refresh report dropped");
                        }
                    }
                });
            }
        }
    }

    tracing::info!("Background refresh stopped");
}
