use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::providers::ForecastSource;
use crate::reconcile::Reconciler;
use crate::sampler::Sampler;

/// Drives the sampler and the reconciler on their own fixed intervals
pub struct Scheduler<S> {
    sampler: Arc<Sampler<S>>,
    reconciler: Arc<Reconciler>,
    poll_interval: Duration,
    reconciliation_interval: Duration,
}

impl<S: ForecastSource + 'static> Scheduler<S> {
    pub fn new(
        sampler: Sampler<S>,
        reconciler: Reconciler,
        poll_interval: Duration,
        reconciliation_interval: Duration,
    ) -> Self {
        Self {
            sampler: Arc::new(sampler),
            reconciler: Arc::new(reconciler),
            poll_interval,
            reconciliation_interval,
        }
    }

    /// Spawn both loops; they stop once `shutdown` flips to true
    pub fn start(self, shutdown: watch::Receiver<bool>) -> (JoinHandle<()>, JoinHandle<()>) {
        let sampler = self.sampler;
        let sampler_handle = tokio::spawn(run_periodic(
            "sampler",
            self.poll_interval,
            shutdown.clone(),
            move |now| {
                let sampler = sampler.clone();
                async move { sampler.run_cycle(now).await }
            },
        ));

        let reconciler = self.reconciler;
        let reconciler_handle = tokio::spawn(run_periodic(
            "reconciler",
            self.reconciliation_interval,
            shutdown,
            move |now| {
                let reconciler = reconciler.clone();
                async move {
                    if let Err(e) = reconciler.run_cycle(now).await {
                        error!(error = %e, "Reconciliation cycle failed, will retry on next tick");
                    }
                }
            },
        ));

        (sampler_handle, reconciler_handle)
    }
}

/// Run `task` every `period` until shutdown.
///
/// Each cycle is awaited before the next tick is taken and missed ticks are
/// skipped, so a cycle never overlaps with itself. A cycle still running at
/// shutdown is dropped.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut task: F,
) where
    F: FnMut(DateTime<Utc>) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(task = name, period_secs = period.as_secs(), "Starting periodic task");

    while !*shutdown.borrow() {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = interval.tick() => {}
        }

        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                info!(task = name, "Abandoning in-flight cycle");
                break;
            }
            _ = task(Utc::now()) => {}
        }
    }

    info!(task = name, "Stopped periodic task");
}
