use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::models::ForecastSnapshot;
use crate::providers::{FeedError, ForecastSource};
use crate::store::{self, StoreError};

/// Polls the forecast source for every configured stop and appends the results
pub struct Sampler<S> {
    pool: SqlitePool,
    source: S,
    stop_codes: Vec<String>,
    fetch_timeout: Duration,
    max_concurrent_fetches: usize,
}

impl<S: ForecastSource> Sampler<S> {
    pub fn new(
        pool: SqlitePool,
        source: S,
        stop_codes: Vec<String>,
        fetch_timeout: Duration,
        max_concurrent_fetches: usize,
    ) -> Self {
        Self {
            pool,
            source,
            stop_codes,
            fetch_timeout,
            max_concurrent_fetches: max_concurrent_fetches.max(1),
        }
    }

    /// Sample every stop once, stamping all rows with `now`.
    ///
    /// Failures are contained per stop: they are logged and the remaining stops
    /// are still sampled.
    pub async fn run_cycle(&self, now: DateTime<Utc>) {
        let mut stored = 0u64;
        let mut success_count = 0;
        let mut error_count = 0;

        // A stuck stop holds one permit until its fetch times out
        let permits = Semaphore::new(self.max_concurrent_fetches);
        let tasks = self.stop_codes.iter().map(|stop_code| {
            let permits = &permits;
            async move {
                let _permit = permits.acquire().await;
                self.sample_stop(stop_code, now).await
            }
        });
        let results = futures::future::join_all(tasks).await;

        for (stop_code, result) in self.stop_codes.iter().zip(results) {
            match result {
                Ok(count) => {
                    stored += count;
                    success_count += 1;
                }
                Err(SampleError::FeedError(e)) => {
                    warn!(stop = %stop_code, error = %e, "Failed to fetch forecasts, skipping stop");
                    error_count += 1;
                }
                Err(SampleError::StoreError(e)) => {
                    error!(stop = %stop_code, error = %e, "Failed to store forecasts, batch rolled back");
                    error_count += 1;
                }
            }
        }

        info!(
            stops = self.stop_codes.len(),
            success = success_count,
            errors = error_count,
            snapshots = stored,
            "Completed sampling cycle"
        );
    }

    /// Fetch one stop and persist its batch atomically
    async fn sample_stop(&self, stop_code: &str, now: DateTime<Utc>) -> Result<u64, SampleError> {
        let started = Instant::now();
        let records = tokio::time::timeout(self.fetch_timeout, self.source.fetch_forecasts(stop_code))
            .await
            .map_err(|_| {
                FeedError::Transport(format!("timed out after {}s", self.fetch_timeout.as_secs_f64()))
            })??;

        if records.is_empty() {
            debug!(stop = %stop_code, "No forecasts for stop");
            return Ok(0);
        }

        let snapshots: Vec<ForecastSnapshot> = records
            .iter()
            .map(|record| ForecastSnapshot::from_record(record, now))
            .collect();

        let fetch_ms = started.elapsed().as_millis() as u64;

        let count = store::insert_snapshot_batch(&self.pool, &snapshots).await?;
        debug!(
            stop = %stop_code,
            count,
            fetch_ms,
            feed_observed_at = %records[0].observed_at,
            "Stored forecast snapshots"
        );

        Ok(count)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("{0}")]
    FeedError(#[from] FeedError),
    #[error("{0}")]
    StoreError(#[from] StoreError),
}
