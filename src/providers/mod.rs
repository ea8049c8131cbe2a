pub mod luas;

use std::future::Future;

use crate::models::ForecastRecord;

/// A source of real-time arrival forecasts for a single stop.
///
/// Implementations return only valid records: an empty list means the stop
/// legitimately has nothing forecast, not that the fetch failed.
pub trait ForecastSource: Send + Sync {
    fn fetch_forecasts(
        &self,
        stop_code: &str,
    ) -> impl Future<Output = Result<Vec<ForecastRecord>, FeedError>> + Send;
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Feed transport error: {0}")]
    Transport(String),
    #[error("Feed format error: {0}")]
    Format(String),
}
