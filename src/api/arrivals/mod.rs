mod history;
mod latest;

pub use history::*;
pub use latest::*;

use axum::{Router, routing::get};
use sqlx::SqlitePool;

pub fn router(pool: SqlitePool) -> Router {
    Router::new()
        .route("/{stop_code}", get(get_arrivals))
        .route("/{stop_code}/history", get(get_forecast_history))
        .with_state(pool)
}
