mod overview;

pub use overview::*;

use axum::{Router, routing::get};
use sqlx::SqlitePool;

pub fn router(pool: SqlitePool) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(get_stats))
        .with_state(pool)
}
