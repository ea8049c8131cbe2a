mod records;
mod summary;

pub use records::*;
pub use summary::*;

use axum::{Json, Router, http::StatusCode, routing::get};
use sqlx::SqlitePool;

use crate::api::ErrorResponse;

const DEFAULT_STOP_CODE: &str = "cab";
const DEFAULT_HOURS: i64 = 24;
const MAX_HOURS: i64 = 24 * 365;

fn invalid_hours() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: format!("hours must be between 1 and {}", MAX_HOURS),
        }),
    )
}

pub fn router(pool: SqlitePool) -> Router {
    Router::new()
        .route("/summary", get(get_accuracy_summary))
        .route("/records", get(list_accuracy_records))
        .with_state(pool)
}
