use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use sqlx::SqlitePool;
use utoipa::ToSchema;

use crate::api::{ErrorResponse, internal_error};
use crate::store::{self, StoreStats};

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

/// Liveness probe
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    ),
    tag = "stats"
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Totals across both stores and the time of the last successful poll
#[utoipa::path(
    get,
    path = "/stats",
    responses(
        (status = 200, description = "Store totals", body = StoreStats),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "stats"
)]
pub async fn get_stats(
    State(pool): State<SqlitePool>,
) -> Result<Json<StoreStats>, (StatusCode, Json<ErrorResponse>)> {
    store::stats(&pool).await.map(Json).map_err(internal_error)
}
