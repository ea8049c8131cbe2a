use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use utoipa::{IntoParams, ToSchema};

use crate::api::{ErrorResponse, internal_error};
use crate::models::Direction;
use crate::store;

const DEFAULT_MINUTES: i64 = 60;
const MAX_MINUTES: i64 = 24 * 60;

#[derive(Debug, Serialize, ToSchema)]
pub struct SampledForecast {
    pub destination: String,
    pub direction: Direction,
    pub due_minutes: u32,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ForecastHistoryResponse {
    pub stop_code: String,
    pub period_minutes: i64,
    pub snapshots: Vec<SampledForecast>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ForecastHistoryQuery {
    /// Look-back period in minutes (default 60, at most 1440)
    pub minutes: Option<i64>,
}

/// Every forecast sampled at a stop over the last N minutes, in capture order
#[utoipa::path(
    get,
    path = "/arrivals/{stop_code}/history",
    params(
        ("stop_code" = String, Path, description = "Stop code, e.g. cab"),
        ForecastHistoryQuery
    ),
    responses(
        (status = 200, description = "Sampled forecasts", body = ForecastHistoryResponse),
        (status = 400, description = "Invalid period", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "arrivals"
)]
pub async fn get_forecast_history(
    State(pool): State<SqlitePool>,
    Path(stop_code): Path<String>,
    Query(query): Query<ForecastHistoryQuery>,
) -> Result<Json<ForecastHistoryResponse>, (StatusCode, Json<ErrorResponse>)> {
    let minutes = query.minutes.unwrap_or(DEFAULT_MINUTES);
    if !(1..=MAX_MINUTES).contains(&minutes) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("minutes must be between 1 and {}", MAX_MINUTES),
            }),
        ));
    }

    let to = Utc::now();
    let snapshots = store::snapshots_for_stop(&pool, &stop_code, to - Duration::minutes(minutes), to)
        .await
        .map_err(internal_error)?
        .into_iter()
        .map(|s| SampledForecast {
            destination: s.destination,
            direction: s.direction,
            due_minutes: s.forecast_minutes,
            recorded_at: s.recorded_at,
        })
        .collect();

    Ok(Json(ForecastHistoryResponse {
        stop_code,
        period_minutes: minutes,
        snapshots,
    }))
}
