use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use utoipa::{IntoParams, ToSchema};

use crate::api::{ErrorResponse, internal_error, not_found};
use crate::models::Direction;
use crate::store;

const DEFAULT_LIMIT: u32 = 3;
const MAX_LIMIT: u32 = 50;

#[derive(Debug, Serialize, ToSchema)]
pub struct Arrival {
    pub destination: String,
    pub direction: Direction,
    pub due_minutes: u32,
    /// Capture time plus the forecast minutes
    pub due_time: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ArrivalsResponse {
    pub stop_code: String,
    /// Capture time of the batch the arrivals come from
    pub last_updated: DateTime<Utc>,
    pub next_arrivals: Vec<Arrival>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ArrivalsQuery {
    /// Number of trams to return (default 3, at most 50)
    pub limit: Option<u32>,
}

/// Next trams at a stop, taken from the most recent sampling cycle
#[utoipa::path(
    get,
    path = "/arrivals/{stop_code}",
    params(
        ("stop_code" = String, Path, description = "Stop code, e.g. cab"),
        ArrivalsQuery
    ),
    responses(
        (status = 200, description = "Soonest trams from the latest capture", body = ArrivalsResponse),
        (status = 404, description = "Nothing has been sampled for this stop yet", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "arrivals"
)]
pub async fn get_arrivals(
    State(pool): State<SqlitePool>,
    Path(stop_code): Path<String>,
    Query(query): Query<ArrivalsQuery>,
) -> Result<Json<ArrivalsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);

    let batch = store::latest_batch(&pool, &stop_code, limit)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("No forecast data available yet. Polling will start soon."))?;

    let next_arrivals = batch
        .snapshots
        .iter()
        .map(|s| Arrival {
            destination: s.destination.clone(),
            direction: s.direction,
            due_minutes: s.forecast_minutes,
            due_time: s.forecast_arrival_time(),
        })
        .collect();

    Ok(Json(ArrivalsResponse {
        stop_code,
        last_updated: batch.recorded_at,
        next_arrivals,
    }))
}
