use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use utoipa::{IntoParams, ToSchema};

use crate::api::{ErrorResponse, internal_error};
use crate::models::{AccuracyRecord, Direction};
use crate::store;

use super::{DEFAULT_HOURS, DEFAULT_STOP_CODE, MAX_HOURS, invalid_hours};

/// One accepted forecast-versus-actual measurement
#[derive(Debug, Serialize, ToSchema)]
pub struct AccuracyMeasurement {
    pub destination: String,
    pub direction: Direction,
    pub forecasted_minutes: i64,
    pub actual_minutes: i64,
    /// Positive when the tram arrived later than forecast
    pub accuracy_delta: i64,
    pub observed_from: DateTime<Utc>,
    pub observed_to: DateTime<Utc>,
    pub calculated_at: DateTime<Utc>,
}

impl From<AccuracyRecord> for AccuracyMeasurement {
    fn from(record: AccuracyRecord) -> Self {
        Self {
            destination: record.key.destination,
            direction: record.key.direction,
            forecasted_minutes: record.forecasted_minutes,
            actual_minutes: record.actual_minutes,
            accuracy_delta: record.accuracy_delta,
            observed_from: record.observed_from,
            observed_to: record.observed_to,
            calculated_at: record.calculated_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AccuracyRecordsResponse {
    pub stop_code: String,
    pub period_hours: i64,
    pub records: Vec<AccuracyMeasurement>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct AccuracyRecordsQuery {
    /// Stop to list (default "cab")
    pub stop_code: Option<String>,
    /// Look-back period in hours, by calculation time (default 24)
    pub hours: Option<i64>,
}

/// Individual accuracy measurements for a stop, oldest first
#[utoipa::path(
    get,
    path = "/accuracy/records",
    params(AccuracyRecordsQuery),
    responses(
        (status = 200, description = "Accuracy measurements", body = AccuracyRecordsResponse),
        (status = 400, description = "Invalid period", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "accuracy"
)]
pub async fn list_accuracy_records(
    State(pool): State<SqlitePool>,
    Query(query): Query<AccuracyRecordsQuery>,
) -> Result<Json<AccuracyRecordsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let stop_code = query
        .stop_code
        .unwrap_or_else(|| DEFAULT_STOP_CODE.to_string());
    let hours = query.hours.unwrap_or(DEFAULT_HOURS);
    if !(1..=MAX_HOURS).contains(&hours) {
        return Err(invalid_hours());
    }

    let to = Utc::now();
    let records = store::accuracy_for_stop(&pool, &stop_code, to - Duration::hours(hours), to)
        .await
        .map_err(internal_error)?
        .into_iter()
        .map(AccuracyMeasurement::from)
        .collect();

    Ok(Json(AccuracyRecordsResponse {
        stop_code,
        period_hours: hours,
        records,
    }))
}
