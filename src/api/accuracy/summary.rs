use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use utoipa::{IntoParams, ToSchema};

use crate::api::{ErrorResponse, internal_error};
use crate::store::{self, AccuracySummary};

use super::{DEFAULT_HOURS, DEFAULT_STOP_CODE, MAX_HOURS, invalid_hours};

#[derive(Debug, Serialize, ToSchema)]
pub struct AccuracySummaryResponse {
    pub stop_code: String,
    pub period_hours: i64,
    /// Present only when no measurements fall in the period
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub data: Vec<AccuracySummary>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct AccuracySummaryQuery {
    /// Stop to summarise (default "cab")
    pub stop_code: Option<String>,
    /// Look-back period in hours, by calculation time (default 24)
    pub hours: Option<i64>,
}

/// Forecast accuracy per destination and direction over the last N hours
#[utoipa::path(
    get,
    path = "/accuracy/summary",
    params(AccuracySummaryQuery),
    responses(
        (status = 200, description = "Accuracy aggregates", body = AccuracySummaryResponse),
        (status = 400, description = "Invalid period", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "accuracy"
)]
pub async fn get_accuracy_summary(
    State(pool): State<SqlitePool>,
    Query(query): Query<AccuracySummaryQuery>,
) -> Result<Json<AccuracySummaryResponse>, (StatusCode, Json<ErrorResponse>)> {
    let stop_code = query
        .stop_code
        .unwrap_or_else(|| DEFAULT_STOP_CODE.to_string());
    let hours = query.hours.unwrap_or(DEFAULT_HOURS);

    if !(1..=MAX_HOURS).contains(&hours) {
        return Err(invalid_hours());
    }

    let since = Utc::now() - Duration::hours(hours);
    let data = store::accuracy_summary(&pool, &stop_code, since)
        .await
        .map_err(internal_error)?;

    let message = data
        .is_empty()
        .then(|| "No accuracy data available yet".to_string());

    Ok(Json(AccuracySummaryResponse {
        stop_code,
        period_hours: hours,
        message,
        data,
    }))
}
