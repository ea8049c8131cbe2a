pub mod accuracy;
pub mod arrivals;
pub mod error;
pub mod stats;

pub use error::{ErrorResponse, internal_error, not_found};

use axum::{Json, Router, routing::get};
use sqlx::SqlitePool;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Luas Tracker API",
        description = "Tram arrival forecasts and forecast accuracy for Luas stops"
    ),
    paths(
        arrivals::get_arrivals,
        arrivals::get_forecast_history,
        accuracy::get_accuracy_summary,
        accuracy::list_accuracy_records,
        stats::health,
        stats::get_stats,
    ),
    components(schemas(
        ErrorResponse,
        arrivals::Arrival,
        arrivals::ArrivalsResponse,
        arrivals::SampledForecast,
        arrivals::ForecastHistoryResponse,
        accuracy::AccuracySummaryResponse,
        accuracy::AccuracyMeasurement,
        accuracy::AccuracyRecordsResponse,
        crate::store::AccuracySummary,
        crate::store::StoreStats,
        crate::models::Direction,
        stats::HealthResponse,
    )),
    tags(
        (name = "arrivals", description = "Latest sampled forecasts"),
        (name = "accuracy", description = "Forecast accuracy measurements"),
        (name = "stats", description = "Service status")
    )
)]
pub struct ApiDoc;

pub fn router(pool: SqlitePool) -> Router {
    Router::new()
        .merge(stats::router(pool.clone()))
        .nest("/arrivals", arrivals::router(pool.clone()))
        .nest("/accuracy", accuracy::router(pool))
        .route("/api-docs/openapi.json", get(openapi_json))
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
