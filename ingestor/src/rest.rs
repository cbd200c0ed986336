use crate::db::ReadingStore;
use crate::errors::Error;
use crate::metrics;
use crate::model::{
    AggregateResponse, OverviewResponse, RawReading, ReadingsResponse, SensorsResponse,
    SubmitOutcome,
};
use crate::service::TelemetryService;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, warn};

const DEFAULT_RECENT_LIMIT: u32 = 100;
const MAX_RECENT_LIMIT: u32 = 1000;

struct AppState<S> {
    service: Arc<TelemetryService<S>>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    sensor_id: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct AggregateQuery {
    sensor_id: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    window_secs: i64,
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<u32>,
}

/// Empty `origins` allows any origin, which is what ESP32 dashboards served
/// from arbitrary hosts expect.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", o);
                None
            }
        })
        .collect();
    layer.allow_origin(allowed)
}

pub fn create_router<S: ReadingStore>(
    service: Arc<TelemetryService<S>>,
    cors_origins: &[String],
) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/", get(service_info))
        .route("/api/v1/readings", post(submit_reading::<S>).get(get_readings::<S>))
        .route("/api/updates", post(submit_reading::<S>))
        .route("/api/v1/aggregate", get(get_aggregate::<S>))
        .route("/api/v1/sensors", get(list_sensors::<S>))
        .route("/api/v1/overview", get(overview::<S>))
        .route(
            "/api/v1/sensors/:sensor_id/readings",
            get(get_recent::<S>),
        )
        .route("/health", get(health::<S>))
        .route("/metrics", get(metrics_handler))
        .layer(build_cors_layer(cors_origins))
        .with_state(state)
}

async fn service_info() -> Json<serde_json::Value> {
    Json(json!({
        "service": "climate-ingestor",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "online",
        "timestamp": Utc::now().to_rfc3339(),
        "endpoints": {
            "submit": "POST /api/v1/readings",
            "legacy_submit": "POST /api/updates",
            "readings": "GET /api/v1/readings?sensor_id&start&end",
            "recent": "GET /api/v1/sensors/{sensor_id}/readings?limit",
            "aggregate": "GET /api/v1/aggregate?sensor_id&start&end&window_secs",
            "sensors": "GET /api/v1/sensors",
            "overview": "GET /api/v1/overview",
            "health": "GET /health",
            "metrics": "GET /metrics",
        }
    }))
}

async fn submit_reading<S: ReadingStore>(
    State(state): State<AppState<S>>,
    payload: Result<Json<RawReading>, JsonRejection>,
) -> Result<Response, AppError> {
    let outcome = match payload {
        Ok(Json(raw)) => state.service.submit(&raw).await?,
        Err(rejection) => state.service.reject_undecodable(rejection.body_text()),
    };

    let status = match outcome {
        SubmitOutcome::Accepted | SubmitOutcome::Duplicate => StatusCode::OK,
        SubmitOutcome::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
    };
    Ok((status, Json(outcome)).into_response())
}

async fn get_readings<S: ReadingStore>(
    State(state): State<AppState<S>>,
    Query(params): Query<RangeQuery>,
) -> Result<Json<ReadingsResponse>, AppError> {
    let data = state
        .service
        .query(&params.sensor_id, params.start, params.end)
        .await?;

    Ok(Json(ReadingsResponse {
        sensor_id: params.sensor_id,
        total: data.len(),
        data,
    }))
}

async fn get_recent<S: ReadingStore>(
    State(state): State<AppState<S>>,
    Path(sensor_id): Path<String>,
    Query(params): Query<RecentQuery>,
) -> Result<Json<ReadingsResponse>, AppError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .min(MAX_RECENT_LIMIT);
    let data = state.service.recent(&sensor_id, limit).await?;

    Ok(Json(ReadingsResponse {
        sensor_id,
        total: data.len(),
        data,
    }))
}

async fn get_aggregate<S: ReadingStore>(
    State(state): State<AppState<S>>,
    Query(params): Query<AggregateQuery>,
) -> Result<Json<AggregateResponse>, AppError> {
    let window = Duration::try_seconds(params.window_secs).ok_or_else(|| {
        Error::InvalidRange(format!("window_secs {} is too large", params.window_secs))
    })?;
    let (cancel, _guard) = request_cancellation();

    let windows = state
        .service
        .aggregate(&params.sensor_id, params.start, params.end, window, &cancel)
        .await?;

    Ok(Json(AggregateResponse {
        sensor_id: params.sensor_id,
        window_secs: params.window_secs,
        windows,
    }))
}

async fn list_sensors<S: ReadingStore>(
    State(state): State<AppState<S>>,
) -> Result<Json<SensorsResponse>, AppError> {
    let sensors = state.service.list_sensors().await?;
    Ok(Json(SensorsResponse {
        total: sensors.len(),
        sensors,
    }))
}

async fn overview<S: ReadingStore>(
    State(state): State<AppState<S>>,
) -> Result<Json<OverviewResponse>, AppError> {
    let sensors = state.service.overview().await?;
    Ok(Json(OverviewResponse {
        total: sensors.len(),
        sensors,
    }))
}

/// A token that is cancelled when the guard drops, which happens when axum
/// drops the handler future after the client disconnects.
fn request_cancellation() -> (CancellationToken, DropGuard) {
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    (token, guard)
}

async fn health<S: ReadingStore>(State(state): State<AppState<S>>) -> Response {
    match state.service.health().await {
        Ok(report) => Json(json!({
            "status": "healthy",
            "sensors": report.sensors,
            "readings": report.readings,
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "unhealthy",
                "error": e.to_string(),
                "timestamp": Utc::now().to_rfc3339(),
            })),
        )
            .into_response(),
    }
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

struct AppError(Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidRange(_) => StatusCode::BAD_REQUEST,
            Error::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            // nginx-style "client closed request"
            Error::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("API error: {}", self.0);
            return (
                status,
                Json(json!({ "error": status.canonical_reason().unwrap_or("error") })),
            )
                .into_response();
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}
