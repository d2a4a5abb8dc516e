use std::future::ready;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{MatchedPath, Query, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::{ApiError, CreateMetadataRequest, MetadataResponse, PendingResponse};
use crate::health::HealthRegistry;
use crate::service::MetadataService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MetadataService>,
}

#[derive(Debug, Deserialize)]
struct GetMetadataQuery {
    url: Option<String>,
}

pub fn router(service: Arc<MetadataService>, liveness: HealthRegistry, metrics: bool) -> Router {
    let state = AppState { service };

    let router = Router::new()
        .route("/api/v1/metadata", post(create_metadata).get(get_metadata))
        .route("/health", get(health))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(track_requests))
        .with_state(state);

    // Don't install the recorder unless asked to; a global recorder does not
    // work well when the router is built under test.
    if metrics {
        let recorder_handle = setup_metrics_recorder();
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}

/// POST /api/v1/metadata: synchronously collect and store, returning the
/// complete record.
async fn create_metadata(
    State(state): State<AppState>,
    Json(request): Json<CreateMetadataRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.service.create_metadata(&request.url).await?;
    Ok((StatusCode::CREATED, Json(MetadataResponse::from(record))))
}

/// GET /api/v1/metadata?url=...: cached record on hit, 202 with a pending
/// body on miss (background collection scheduled).
async fn get_metadata(
    State(state): State<AppState>,
    Query(query): Query<GetMetadataQuery>,
) -> Result<Response, ApiError> {
    let url = query.url.as_deref().map(str::trim).unwrap_or_default();
    if url.is_empty() {
        return Err(ApiError::MissingUrl);
    }

    match state.service.get_metadata(url).await? {
        Some(record) => Ok(Json(MetadataResponse::from(record)).into_response()),
        None => Ok((StatusCode::ACCEPTED, Json(PendingResponse::new(url))).into_response()),
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy", "service": "metadata-service" }))
}

fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .unwrap()
        .install_recorder()
        .unwrap()
}

/// Middleware recording request count and latency per route.
async fn track_requests(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };
    let method = req.method().clone();

    let response = next.run(req).await;

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("metadata_http_requests_total", &labels).increment(1);
    metrics::histogram!("metadata_http_request_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}
