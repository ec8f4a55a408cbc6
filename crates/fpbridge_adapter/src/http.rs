#![forbid(unsafe_code)]

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::{
    BridgeRuntime, CaptureRequest, CaptureResponse, InitializeResponse, LogsSinceQuery,
    LogsSinceResponse, MessageResponse, RecentLogsResponse, ScannerStatusResponse,
    TestConnectionResponse, TestEnrollmentRequest,
};

pub type SharedRuntime = Arc<BridgeRuntime>;

/// Serves every route at the root and again under `/api`, where the web client looks for them.
pub fn build_router(runtime: SharedRuntime) -> Router {
    Router::new()
        .merge(api_routes())
        .nest("/api", api_routes())
        .layer(CorsLayer::permissive())
        .with_state(runtime)
}

fn api_routes() -> Router<SharedRuntime> {
    Router::new()
        .route("/test", get(test_connection))
        .route("/logs", get(recent_logs))
        .route("/logs/since", get(logs_since))
        .route("/logs/clear", post(clear_logs))
        .route("/scanner/status", get(scanner_status))
        .route("/scanner/initialize", post(initialize_scanner))
        .route("/scanner/disconnect", post(disconnect_scanner))
        .route("/fingerprint/capture", post(capture_fingerprint))
        .route("/fingerprint/test", post(test_enrollment))
        .route("/fingerprint/abort", post(abort_enrollment))
}

async fn run_blocking<T, F>(runtime: SharedRuntime, op: F) -> Result<T, String>
where
    F: FnOnce(&BridgeRuntime) -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || op(&runtime))
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "blocking bridge task failed");
            format!("internal error: {err}")
        })
}

pub async fn test_connection(State(runtime): State<SharedRuntime>) -> Json<TestConnectionResponse> {
    Json(runtime.test_connection())
}

pub async fn recent_logs(State(runtime): State<SharedRuntime>) -> Json<RecentLogsResponse> {
    Json(runtime.recent_logs())
}

pub async fn logs_since(
    State(runtime): State<SharedRuntime>,
    Query(query): Query<LogsSinceQuery>,
) -> Json<LogsSinceResponse> {
    Json(runtime.logs_since(query))
}

pub async fn clear_logs(State(runtime): State<SharedRuntime>) -> Json<MessageResponse> {
    Json(runtime.clear_logs())
}

pub async fn scanner_status(State(runtime): State<SharedRuntime>) -> Json<ScannerStatusResponse> {
    Json(runtime.scanner_status())
}

pub async fn initialize_scanner(
    State(runtime): State<SharedRuntime>,
) -> Json<InitializeResponse> {
    match run_blocking(runtime, BridgeRuntime::initialize_scanner).await {
        Ok(response) => Json(response),
        Err(message) => Json(InitializeResponse {
            success: false,
            message,
            device_info: None,
        }),
    }
}

pub async fn disconnect_scanner(State(runtime): State<SharedRuntime>) -> Json<MessageResponse> {
    match run_blocking(runtime, BridgeRuntime::disconnect_scanner).await {
        Ok(response) => Json(response),
        Err(message) => Json(MessageResponse {
            success: false,
            message,
        }),
    }
}

pub async fn capture_fingerprint(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<CaptureRequest>,
) -> Json<CaptureResponse> {
    match run_blocking(runtime, move |rt| rt.capture_fingerprint(request)).await {
        Ok(response) => Json(response),
        Err(message) => Json(CaptureResponse::unsuccessful("failed", message)),
    }
}

pub async fn test_enrollment(
    State(runtime): State<SharedRuntime>,
    body: Option<Json<TestEnrollmentRequest>>,
) -> Json<CaptureResponse> {
    let request = body.map(|Json(req)| req).unwrap_or_default();
    match run_blocking(runtime, move |rt| rt.test_enrollment(request)).await {
        Ok(response) => Json(response),
        Err(message) => Json(CaptureResponse::unsuccessful("failed", message)),
    }
}

pub async fn abort_enrollment(State(runtime): State<SharedRuntime>) -> Json<MessageResponse> {
    Json(runtime.abort_enrollment())
}

