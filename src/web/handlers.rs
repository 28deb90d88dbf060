//! HTTP request handlers.

use super::AppState;
use crate::catalog::{catalog, ParamsRequest, TestType};
use crate::report::{ReportError, ReportFormat};
use crate::roster::parse_topology;
use crate::run::{ProbeResult, RunError, RunSnapshot};

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Json, Response,
    },
};
use chrono::Utc;
use rust_embed::RustEmbed;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::{Stream, StreamExt};

#[derive(RustEmbed)]
#[folder = "assets/"]
struct Assets;

// ============================================================================
// Errors
// ============================================================================

/// HTTP status for a run control error.
pub fn error_status(err: &RunError) -> StatusCode {
    match err {
        RunError::AlreadyRunning(_)
        | RunError::NotRunning(_)
        | RunError::RetestConflict(_)
        | RunError::InvalidTransition { .. } => StatusCode::CONFLICT,
        RunError::InvalidParameters(_) | RunError::EmptyResults => StatusCode::BAD_REQUEST,
        RunError::UnknownDevice(_) | RunError::Report(ReportError::NotFound { .. }) => {
            StatusCode::NOT_FOUND
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: RunError) -> Response {
    (error_status(&err), err.to_string()).into_response()
}

fn parse_test_type(raw: &str) -> Result<TestType, Response> {
    raw.parse::<TestType>()
        .map_err(|e| (StatusCode::BAD_REQUEST, e).into_response())
}

fn control_response(message: String, snapshot: RunSnapshot) -> Response {
    Json(json!({
        "success": true,
        "message": message,
        "status": snapshot,
    }))
    .into_response()
}

// ============================================================================
// Dashboard
// ============================================================================

pub async fn handle_dashboard() -> impl IntoResponse {
    match Assets::get("index.html") {
        Some(file) => Html(file.data.into_owned()).into_response(),
        None => (StatusCode::NOT_FOUND, "Dashboard not bundled").into_response(),
    }
}

pub async fn handle_static(Path(path): Path<String>) -> impl IntoResponse {
    match Assets::get(&path) {
        Some(file) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            (
                [(header::CONTENT_TYPE, mime.as_ref().to_string())],
                file.data.into_owned(),
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}

// ============================================================================
// API: Catalog and status
// ============================================================================

pub async fn handle_get_tests() -> impl IntoResponse {
    Json(catalog())
}

pub async fn handle_all_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.statuses().await)
}

pub async fn handle_test_status(
    State(state): State<AppState>,
    Path(test_type): Path<String>,
) -> impl IntoResponse {
    let test_type = match parse_test_type(&test_type) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    Json(state.controller.status(test_type).await).into_response()
}

// ============================================================================
// API: Run control
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub test_type: TestType,
    #[serde(default)]
    pub parameters: ParamsRequest,
}

#[derive(Debug, Deserialize)]
pub struct TestRequest {
    pub test_type: TestType,
}

pub async fn handle_start_test(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> impl IntoResponse {
    match state.controller.start(req.test_type, &req.parameters).await {
        Ok(snapshot) => control_response(
            format!("{} started", req.test_type.display_name()),
            snapshot,
        ),
        Err(e) => error_response(e),
    }
}

pub async fn handle_stop_test(
    State(state): State<AppState>,
    Json(req): Json<TestRequest>,
) -> impl IntoResponse {
    match state.controller.stop(req.test_type).await {
        Ok(snapshot) => control_response(
            format!("Stop requested for {}", req.test_type.display_name()),
            snapshot,
        ),
        Err(e) => error_response(e),
    }
}

pub async fn handle_pause_test(
    State(state): State<AppState>,
    Json(req): Json<TestRequest>,
) -> impl IntoResponse {
    match state.controller.pause(req.test_type).await {
        Ok(snapshot) => control_response(
            format!("Pause requested for {}", req.test_type.display_name()),
            snapshot,
        ),
        Err(e) => error_response(e),
    }
}

pub async fn handle_resume_test(
    State(state): State<AppState>,
    Json(req): Json<TestRequest>,
) -> impl IntoResponse {
    match state.controller.resume(req.test_type).await {
        Ok(snapshot) => control_response(
            format!("Resume requested for {}", req.test_type.display_name()),
            snapshot,
        ),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct RetestRequest {
    pub test_type: TestType,
    #[serde(alias = "ip")]
    pub address: String,
    #[serde(default)]
    pub parameters: Option<ParamsRequest>,
}

/// Validates the retest now; the probe itself runs in the background and reports
/// back through the event stream.
pub async fn handle_retest_device(
    State(state): State<AppState>,
    Json(req): Json<RetestRequest>,
) -> impl IntoResponse {
    let plan = match state
        .controller
        .prepare_retest(req.test_type, &req.address, req.parameters.as_ref())
        .await
    {
        Ok(plan) => plan,
        Err(e) => return error_response(e),
    };

    let label = plan.device().label.clone();
    let controller = state.controller.clone();
    tokio::spawn(async move {
        // Failures are published as device_retest_error.
        let _ = controller.execute_retest(plan).await;
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "message": format!("Retest started for {}", label),
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct RegenerateRequest {
    pub test_type: TestType,
    pub results: Vec<ProbeResult>,
    #[serde(default)]
    pub summary_text: Option<String>,
    #[serde(default)]
    pub formats: Vec<ReportFormat>,
}

pub async fn handle_regenerate_report(
    State(state): State<AppState>,
    Json(req): Json<RegenerateRequest>,
) -> impl IntoResponse {
    match state.controller.regenerate_report(
        req.test_type,
        req.results,
        req.summary_text,
        &req.formats,
    ) {
        Ok(reports) => Json(json!({
            "success": true,
            "message": "Report regenerated",
            "reports": reports,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// API: Live events
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub test_type: Option<TestType>,
}

/// Server-Sent Events stream of run events, optionally for one test type.
pub async fn handle_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let only = query.test_type;
    let stream = BroadcastStream::new(state.bus.subscribe()).filter_map(move |msg| match msg {
        Ok(event) => {
            if only.is_some_and(|t| t != event.test_type()) {
                return None;
            }
            match Event::default().event(event.name()).json_data(&event) {
                Ok(sse) => Some(Ok(sse)),
                Err(e) => {
                    tracing::error!("Failed to encode {} event: {}", event.name(), e);
                    None
                }
            }
        }
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!("Event stream observer lagged, skipped {} events", skipped);
            Some(Ok(Event::default().event("lagged").data(skipped.to_string())))
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ============================================================================
// API: Reports and logs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ReportQuery {
    #[serde(default)]
    pub format: Option<String>,
}

pub async fn handle_latest_report(
    State(state): State<AppState>,
    Path(test_type): Path<String>,
    Query(query): Query<ReportQuery>,
) -> impl IntoResponse {
    let test_type = match parse_test_type(&test_type) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let format = match query.format.as_deref().unwrap_or("txt").parse::<ReportFormat>() {
        Ok(f) => f,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };

    let path = match state.controller.latest_report(test_type, format) {
        Ok(p) => p,
        Err(e) => return error_response(e),
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            (
                [
                    (header::CONTENT_TYPE, format.content_type().to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{}\"", name),
                    ),
                ],
                bytes,
            )
                .into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_logs(
    State(state): State<AppState>,
    Path(test_type): Path<String>,
) -> impl IntoResponse {
    let test_type = match parse_test_type(&test_type) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    match state.logs.read(test_type).await {
        Ok(content) => Json(json!({ "logs": content })).into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Json(json!({ "logs": "No logs available" })).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

// ============================================================================
// API: Mesh topology
// ============================================================================

pub async fn handle_wisun_tree(State(state): State<AppState>) -> impl IntoResponse {
    match state.topology.status_output().await {
        Ok(output) => {
            let topology = match parse_topology(&output) {
                Ok(t) => Some(t),
                Err(e) => {
                    tracing::debug!("Tree output not parseable: {}", e);
                    None
                }
            };
            Json(json!({
                "success": true,
                "output": output,
                "timestamp": Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                "topology": topology.map(|t| {
                    let device_count = t.device_count();
                    json!({
                        "root": t.root,
                        "device_count": device_count,
                        "properties": t.properties,
                        "edges": t.edges,
                        "hop_counts": t.hop_counts,
                    })
                }),
            }))
            .into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}

// ============================================================================
// Static Assets
// ============================================================================

pub async fn handle_favicon() -> impl IntoResponse {
    // Mesh of three nodes around a border router
    let svg = r##"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 100 100">
        <circle cx="50" cy="50" r="45" fill="#2f7d5b"/>
        <path d="M50 30 L28 68 M50 30 L72 68 M28 68 L72 68" stroke="white" stroke-width="4" fill="none"/>
        <circle cx="50" cy="30" r="7" fill="white"/>
        <circle cx="28" cy="68" r="6" fill="white"/>
        <circle cx="72" cy="68" r="6" fill="white"/>
    </svg>"##;

    ([(header::CONTENT_TYPE, "image/svg+xml")], svg)
}
