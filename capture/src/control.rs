//! HTTP control API for the supervisor.
//!
//! Routes:
//!   GET  /api/health               → health check
//!   GET  /api/status               → phase, active mode, intents, last score
//!   POST /api/run/{mode}           → start `continuous`, `auto-notify` or `single`
//!   POST /api/stop                 → stop the active run
//!   POST /api/check/{what}         → `water`, `look` or `single`
//!   PUT  /api/intent/{name}        → set or clear the `water` / `look` intent

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use plantcam_common::protocol::{
    ControlReply, HealthResponse, IntentRequest, RunMode, StatusResponse,
};

use crate::error::ControlError;
use crate::supervisor::Supervisor;

#[derive(Clone)]
struct AppState {
    supervisor: Arc<Supervisor>,
    start_time: Instant,
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match self {
            ControlError::Spawn(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::CONFLICT,
        };
        (status, Json(ControlReply::rejected(self.to_string()))).into_response()
    }
}

type Reply = Result<Json<ControlReply>, Response>;

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(ControlReply::rejected(message))).into_response()
}

pub fn router(supervisor: Arc<Supervisor>) -> Router {
    let state = AppState {
        supervisor,
        start_time: Instant::now(),
    };

    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/run/{mode}", post(start_run))
        .route("/api/stop", post(stop))
        .route("/api/check/{what}", post(check))
        .route("/api/intent/{name}", put(set_intent))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the control API on `listen_addr` until `shutdown` fires.
pub async fn run(
    supervisor: Arc<Supervisor>,
    listen_addr: &str,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Control API listening on http://{listen_addr}");

    axum::serve(listener, router(supervisor))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Control API stopped");
    Ok(())
}

// ── route handlers ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(state.supervisor.status())
}

async fn start_run(State(state): State<AppState>, Path(mode): Path<String>) -> Reply {
    let mode: RunMode = mode.parse().map_err(|e| bad_request(format!("{e}")))?;
    let sv = &state.supervisor;
    let started = match mode {
        RunMode::Continuous => sv.start_continuous(),
        RunMode::AutoNotify => sv.start_continuous_with_auto_notify(),
        RunMode::Single => sv.request_single_check(),
    };
    started.map_err(IntoResponse::into_response)?;
    Ok(Json(ControlReply::ok(format!("{mode} run started"))))
}

async fn stop(State(state): State<AppState>) -> Reply {
    state
        .supervisor
        .stop()
        .map_err(IntoResponse::into_response)?;
    Ok(Json(ControlReply::ok("stopping")))
}

async fn check(State(state): State<AppState>, Path(what): Path<String>) -> Reply {
    let sv = &state.supervisor;
    let requested = match what.as_str() {
        "water" => sv.check_water(),
        "look" => sv.check_look(),
        "single" => sv.request_single_check(),
        other => return Err(bad_request(format!("unknown check: {other}"))),
    };
    requested.map_err(IntoResponse::into_response)?;
    Ok(Json(ControlReply::ok(format!("{what} check requested"))))
}

async fn set_intent(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<IntentRequest>,
) -> Reply {
    match name.as_str() {
        "water" => state.supervisor.set_water_intent(req.enabled),
        "look" => state.supervisor.set_look_intent(req.enabled),
        other => return Err(bad_request(format!("unknown intent: {other}"))),
    }
    Ok(Json(ControlReply::ok(format!("{name} intent = {}", req.enabled))))
}
