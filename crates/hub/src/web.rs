use anyhow::Context;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::controller::ControllerHandle;
use crate::db::Db;
use crate::state::SharedState;

const DEFAULT_SESSION_LIMIT: i64 = 20;
const MAX_SESSION_LIMIT: i64 = 500;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub controller: ControllerHandle,
    pub db: Option<Db>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/zones/{zone_id}/sessions", get(api_sessions))
        .route("/api/system/enable", post(api_enable))
        .route("/api/system/disable", post(api_disable))
        .route("/api/water", post(api_water))
        .route("/api/stop", post(api_stop))
        .route("/api/emergency-stop", post(api_emergency_stop))
        .route("/api/statistics/reset", post(api_reset_statistics))
        .route("/api/forecast/refresh", post(api_refresh_forecast))
        .route("/api/deficit/update", post(api_update_deficit))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

#[derive(Deserialize)]
struct SessionQuery {
    limit: Option<i64>,
}

async fn api_sessions(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
    Query(q): Query<SessionQuery>,
) -> Response {
    let Some(db) = &state.db else {
        return (StatusCode::SERVICE_UNAVAILABLE, "session journal disabled").into_response();
    };
    let limit = q
        .limit
        .unwrap_or(DEFAULT_SESSION_LIMIT)
        .clamp(1, MAX_SESSION_LIMIT);
    match db.recent_sessions(&zone_id, limit).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            warn!(zone = %zone_id, "session query failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "session query failed").into_response()
        }
    }
}

#[derive(Deserialize)]
struct WaterRequest {
    #[serde(default)]
    zones: Option<Vec<String>>,
}

/// Body is optional; without one every zone is started.
async fn api_water(State(state): State<AppState>, body: Bytes) -> Response {
    let zones = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        match serde_json::from_slice::<WaterRequest>(&body) {
            Ok(req) => req.zones,
            Err(e) => return (StatusCode::BAD_REQUEST, format!("bad request body: {e}")).into_response(),
        }
    };
    accepted(state.controller.manual_start(zones).await)
}

async fn api_enable(State(state): State<AppState>) -> Response {
    accepted(state.controller.enable().await)
}

async fn api_disable(State(state): State<AppState>) -> Response {
    accepted(state.controller.disable().await)
}

async fn api_stop(State(state): State<AppState>) -> Response {
    accepted(state.controller.stop_all().await)
}

async fn api_emergency_stop(State(state): State<AppState>) -> Response {
    accepted(state.controller.emergency_shutdown().await)
}

async fn api_reset_statistics(State(state): State<AppState>) -> Response {
    accepted(state.controller.reset_statistics().await)
}

async fn api_refresh_forecast(State(state): State<AppState>) -> Response {
    accepted(state.controller.refresh_forecast().await)
}

async fn api_update_deficit(State(state): State<AppState>) -> Response {
    accepted(state.controller.update_deficit().await)
}

fn accepted(result: anyhow::Result<()>) -> Response {
    match result {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            warn!("service call rejected: {e:#}");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "web api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
