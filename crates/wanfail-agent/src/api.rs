//! Local control API.
//!
//! JSON over HTTP on a loopback address:
//!
//! - `GET  /api/status`              full snapshot of the last tick
//! - `GET  /api/members`             per-link status only
//! - `GET  /api/history/{link}`      stored samples, `?since_s=` window (default 600)
//! - `GET  /api/events`              audit log, newest first, `?limit=` (default 50)
//! - `POST /api/action`              operator action, see [`Action`]
//! - `GET  /metrics`                 Prometheus text

use std::net::SocketAddr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use wanfail_common::{Action, ActionReply, Event, LinkStatus, Sample, StatusSnapshot};
use wanfail_core::{SupervisorError, SupervisorHandle};

use crate::logging::{self, LogHandle};

const DEFAULT_HISTORY_S: u64 = 600;
const DEFAULT_EVENTS: usize = 50;
const MAX_EVENTS: usize = 1000;

type ApiError = (StatusCode, Json<serde_json::Value>);

#[derive(Clone)]
pub struct ApiState {
    pub handle: SupervisorHandle,
    pub log: LogHandle,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/members", get(api_members))
        .route("/api/history/{link}", get(api_history))
        .route("/api/events", get(api_events))
        .route("/api/action", post(api_action))
        .route("/metrics", get(api_metrics))
        .with_state(state)
}

/// Serve until `shutdown` flips to true.
pub async fn serve(
    state: ApiState,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("control API on http://{addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

fn error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

fn unavailable(e: SupervisorError) -> ApiError {
    error(StatusCode::SERVICE_UNAVAILABLE, e)
}

// ── GET /api/status ─────────────────────────────────────────────────

async fn api_status(State(state): State<ApiState>) -> Json<StatusSnapshot> {
    Json(StatusSnapshot::clone(&state.handle.status()))
}

// ── GET /api/members ────────────────────────────────────────────────

async fn api_members(State(state): State<ApiState>) -> Json<Vec<LinkStatus>> {
    Json(state.handle.status().links.clone())
}

// ── GET /api/history/{link} ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    since_s: Option<u64>,
}

async fn api_history(
    State(state): State<ApiState>,
    Path(link): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<Sample>>, ApiError> {
    let window = q.since_s.unwrap_or(DEFAULT_HISTORY_S);
    let since = i64::try_from(window)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|d| Utc::now().checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    match state.handle.history(link.as_str(), since).await {
        Ok(Some(samples)) => Ok(Json(samples)),
        Ok(None) => Err(error(StatusCode::NOT_FOUND, format!("unknown link {link}"))),
        Err(e) => Err(unavailable(e)),
    }
}

// ── GET /api/events ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

async fn api_events(
    State(state): State<ApiState>,
    Query(q): Query<EventsQuery>,
) -> Result<Json<Vec<Event>>, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_EVENTS).min(MAX_EVENTS);
    state.handle.events(limit).await.map(Json).map_err(unavailable)
}

// ── POST /api/action ────────────────────────────────────────────────

async fn api_action(
    State(state): State<ApiState>,
    Json(action): Json<Action>,
) -> Result<(StatusCode, Json<ActionReply>), ApiError> {
    tracing::info!(?action, "operator action");
    let reply = match action {
        Action::SetLogLevel { level } => match logging::set_level(&state.log, &level) {
            Ok(()) => ActionReply::accepted(format!("log level set to {level}")),
            Err(e) => ActionReply::rejected(e),
        },
        other => state.handle.action(other).await.map_err(unavailable)?,
    };
    let status = if reply.accepted {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(reply)))
}

// ── GET /metrics ────────────────────────────────────────────────────

async fn api_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = wanfail_common::metrics::render_prometheus(&state.handle.status());
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
}
