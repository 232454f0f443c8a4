//! `POST /history/analyze` and `GET /history` (§4.6): the LLM-narrated
//! statistics pipeline and the raw record listing behind it.
//!
//! The route-level range for `analyze` is stricter than `history::analyse`'s
//! internal 1..=365 check: this handler additionally rejects `days < 7`
//! since a narrative over less than a week of history is not useful.

use crate::errors::ApiError;
use crate::history::{self, HistoryAnalysis};
use crate::ratelimit;
use crate::server::state::AppState;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::net::SocketAddr;

fn client_identity(headers: &HeaderMap, peer: SocketAddr) -> String {
    let forwarded = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok());
    let real_ip = headers.get("x-real-ip").and_then(|v| v.to_str().ok());
    crate::identity::resolve_client_address(forwarded, real_ip, peer)
}

const MIN_ANALYZE_DAYS: i64 = 7;

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub location: String,
    #[serde(default = "default_days")]
    pub days: i64,
    #[serde(default)]
    pub activities: Vec<String>,
}

fn default_days() -> i64 {
    30
}

#[tracing::instrument(level = "debug", skip(state, headers, request))]
async fn analyze(
    State(state): State<AppState>, ConnectInfo(peer): ConnectInfo<SocketAddr>, headers: HeaderMap,
    Json(request): Json<AnalyzeRequest>,
) -> Result<Json<HistoryAnalysis>, ApiError> {
    if request.days < MIN_ANALYZE_DAYS {
        return Err(ApiError::BadRequest(format!("days must be at least {MIN_ANALYZE_DAYS}")));
    }

    let identity = client_identity(&headers, peer);
    let limit = &state.action_rate_limits.history_analyze;
    let outcome = ratelimit::check(
        state.store.as_ref(),
        &identity,
        "history_analyze",
        i64::from(limit.max),
        chrono::Duration::from_std(limit.window).unwrap_or(chrono::Duration::hours(1)),
    )
    .await?;
    if !outcome.allowed {
        return Err(ApiError::RateLimited { action: "history_analyze".to_string() });
    }

    let analysis = history::analyse(
        state.store.as_ref(),
        state.llm.as_ref(),
        state.breakers.as_ref(),
        &request.location,
        request.days,
        &request.activities,
    )
    .await?;

    Ok(Json(analysis))
}

#[derive(Debug, Deserialize)]
pub struct HistoryListQuery {
    pub location: String,
    #[serde(default = "default_days")]
    pub days: i64,
}

async fn list_history(State(state): State<AppState>, Query(query): Query<HistoryListQuery>) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    let docs = history::list_raw(state.store.as_ref(), &query.location, query.days).await?;
    Ok(Json(docs))
}

pub fn analyze_api() -> Router<AppState> {
    Router::new().route("/", post(analyze))
}

pub fn list_api() -> Router<AppState> {
    Router::new().route("/", get(list_history))
}
