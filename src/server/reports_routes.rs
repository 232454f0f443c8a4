//! `POST /reports`, `GET /reports`, `POST /reports/upvote`, and
//! `POST /reports/clarify` (§4.5): community report submission and upvoting.

use crate::errors::ApiError;
use crate::ratelimit;
use crate::reports::{self, ReportSubmission, SubmittedReport, UpvoteOutcome};
use crate::server::state::AppState;
use crate::weather::CurrentConditions;
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

async fn enforce_rate_limit(state: &AppState, identity: &str, action: &str, limit: &crate::config::ActionRateLimit) -> Result<(), ApiError> {
    let outcome = ratelimit::check(
        state.store.as_ref(),
        identity,
        action,
        i64::from(limit.max),
        chrono::Duration::from_std(limit.window).unwrap_or(chrono::Duration::hours(1)),
    )
    .await?;
    if !outcome.allowed {
        return Err(ApiError::RateLimited { action: action.to_string() });
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(flatten)]
    pub submission: ReportSubmission,
    pub current: CurrentConditions,
}

#[tracing::instrument(level = "debug", skip(state, headers, request))]
async fn submit(
    State(state): State<AppState>, ConnectInfo(peer): ConnectInfo<SocketAddr>, headers: HeaderMap,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmittedReport>, ApiError> {
    let identity = client_identity(&headers, peer);
    enforce_rate_limit(&state, &identity, "report_submit", &state.action_rate_limits.report_submit).await?;

    let report = reports::submit(state.store.as_ref(), request.submission, &request.current).await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub location: String,
    #[serde(default = "default_hours")]
    pub hours: i64,
}

fn default_hours() -> i64 {
    24
}

async fn list(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    let reports = reports::list(state.store.as_ref(), &query.location, query.hours).await?;
    Ok(Json(reports))
}

#[derive(Debug, Deserialize)]
pub struct UpvoteRequest {
    pub report_id: String,
}

async fn upvote(
    State(state): State<AppState>, ConnectInfo(peer): ConnectInfo<SocketAddr>, headers: HeaderMap,
    Json(request): Json<UpvoteRequest>,
) -> Result<Json<UpvoteOutcome>, ApiError> {
    let identity = reports::client_identity(&client_identity(&headers, peer));
    let outcome = reports::upvote(state.store.as_ref(), &request.report_id, &identity).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct ClarifyRequest {
    pub report_type: String,
}

#[tracing::instrument(level = "debug", skip(state, headers, request))]
async fn clarify(
    State(state): State<AppState>, ConnectInfo(peer): ConnectInfo<SocketAddr>, headers: HeaderMap,
    Json(request): Json<ClarifyRequest>,
) -> Result<Json<Vec<String>>, ApiError> {
    let identity = client_identity(&headers, peer);
    enforce_rate_limit(&state, &identity, "report_clarify", &state.action_rate_limits.report_clarify).await?;

    let questions = reports::clarify(state.llm.as_ref(), &request.report_type).await;
    Ok(Json(questions))
}

pub fn api() -> Router<AppState> {
    Router::new()
        .route("/", post(submit).get(list))
        .route("/upvote", post(upvote))
        .route("/clarify", post(clarify))
}
