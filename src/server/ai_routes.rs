//! `POST /ai` and `POST /ai/followup` (§4.3): the AI summary pipeline and
//! its single-turn follow-up variant. `/ai/followup` is rate-limited
//! per client identity; `/ai` itself carries none, matching the original
//! implementation's own route.

use crate::errors::ApiError;
use crate::ratelimit;
use crate::server::state::AppState;
use crate::summary::{self, FollowupTurn, LocationContext, SummaryRequest};
use crate::weather::NormalisedWeather;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use std::net::SocketAddr;

fn client_identity(headers: &HeaderMap, peer: SocketAddr) -> String {
    let forwarded = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok());
    let real_ip = headers.get("x-real-ip").and_then(|v| v.to_str().ok());
    crate::identity::resolve_client_address(forwarded, real_ip, peer)
}

async fn enforce_rate_limit(state: &AppState, identity: &str, action: &str, limit: &crate::config::ActionRateLimit) -> Result<(), ApiError> {
    let outcome = ratelimit::check(state.store.as_ref(), identity, action, i64::from(limit.max), chrono::Duration::from_std(limit.window).unwrap_or(chrono::Duration::hours(1))).await?;
    if !outcome.allowed {
        return Err(ApiError::RateLimited { action: action.to_string() });
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct LocationInfo {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub elevation: f64,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_country() -> String {
    "ZW".to_string()
}

#[derive(Debug, Deserialize)]
pub struct AiSummaryRequest {
    pub weather: NormalisedWeather,
    pub location: LocationInfo,
    #[serde(default)]
    pub activities: Vec<String>,
}

#[tracing::instrument(level = "debug", skip(state, request))]
async fn generate_summary(State(state): State<AppState>, Json(request): Json<AiSummaryRequest>) -> Result<Json<summary::SummaryResponse>, ApiError> {
    let response = summary::summarise(
        state.store.as_ref(),
        state.llm.as_ref(),
        state.prompts.as_ref(),
        state.breakers.as_ref(),
        SummaryRequest {
            weather: &request.weather,
            location: LocationContext {
                slug: &request.location.slug,
                name: &request.location.name,
                elevation: request.location.elevation,
                country: &request.location.country,
                tags: &request.location.tags,
            },
            activities: &request.activities,
        },
    )
    .await?;

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct FollowupRequest {
    pub question: String,
    pub prior_summary: String,
    #[serde(default)]
    pub history: Vec<FollowupTurn>,
}

#[tracing::instrument(level = "debug", skip(state, headers, request))]
async fn followup(
    State(state): State<AppState>, ConnectInfo(peer): ConnectInfo<SocketAddr>, headers: HeaderMap,
    Json(request): Json<FollowupRequest>,
) -> Result<Json<summary::FollowupResponse>, ApiError> {
    let identity = client_identity(&headers, peer);
    enforce_rate_limit(&state, &identity, "ai_followup", &state.action_rate_limits.ai_followup).await?;

    let response = summary::followup(
        state.llm.as_ref(),
        state.breakers.as_ref(),
        &request.prior_summary,
        &request.history,
        &request.question,
    )
    .await;

    Ok(Json(response))
}

pub fn api() -> Router<AppState> {
    Router::new().route("/", post(generate_summary)).route("/followup", post(followup))
}
