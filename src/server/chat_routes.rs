//! `POST /chat` and `POST /explore/search` (§4.4, §B): the tool-using
//! assistant and its single-turn location-finder variant.

use crate::chat::{self, ChatRequest, ChatResponse};
use crate::errors::ApiError;
use crate::ratelimit;
use crate::server::state::AppState;
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

#[tracing::instrument(level = "debug", skip(state, headers, request))]
async fn chat(
    State(state): State<AppState>, ConnectInfo(peer): ConnectInfo<SocketAddr>, headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let identity = client_identity(&headers, peer);
    enforce_rate_limit(&state, &identity, "chat", &state.action_rate_limits.chat).await?;

    let response = chat::run_chat(state.store.as_ref(), state.llm.as_ref(), state.breakers.as_ref(), request).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct ExploreSearchRequest {
    pub query: String,
}

#[tracing::instrument(level = "debug", skip(state, headers, request))]
async fn explore_search(
    State(state): State<AppState>, ConnectInfo(peer): ConnectInfo<SocketAddr>, headers: HeaderMap,
    Json(request): Json<ExploreSearchRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let identity = client_identity(&headers, peer);
    enforce_rate_limit(&state, &identity, "explore_search", &state.action_rate_limits.explore_search).await?;

    let response = chat::explore_search(state.store.as_ref(), state.llm.as_ref(), state.breakers.as_ref(), &request.query).await;
    Ok(Json(response))
}

pub fn api() -> Router<AppState> {
    Router::new().route("/", post(chat))
}

pub fn explore_api() -> Router<AppState> {
    Router::new().route("/search", post(explore_search))
}
