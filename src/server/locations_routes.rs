//! `GET /locations`, `GET /locations/{slug}`, `GET /locations/stats`,
//! `GET /search`, `GET /geo`, and `POST /locations/add` (§B, §M): read paths
//! over the location catalogue plus geocoding-backed lookup and creation.

use crate::errors::ApiError;
use crate::geo::{self, AddLocationOutcome, AddLocationRequest, LocationStats};
use crate::ratelimit;
use crate::server::state::AppState;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;

fn client_identity(headers: &HeaderMap, peer: SocketAddr) -> String {
    let forwarded = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok());
    let real_ip = headers.get("x-real-ip").and_then(|v| v.to_str().ok());
    crate::identity::resolve_client_address(forwarded, real_ip, peer)
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub tag: Option<String>,
}

async fn list_locations(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Json<Vec<serde_json::Value>> {
    Json(geo::list_all(state.store.as_ref(), query.tag.as_deref()).await)
}

async fn get_location(State(state): State<AppState>, Path(slug): Path<String>) -> Result<Json<serde_json::Value>, ApiError> {
    geo::get_by_slug(state.store.as_ref(), &slug).await.map(Json).ok_or_else(|| ApiError::NotFound(slug))
}

async fn tag_counts(State(state): State<AppState>) -> Json<HashMap<String, usize>> {
    Json(geo::tag_counts(state.store.as_ref()).await)
}

async fn location_stats(State(state): State<AppState>) -> Json<LocationStats> {
    Json(geo::location_stats(state.store.as_ref()).await)
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_limit() -> u64 {
    10
}

async fn search(State(state): State<AppState>, Query(query): Query<SearchQuery>) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    if let (Some(lat), Some(lon)) = (query.lat, query.lon) {
        return Ok(Json(geo::search_near(state.store.as_ref(), lat, lon, query.limit).await));
    }
    let text = query.q.ok_or_else(|| ApiError::BadRequest("search requires either q or lat/lon".to_string()))?;
    let matches = geo::search_locations(state.store.as_ref(), &text, query.limit).await;
    Ok(Json(matches.into_iter().map(|m| serde_json::json!({"slug": m.slug, "name": m.name})).collect()))
}

#[derive(Debug, Deserialize)]
pub struct GeoQuery {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub auto_create: bool,
}

async fn geo_lookup(State(state): State<AppState>, Query(query): Query<GeoQuery>) -> Result<Json<geo::GeoLookupResult>, ApiError> {
    let result = geo::geo_lookup(state.store.as_ref(), state.geocoder.as_ref(), query.lat, query.lon, query.auto_create).await?;
    Ok(Json(result))
}

#[tracing::instrument(level = "debug", skip(state, headers, request))]
async fn add_location(
    State(state): State<AppState>, ConnectInfo(peer): ConnectInfo<SocketAddr>, headers: HeaderMap,
    Json(request): Json<AddLocationRequest>,
) -> Result<Json<AddLocationOutcome>, ApiError> {
    let identity = client_identity(&headers, peer);
    let limit = &state.action_rate_limits.location_create;
    let outcome = ratelimit::check(
        state.store.as_ref(),
        &identity,
        "location_create",
        i64::from(limit.max),
        chrono::Duration::from_std(limit.window).unwrap_or(chrono::Duration::hours(1)),
    )
    .await?;
    if !outcome.allowed {
        return Err(ApiError::RateLimited { action: "location_create".to_string() });
    }

    let result = geo::add_location(state.store.as_ref(), state.geocoder.as_ref(), request).await?;
    Ok(Json(result))
}

pub fn locations_api() -> Router<AppState> {
    Router::new()
        .route("/", get(list_locations))
        .route("/add", post(add_location))
        .route("/tags", get(tag_counts))
        .route("/stats", get(location_stats))
        .route("/:slug", get(get_location))
}

pub fn search_api() -> Router<AppState> {
    Router::new().route("/", get(search))
}

pub fn geo_api() -> Router<AppState> {
    Router::new().route("/", get(geo_lookup))
}
