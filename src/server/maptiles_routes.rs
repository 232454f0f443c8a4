//! `GET /map-tiles` (§6): proxies a single provider tile through the
//! server so the provider API key never reaches the client.

use crate::errors::ApiError;
use crate::server::state::AppState;
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct TileQuery {
    pub z: i32,
    pub x: i32,
    pub y: i32,
    pub layer: String,
    #[serde(default = "default_timestamp")]
    pub timestamp: String,
}

fn default_timestamp() -> String {
    "now".to_string()
}

async fn tile(State(state): State<AppState>, Query(query): Query<TileQuery>) -> Result<Response, ApiError> {
    let tile = state.tiles.fetch(query.z, query.x, query.y, &query.layer, &query.timestamp).await?;
    let status = StatusCode::from_u16(tile.status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((status, [(CONTENT_TYPE, "image/png")], tile.body).into_response())
}

pub fn api() -> Router<AppState> {
    Router::new().route("/", get(tile))
}
