//! `GET /weather` (§4.2): the cache → provider → synthesis pipeline exposed
//! over HTTP, with provenance surfaced as response headers rather than in
//! the JSON body so that clients can branch on it without parsing.

use crate::errors::ApiError;
use crate::server::state::AppState;
use crate::store::Filter;
use crate::weather::{self, NormalisedWeather, Provenance};
use axum::extract::{Query, State};
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use utoipa::OpenApi;

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct WeatherQuery {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub elevation: Option<f64>,
    #[serde(default)]
    pub slug: Option<String>,
}

fn validate_coordinates(lat: f64, lon: f64) -> Result<(), ApiError> {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(ApiError::BadRequest(format!("coordinates out of range: lat={lat}, lon={lon}")));
    }
    Ok(())
}

#[utoipa::path(
    get,
    path = "/weather",
    params(WeatherQuery),
    responses((status = 200, description = "Normalised weather for a location", body = NormalisedWeather)),
)]
#[tracing::instrument(level = "debug", skip(state))]
async fn get_weather(State(state): State<AppState>, Query(query): Query<WeatherQuery>) -> Result<Response, ApiError> {
    validate_coordinates(query.lat, query.lon)?;
    let elevation = query.elevation.unwrap_or(0.0);

    let known_slug = match &query.slug {
        Some(slug) => Some(slug.clone()),
        None => state
            .store
            .find_one("locations", Filter::new().geo_near("geo", query.lon, query.lat, 5_000.0))
            .await
            .ok()
            .flatten()
            .and_then(|doc| doc.get("slug").and_then(|s| s.as_str()).map(str::to_string)),
    };

    let result = weather::fetch_weather(
        state.store.as_ref(),
        state.breakers.as_ref(),
        state.tomorrow.as_ref(),
        state.open_meteo.as_ref(),
        query.lat,
        query.lon,
        elevation,
        known_slug.as_deref(),
    )
    .await;

    let mut response = Json(result.data).into_response();
    let cache_header = if result.provenance == Provenance::Cache { "HIT" } else { "MISS" };
    response.headers_mut().insert("x-cache", HeaderValue::from_static(cache_header));
    if let Ok(value) = HeaderValue::from_str(&result.provenance.to_string()) {
        response.headers_mut().insert("x-weather-provider", value);
    }
    Ok(response)
}

#[derive(OpenApi)]
#[openapi(paths(get_weather), components(schemas(NormalisedWeather)))]
pub struct WeatherApiDoc;

pub fn api() -> Router<AppState> {
    Router::new().route("/", get(get_weather))
}
