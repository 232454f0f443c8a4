//! Top-level error taxonomy.
//!
//! Each component (store, breaker, llm, weather, chat, reports, history, ...)
//! owns a narrow `thiserror` enum; `ApiError` aggregates them with `#[from]`
//! and is the only error type handlers return, directly implementing
//! `IntoResponse` the way the teacher's `server::errors::ApiError` does.

use crate::breaker::BreakerError;
use crate::chat::ChatError;
use crate::devices::DeviceError;
use crate::geo::GeoError;
use crate::history::HistoryError;
use crate::llm::LlmError;
use crate::maptiles::MapTileError;
use crate::ratelimit::RateLimitError;
use crate::reports::ReportError;
use crate::store::StoreError;
use crate::suitability::SuitabilityError;
use crate::weather::WeatherError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limit exceeded for {action}")]
    RateLimited { action: String },

    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("circuit breaker: {0}")]
    Breaker(#[from] BreakerError),

    #[error("llm failure: {0}")]
    Llm(#[from] LlmError),

    #[error("weather pipeline failure: {0}")]
    Weather(#[from] WeatherError),

    #[error("chat orchestration failure: {0}")]
    Chat(#[from] ChatError),

    #[error("reports failure: {0}")]
    Report(#[from] ReportError),

    #[error("history analysis failure: {0}")]
    History(#[from] HistoryError),

    #[error("location service failure: {0}")]
    Geo(#[from] GeoError),

    #[error("suitability lookup failure: {0}")]
    Suitability(#[from] SuitabilityError),

    #[error("rate limit check failure: {0}")]
    RateLimitCheck(#[from] RateLimitError),

    #[error("device profile failure: {0}")]
    Device(#[from] DeviceError),

    #[error("map tile proxy failure: {0}")]
    MapTile(#[from] MapTileError),

    #[error("invalid URL path input: {0}")]
    Path(#[from] axum::extract::rejection::PathRejection),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] axum::extract::rejection::JsonRejection),

    #[error("failed joining with thread: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("http server failure: {0}")]
    Hyper(#[from] hyper::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApiError {
    fn status_and_body(&self) -> (StatusCode, ErrorBody) {
        let body = ErrorBody { error: self.to_string(), reason: None };
        match self {
            Self::BadRequest(_)
            | Self::Path(_)
            | Self::Json(_)
            | Self::Store(StoreError::InvalidFilter(_))
            | Self::History(HistoryError::InvalidRange)
            | Self::Suitability(_)
            | Self::MapTile(MapTileError::InvalidLayer(_))
            | Self::MapTile(MapTileError::ZoomOutOfRange)
            | Self::MapTile(MapTileError::InvalidTimestamp)
            | Self::Device(DeviceError::InvalidTheme(_))
            | Self::Device(DeviceError::InvalidSlug(_))
            | Self::Device(DeviceError::TooManyActivities)
            | Self::Device(DeviceError::TooManySavedLocations)
            | Self::Device(DeviceError::NoFieldsToUpdate)
            | Self::Geo(GeoError::UnsupportedRegion) => (StatusCode::BAD_REQUEST, body),
            Self::NotFound(_) | Self::History(HistoryError::LocationNotFound(_)) | Self::Device(DeviceError::NotFound) => {
                (StatusCode::NOT_FOUND, body)
            },
            Self::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, body),
            Self::Llm(LlmError::RateLimited) | Self::Chat(ChatError::RateLimited) => {
                (StatusCode::TOO_MANY_REQUESTS, body)
            },
            Self::Unavailable(_)
            | Self::Breaker(_)
            | Self::Weather(_)
            | Self::Geo(GeoError::GeocodingUnavailable)
            | Self::MapTile(MapTileError::Unconfigured) => (StatusCode::SERVICE_UNAVAILABLE, body),
            Self::Store(_) => (StatusCode::BAD_GATEWAY, body),
            Self::Llm(_)
            | Self::Chat(_)
            | Self::Report(_)
            | Self::History(_)
            | Self::Geo(_)
            | Self::RateLimitCheck(_)
            | Self::Device(_)
            | Self::MapTile(_) => (StatusCode::INTERNAL_SERVER_ERROR, body),
            Self::Join(_) | Self::Io(_) | Self::Hyper(_) => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "request failed");
        let (status, body) = self.status_and_body();
        (status, Json(body)).into_response()
    }
}
