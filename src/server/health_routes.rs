//! Liveness/readiness routes. `/` is a cheap process check; `/deep` also
//! pings the store, matching the teacher's shallow/deep health split.

use crate::server::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::{OpenApi, ToSchema};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthStatusReport {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[utoipa::path(get, path = "/health", responses((status = 200, body = HealthStatusReport)))]
async fn shallow() -> Json<HealthStatusReport> {
    Json(HealthStatusReport { status: HealthStatus::Up, reason: None })
}

#[utoipa::path(get, path = "/health/deep", responses((status = 200, body = HealthStatusReport), (status = 503, body = HealthStatusReport)))]
async fn deep(State(state): State<AppState>) -> (StatusCode, Json<HealthStatusReport>) {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, Json(HealthStatusReport { status: HealthStatus::Up, reason: None })),
        Err(error) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthStatusReport { status: HealthStatus::Down, reason: Some(error.to_string()) }),
        ),
    }
}

#[derive(OpenApi)]
#[openapi(paths(shallow, deep), components(schemas(HealthStatusReport, HealthStatus)))]
pub struct HealthApiDoc;

pub fn api() -> Router<AppState> {
    Router::new().route("/", get(shallow)).route("/deep", get(deep))
}
