//! Device profile CRUD (component B): `POST /devices`, `GET /devices/{id}`,
//! `PATCH /devices/{id}`.

use crate::devices::{self, CreateDeviceRequest, DeviceProfile, UpdatePreferencesRequest};
use crate::errors::ApiError;
use crate::server::state::AppState;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};

async fn create(State(state): State<AppState>, Json(request): Json<CreateDeviceRequest>) -> Result<Json<DeviceProfile>, ApiError> {
    let profile = devices::create(state.store.as_ref(), request).await?;
    Ok(Json(profile))
}

async fn get(State(state): State<AppState>, Path(device_id): Path<String>) -> Result<Json<DeviceProfile>, ApiError> {
    let profile = devices::get(state.store.as_ref(), &device_id).await?;
    Ok(Json(profile))
}

async fn update_preferences(
    State(state): State<AppState>, Path(device_id): Path<String>, Json(request): Json<UpdatePreferencesRequest>,
) -> Result<Json<DeviceProfile>, ApiError> {
    let profile = devices::update_preferences(state.store.as_ref(), &device_id, request).await?;
    Ok(Json(profile))
}

pub fn api() -> Router<AppState> {
    Router::new()
        .route("/", post(create))
        .route("/:device_id", get(get).patch(update_preferences))
}
