//! `GET /suitability[?key]` (§4.7): the full activity-suitability rule
//! bundle, or a single rule when a `key` of shape
//! `^(activity|category):[a-z0-9-]+$` is supplied.

use crate::errors::ApiError;
use crate::server::state::AppState;
use crate::suitability::{self, SuitabilityRule};
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct SuitabilityQuery {
    #[serde(default)]
    pub key: Option<String>,
}

async fn suitability(State(state): State<AppState>, Query(query): Query<SuitabilityQuery>) -> Result<Json<Vec<SuitabilityRule>>, ApiError> {
    match query.key {
        Some(key) => {
            if !suitability::is_valid_rule_key(&key) {
                return Err(ApiError::BadRequest(format!("invalid rule key: {key}")));
            }
            let rule = suitability::get_rule_by_key(state.store.as_ref(), &key).await?;
            Ok(Json(rule.into_iter().collect()))
        },
        None => {
            let rules = suitability::list_rules(state.store.as_ref()).await?;
            Ok(Json(rules))
        },
    }
}

pub fn api() -> Router<AppState> {
    Router::new().route("/", get(suitability))
}
