//! `GET /status` (§6): a live dependency dashboard, one check per store
//! collection and external provider, rolled up into an overall status.
//! Unlike `/health`, this never returns a non-2xx response of its own —
//! a down dependency is reported in the body, not as the route's status
//! code, so dashboards can poll it unconditionally.

use crate::llm::LlmClient;
use crate::server::state::AppState;
use crate::store::{Filter, Store};
use crate::weather::WeatherProvider;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::time::Instant;
use utoipa::{OpenApi, ToSchema};

/// Fixed probe coordinates: Harare, matching the location the original
/// dashboard pings the weather providers with.
const PROBE_LAT: f64 = -17.83;
const PROBE_LON: f64 = 31.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Operational,
    Degraded,
    Down,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StatusCheck {
    pub name: String,
    pub status: CheckStatus,
    #[serde(rename = "latencyMs")]
    pub latency_ms: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StatusReport {
    pub status: CheckStatus,
    pub timestamp: String,
    #[serde(rename = "totalLatencyMs")]
    pub total_latency_ms: u64,
    pub checks: Vec<StatusCheck>,
}

fn check(name: &str, start: Instant, status: CheckStatus, message: impl Into<String>) -> StatusCheck {
    StatusCheck { name: name.to_string(), status, latency_ms: start.elapsed().as_millis() as u64, message: message.into() }
}

async fn check_store(state: &AppState) -> StatusCheck {
    let start = Instant::now();
    match state.store.ping().await {
        Ok(()) => check("Document Store", start, CheckStatus::Operational, "Connected and responding"),
        Err(error) => check("Document Store", start, CheckStatus::Down, error.to_string()),
    }
}

async fn check_tomorrow(state: &AppState) -> StatusCheck {
    let start = Instant::now();
    if !state.tomorrow.is_configured() {
        return check(
            "Tomorrow.io API",
            start,
            CheckStatus::Degraded,
            "API key not configured — falling back to Open-Meteo",
        );
    }

    match state.tomorrow.fetch(PROBE_LAT, PROBE_LON).await {
        Ok(_) => check("Tomorrow.io API", start, CheckStatus::Operational, "Responding normally"),
        Err(crate::weather::WeatherError::HttpRequest(error)) if error.status().map(|s| s.as_u16()) == Some(429) => {
            check("Tomorrow.io API", start, CheckStatus::Degraded, "Rate limited (429) — falling back to Open-Meteo")
        },
        Err(error) => check("Tomorrow.io API", start, CheckStatus::Down, error.to_string()),
    }
}

async fn check_open_meteo(state: &AppState) -> StatusCheck {
    let start = Instant::now();
    match state.open_meteo.fetch(PROBE_LAT, PROBE_LON).await {
        Ok(_) => check("Open-Meteo API", start, CheckStatus::Operational, "Responding normally"),
        Err(error) => check("Open-Meteo API", start, CheckStatus::Down, error.to_string()),
    }
}

async fn check_llm(state: &AppState) -> StatusCheck {
    let start = Instant::now();
    if !state.llm.is_configured() {
        return check("Anthropic AI", start, CheckStatus::Degraded, "API key not configured — basic summary fallback active");
    }

    match state.llm.messages("claude-haiku", "", &[crate::llm::Message { role: "user".to_string(), content: "ping".to_string() }], &[], 1).await
    {
        Ok(_) => check("Anthropic AI", start, CheckStatus::Operational, "Responding normally"),
        Err(crate::llm::LlmError::RateLimited) => {
            check("Anthropic AI", start, CheckStatus::Degraded, "Rate limited — AI summaries may be delayed")
        },
        Err(error) => check("Anthropic AI", start, CheckStatus::Down, error.to_string()),
    }
}

async fn check_cache(state: &AppState, collection: &str, name: &str, noun_singular: &str, noun_plural: &str) -> StatusCheck {
    let start = Instant::now();
    let filter = Filter::new().gte("expiresAt", Utc::now().to_rfc3339());
    match state.store.find(collection, filter, None, false, crate::store::FindOptions::default()).await {
        Ok(docs) if docs.is_empty() => {
            check(name, start, CheckStatus::Degraded, "Cache is empty — next requests will populate it")
        },
        Ok(docs) => {
            let noun = if docs.len() == 1 { noun_singular } else { noun_plural };
            check(name, start, CheckStatus::Operational, format!("{} active {noun}", docs.len()))
        },
        Err(error) => check(name, start, CheckStatus::Down, error.to_string()),
    }
}

fn overall(checks: &[StatusCheck]) -> CheckStatus {
    if checks.iter().any(|c| matches!(c.status, CheckStatus::Down | CheckStatus::Degraded)) {
        CheckStatus::Degraded
    } else {
        CheckStatus::Operational
    }
}

#[utoipa::path(get, path = "/status", responses((status = 200, body = StatusReport)))]
#[tracing::instrument(level = "debug", skip(state))]
async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    let start = Instant::now();

    let checks = vec![
        check_store(&state).await,
        check_tomorrow(&state).await,
        check_open_meteo(&state).await,
        check_llm(&state).await,
        check_cache(&state, "weather_cache", "Weather Cache", "cached location", "cached locations").await,
        check_cache(&state, "ai_summaries", "AI Summary Cache", "cached summary", "cached summaries").await,
    ];

    Json(StatusReport {
        status: overall(&checks),
        timestamp: Utc::now().to_rfc3339(),
        total_latency_ms: start.elapsed().as_millis() as u64,
        checks,
    })
}

#[derive(OpenApi)]
#[openapi(paths(status), components(schemas(StatusReport, StatusCheck, CheckStatus)))]
pub struct StatusApiDoc;

pub fn api() -> Router<AppState> {
    Router::new().route("/", get(status))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_with(status: CheckStatus) -> StatusCheck {
        StatusCheck { name: "x".to_string(), status, latency_ms: 0, message: String::new() }
    }

    #[test]
    fn overall_is_operational_only_when_every_check_is() {
        assert_eq!(overall(&[check_with(CheckStatus::Operational), check_with(CheckStatus::Operational)]), CheckStatus::Operational);
    }

    #[test]
    fn a_single_down_or_degraded_check_drags_the_rollup_down() {
        assert_eq!(overall(&[check_with(CheckStatus::Operational), check_with(CheckStatus::Down)]), CheckStatus::Degraded);
        assert_eq!(overall(&[check_with(CheckStatus::Operational), check_with(CheckStatus::Degraded)]), CheckStatus::Degraded);
    }
}
