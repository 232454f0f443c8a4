//! Community reports subsystem (§4.5): submission with weather
//! cross-validation, listing, one-vote-per-client upvoting, and LLM-assisted
//! clarification with a hardcoded fallback question table.

use crate::llm::{LlmClient, Message};
use crate::store::{Filter, FindOptions, Store, Update};
use crate::weather::CurrentConditions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("store failure: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("unknown report type: {0}")]
    UnknownType(String),
}

pub const REPORT_TYPES: &[&str] =
    &["light-rain", "heavy-rain", "thunderstorm", "hail", "flooding", "strong-wind", "clear-skies", "fog", "dust", "frost"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Mild,
    Moderate,
    Severe,
}

impl Severity {
    fn from_str(value: &str) -> Self {
        match value {
            "mild" => Severity::Mild,
            "severe" => Severity::Severe,
            _ => Severity::Moderate,
        }
    }

    fn ttl_hours(self) -> i64 {
        match self {
            Severity::Mild => 24,
            Severity::Moderate => 48,
            Severity::Severe => 72,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportSubmission {
    pub location_slug: String,
    pub report_type: String,
    pub severity: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmittedReport {
    pub id: String,
    pub verified: bool,
    pub expires_at: DateTime<Utc>,
}

/// The first 16 hex characters of `SHA-256(ip)` (§4.5).
pub fn client_identity(ip: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

fn cross_validate(report_type: &str, current: &CurrentConditions) -> bool {
    let code = current.weather_code;
    match report_type {
        "light-rain" | "heavy-rain" => current.precipitation > 0.0 || (51..=82).contains(&code),
        "thunderstorm" => matches!(code, 95 | 96 | 99),
        "strong-wind" => current.wind_speed_10m > 20.0,
        "clear-skies" => matches!(code, 0 | 1) && current.precipitation == 0.0,
        "fog" => matches!(code, 45 | 48),
        "frost" => current.temperature_2m <= 3.0,
        _ => false,
    }
}

#[tracing::instrument(level = "debug", skip(store, submission, current))]
pub async fn submit(store: &dyn Store, submission: ReportSubmission, current: &CurrentConditions) -> Result<SubmittedReport, ReportError> {
    if !REPORT_TYPES.contains(&submission.report_type.as_str()) {
        return Err(ReportError::UnknownType(submission.report_type));
    }

    let severity = Severity::from_str(&submission.severity);
    let now = Utc::now();
    let expires_at = now + chrono::Duration::hours(severity.ttl_hours());
    let verified = cross_validate(&submission.report_type, current);
    let id = uuid::Uuid::new_v4().to_string();

    let doc = serde_json::json!({
        "_id": id,
        "locationSlug": submission.location_slug,
        "reportType": submission.report_type,
        "severity": submission.severity,
        "note": submission.note,
        "verified": verified,
        "upvotes": 0,
        "upvotedBy": [],
        "reportedAt": now.to_rfc3339(),
        "expiresAt": expires_at.to_rfc3339(),
    });

    store.insert_one("reports", doc).await?;

    Ok(SubmittedReport { id, verified, expires_at })
}

/// Lists unexpired reports for a location within the last `hours`.
pub async fn list(store: &dyn Store, location_slug: &str, hours: i64) -> Result<Vec<serde_json::Value>, ReportError> {
    let since = Utc::now() - chrono::Duration::hours(hours);
    let filter = Filter::new().eq("locationSlug", location_slug).gte("reportedAt", since.to_rfc3339());
    let docs = store.find("reports", filter, Some("reportedAt"), true, FindOptions::default()).await?;
    Ok(docs)
}

#[derive(Debug, Clone, Serialize)]
pub struct UpvoteOutcome {
    pub applied: bool,
}

/// Atomic: `{_id: reportId, upvotedBy ∌ identity}` → `$inc upvotes, $push
/// upvotedBy`. A modified count of zero means "already upvoted or report
/// not found" — not an error.
pub async fn upvote(store: &dyn Store, report_id: &str, identity: &str) -> Result<UpvoteOutcome, ReportError> {
    let filter = Filter::new().eq("_id", report_id).ne("upvotedBy", identity.to_string());
    let update = Update::new().inc("upvotes", 1).push("upvotedBy", identity.to_string());
    let result = store.update_one("reports", filter, update, false).await?;
    Ok(UpvoteOutcome { applied: result.modified_count > 0 })
}

fn fallback_questions(report_type: &str) -> Vec<String> {
    let questions: &[&str] = match report_type {
        "light-rain" | "heavy-rain" => &["How long has it been raining?", "Is the rain still ongoing?"],
        "thunderstorm" => &["Have you seen lightning or only heard thunder?", "How far away does the storm sound?"],
        "hail" => &["What size are the hailstones, roughly?"],
        "flooding" => &["Is the flooding affecting roads or just open ground?", "Is the water level still rising?"],
        "strong-wind" => &["Have you noticed any damage to trees or structures?"],
        "clear-skies" => &["Is visibility good in all directions?"],
        "fog" => &["How far can you see right now?"],
        "dust" => &["Is visibility noticeably reduced?"],
        "frost" => &["Is the frost covering the ground or just exposed surfaces?"],
        _ => &["Can you describe what you're observing?"],
    };
    questions.iter().map(|q| q.to_string()).collect()
}

fn parse_numbered_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| line.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))
        .map(|line| {
            let trimmed = line.trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')' || c == ' ');
            trimmed.to_string()
        })
        .collect()
}

/// Asks the LLM for 1-2 short follow-up questions for `report_type`,
/// falling back to a hardcoded table when the LLM is unavailable or its
/// response doesn't parse into at least two numbered lines.
pub async fn clarify(llm: &dyn LlmClient, report_type: &str) -> Vec<String> {
    if !llm.is_configured() {
        return fallback_questions(report_type);
    }

    let system = "Given a weather report type, ask 1-2 short numbered follow-up questions to clarify the observation.";
    let messages = [Message { role: "user".to_string(), content: format!("Report type: {report_type}") }];

    let Ok(response) = llm.messages("claude-haiku", system, &messages, &[], 128).await else {
        return fallback_questions(report_type);
    };

    let text = response.content.into_iter().find_map(|block| match block {
        crate::llm::Block::Text { text } => Some(text),
        _ => None,
    });

    match text {
        Some(text) => {
            let parsed = parse_numbered_lines(&text);
            if parsed.len() >= 2 {
                parsed
            } else {
                fallback_questions(report_type)
            }
        },
        None => fallback_questions(report_type),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn current(code: i32, precipitation: f64, wind: f64, temperature: f64) -> CurrentConditions {
        CurrentConditions {
            time: Utc::now(),
            temperature_2m: temperature,
            relative_humidity_2m: 50.0,
            apparent_temperature: temperature,
            precipitation,
            weather_code: code,
            wind_speed_10m: wind,
            wind_direction_10m: 0.0,
            wind_gusts_10m: wind,
            surface_pressure: 1013.0,
            cloud_cover: 10.0,
            uv_index: None,
        }
    }

    #[test]
    fn identity_is_sixteen_hex_characters() {
        let id = client_identity("203.0.113.5");
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn thunderstorm_is_verified_by_code() {
        assert!(cross_validate("thunderstorm", &current(96, 0.0, 0.0, 20.0)));
        assert!(!cross_validate("thunderstorm", &current(3, 0.0, 0.0, 20.0)));
    }

    #[test]
    fn unknown_severity_defaults_to_moderate_ttl() {
        assert_eq!(Severity::from_str("bogus").ttl_hours(), 48);
    }

    #[tokio::test]
    async fn submit_rejects_unknown_report_type() {
        let store = InMemoryStore::new();
        let submission =
            ReportSubmission { location_slug: "harare".to_string(), report_type: "tornado".to_string(), severity: "mild".to_string(), note: None };
        let result = submit(&store, submission, &current(0, 0.0, 0.0, 20.0)).await;
        assert!(matches!(result, Err(ReportError::UnknownType(_))));
    }

    #[tokio::test]
    async fn second_upvote_by_same_identity_is_a_no_op() {
        let store = InMemoryStore::new();
        let submission = ReportSubmission {
            location_slug: "harare".to_string(),
            report_type: "heavy-rain".to_string(),
            severity: "moderate".to_string(),
            note: None,
        };
        let submitted = submit(&store, submission, &current(61, 2.0, 0.0, 20.0)).await.unwrap();

        let first = upvote(&store, &submitted.id, "abc123").await.unwrap();
        assert!(first.applied);
        let second = upvote(&store, &submitted.id, "abc123").await.unwrap();
        assert!(!second.applied);
    }

    #[test]
    fn fallback_used_when_fewer_than_two_lines_parsed() {
        let parsed = parse_numbered_lines("Just one question here");
        assert!(parsed.len() < 2);
    }

    #[test]
    fn numbered_lines_parse_correctly() {
        let text = "1. How long has it rained?\n2. Is it still raining?";
        let parsed = parse_numbered_lines(text);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], "How long has it rained?");
    }
}
