//! AI summary pipeline (§4.3): tiered TTL cache, weather-change staleness
//! detection, prompt assembly, graceful degradation to a templated
//! fallback when the LLM is unavailable.

use crate::breaker::BreakerRegistry;
use crate::llm::{LlmClient, Message};
use crate::prompts::{render, PromptLibrary};
use crate::store::{Filter, Store, Update};
use crate::weather::NormalisedWeather;
use chrono::{DateTime, Datelike, Utc};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("store failure: {0}")]
    Store(#[from] crate::store::StoreError),
}

const TIER1_SLUGS: &[&str] = &[
    "harare", "bulawayo", "mutare", "gweru", "masvingo", "kwekwe", "kadoma", "marondera", "chinhoyi",
    "victoria-falls",
];
const TIER2_TAGS: &[&str] = &["farming", "mining", "education", "border"];

const TIER1_TTL_SECS: i64 = 30 * 60;
const TIER2_TTL_SECS: i64 = 60 * 60;
const TIER3_TTL_SECS: i64 = 120 * 60;

const STALENESS_THRESHOLD_C: f64 = 5.0;

pub struct LocationContext<'a> {
    pub slug: &'a str,
    pub name: &'a str,
    pub elevation: f64,
    pub country: &'a str,
    pub tags: &'a [String],
}

pub struct SummaryRequest<'a> {
    pub weather: &'a NormalisedWeather,
    pub location: LocationContext<'a>,
    pub activities: &'a [String],
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SummaryResponse {
    pub insight: String,
    pub cached: bool,
}

/// Tier TTL in seconds for a location, derived from slug and tags (§4.3).
pub fn tier_ttl_secs(slug: &str, tags: &[String]) -> i64 {
    if TIER1_SLUGS.contains(&slug) {
        TIER1_TTL_SECS
    } else if tags.iter().any(|t| TIER2_TAGS.contains(&t.as_str())) {
        TIER2_TTL_SECS
    } else {
        TIER3_TTL_SECS
    }
}

/// A cache hit is stale if the temperature delta exceeds the threshold
/// (strict `>`, so exactly 5.0 is NOT stale) or the WMO code differs.
pub fn is_stale(current_temp: f64, current_code: i32, cached_temp: f64, cached_code: i32) -> bool {
    (current_temp - cached_temp).abs() > STALENESS_THRESHOLD_C || current_code != cached_code
}

struct Season {
    name: String,
    shona: String,
    description: String,
}

/// Looks up the current season from the `seasons` collection by country
/// code and month, falling back to the Zimbabwe season table (used
/// regardless of the requested country, matching the original) when the
/// collection has no matching document.
async fn season_for(store: &dyn Store, country: &str, month: u32) -> Season {
    let doc = store
        .find_one("seasons", Filter::new().eq("countryCode", country.to_uppercase()).eq("months", i64::from(month)))
        .await
        .ok()
        .flatten();

    if let Some(doc) = doc {
        let name = doc.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let shona = doc.get("localName").and_then(|v| v.as_str()).map(str::to_string).unwrap_or_else(|| name.clone());
        let description = doc.get("description").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        return Season { name, shona, description };
    }

    let (name, shona, description) = match month {
        11 | 12 | 1 | 2 | 3 => ("Wet season", "Masika", "The rainy season brings heavy afternoon thunderstorms."),
        4 | 5 => ("Post-rain", "Munakamwe", "Temperatures moderate as the rains taper off."),
        6 | 7 | 8 => ("Cool dry", "Chirimo", "Clear skies and cold mornings with possible frost."),
        _ => ("Hot dry", "Zhizha", "Building heat and humidity before the rains."),
    };
    Season { name: name.to_string(), shona: shona.to_string(), description: description.to_string() }
}

#[tracing::instrument(level = "debug", skip(store, llm, prompts, breakers, request))]
#[allow(clippy::too_many_arguments)]
pub async fn summarise(
    store: &dyn Store, llm: &dyn LlmClient, prompts: &PromptLibrary, breakers: &BreakerRegistry,
    request: SummaryRequest<'_>,
) -> Result<SummaryResponse, SummaryError> {
    let slug = request.location.slug;
    let current = &request.weather.current;

    if let Some(cached) = lookup_cache(store, slug).await? {
        let stale = is_stale(current.temperature_2m, current.weather_code, cached.cached_temp, cached.cached_code);
        if !stale {
            return Ok(SummaryResponse { insight: cached.insight, cached: true });
        }
    }

    let season = season_for(store, request.location.country, Utc::now().month()).await;

    let llm_open = breakers.get("llm").map(|b| !b.is_allowed()).unwrap_or(false);
    let insight = if !llm.is_configured() || llm_open {
        templated_fallback(&request, &season)
    } else {
        match generate_with_llm(store, llm, prompts, &request, &season).await {
            Some(text) => text,
            None => templated_fallback(&request, &season),
        }
    };

    let ttl = tier_ttl_secs(slug, request.location.tags);
    upsert_cache(store, slug, &insight, current.temperature_2m, current.weather_code, ttl).await?;

    Ok(SummaryResponse { insight, cached: false })
}

struct CachedSummary {
    insight: String,
    cached_temp: f64,
    cached_code: i32,
}

async fn lookup_cache(store: &dyn Store, slug: &str) -> Result<Option<CachedSummary>, SummaryError> {
    let Some(doc) = store.find_one("ai_summaries", Filter::new().eq("locationSlug", slug)).await? else {
        return Ok(None);
    };
    let expires_at = doc
        .get("expiresAt")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    if expires_at.map(|dt| dt <= Utc::now()).unwrap_or(true) {
        return Ok(None);
    }

    let insight = doc.get("insight").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let snapshot = doc.get("weatherSnapshot");
    let cached_temp = snapshot.and_then(|s| s.get("temperature")).and_then(|v| v.as_f64()).unwrap_or(f64::MAX);
    let cached_code = snapshot.and_then(|s| s.get("weatherCode")).and_then(|v| v.as_i64()).unwrap_or(-1) as i32;

    Ok(Some(CachedSummary { insight, cached_temp, cached_code }))
}

async fn upsert_cache(
    store: &dyn Store, slug: &str, insight: &str, temperature: f64, weather_code: i32, ttl_secs: i64,
) -> Result<(), SummaryError> {
    let now = Utc::now();
    let update = Update::new()
        .set("locationSlug", slug)
        .set("insight", insight)
        .set("generatedAt", now.to_rfc3339())
        .set("weatherSnapshot", serde_json::json!({"temperature": temperature, "weatherCode": weather_code}))
        .set("expiresAt", (now + chrono::Duration::seconds(ttl_secs)).to_rfc3339());

    store.update_one("ai_summaries", Filter::new().eq("locationSlug", slug), update, true).await?;
    Ok(())
}

fn templated_fallback(request: &SummaryRequest<'_>, season: &Season) -> String {
    let current = &request.weather.current;
    format!(
        "Current conditions in {name}: {temp}°C with {humidity}% humidity. We are in the {shona} season \
         ({season_name}). {description}",
        name = request.location.name,
        temp = current.temperature_2m.round(),
        humidity = current.relative_humidity_2m.round(),
        shona = season.shona,
        season_name = season.name,
        description = season.description,
    )
}

async fn generate_with_llm(
    store: &dyn Store, llm: &dyn LlmClient, prompts: &PromptLibrary, request: &SummaryRequest<'_>, season: &Season,
) -> Option<String> {
    let template = prompts.get(store, "system:summary").await;
    let current = &request.weather.current;

    let mut values: HashMap<&str, String> = HashMap::new();
    values.insert("name", request.location.name.to_string());
    values.insert("temperature", current.temperature_2m.round().to_string());
    values.insert("humidity", current.relative_humidity_2m.round().to_string());
    values.insert("weather_code", current.weather_code.to_string());
    values.insert("tags", request.location.tags.join(", "));
    values.insert("activities", request.activities.join(", "));
    let system = render(&template.template, &values);

    let three_day_highs: Vec<String> = request
        .weather
        .daily
        .temperature_2m_max
        .iter()
        .take(3)
        .zip(request.weather.daily.temperature_2m_min.iter())
        .map(|(hi, lo)| format!("{hi}/{lo}"))
        .collect();

    let user_message = serde_json::json!({
        "current": current,
        "threeDayHighsLows": three_day_highs,
        "weatherCodes": request.weather.daily.weather_code,
        "insights": request.weather.insights,
        "tags": request.location.tags,
        "activities": request.activities,
        "season": {"shona": season.shona, "name": season.name, "description": season.description},
    })
    .to_string();

    let messages = [Message { role: "user".to_string(), content: user_message }];
    let response = llm.messages(&template.model, &system, &messages, &[], template.max_tokens).await.ok()?;

    response.content.into_iter().find_map(|block| match block {
        crate::llm::Block::Text { text } => Some(text),
        _ => None,
    })
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct FollowupTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FollowupResponse {
    pub message: String,
}

const FOLLOWUP_HISTORY_MAX_TURNS: usize = 10;

/// Single-turn `/ai/followup` call (§4.3): the prior AI summary is seeded as
/// the first assistant message, followed by up to the last 10 turns of
/// conversation history and the new question.
#[tracing::instrument(level = "debug", skip(llm, breakers, prior_summary, history))]
pub async fn followup(
    llm: &dyn LlmClient, breakers: &BreakerRegistry, prior_summary: &str, history: &[FollowupTurn],
    question: &str,
) -> FollowupResponse {
    let llm_open = breakers.get("llm").map(|b| !b.is_allowed()).unwrap_or(true);
    if !llm.is_configured() || llm_open {
        return FollowupResponse {
            message: "Follow-up questions aren't available right now — try again shortly.".to_string(),
        };
    }

    let skip = history.len().saturating_sub(FOLLOWUP_HISTORY_MAX_TURNS);
    let mut messages = vec![Message { role: "assistant".to_string(), content: prior_summary.to_string() }];
    messages.extend(history[skip..].iter().map(|turn| Message { role: turn.role.clone(), content: turn.content.clone() }));
    messages.push(Message { role: "user".to_string(), content: question.to_string() });

    let system = "Answer the follow-up question about the weather briefing you already gave. Be concise.";
    match llm.messages("claude-haiku", system, &messages, &[], 512).await {
        Ok(response) => {
            let text = response
                .content
                .into_iter()
                .find_map(|block| match block {
                    crate::llm::Block::Text { text } => Some(text),
                    _ => None,
                })
                .unwrap_or_else(|| "I don't have anything more to add.".to_string());
            FollowupResponse { message: text }
        },
        Err(_) => FollowupResponse { message: "Follow-up questions aren't available right now — try again shortly.".to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier1_slug_gets_thirty_minute_ttl() {
        assert_eq!(tier_ttl_secs("harare", &[]), 1800);
    }

    #[test]
    fn tier2_tag_gets_sixty_minute_ttl_when_not_tier1() {
        assert_eq!(tier_ttl_secs("chiredzi", &["farming".to_string()]), 3600);
    }

    #[test]
    fn otherwise_gets_two_hour_ttl() {
        assert_eq!(tier_ttl_secs("chiredzi", &["tourism".to_string()]), 7200);
    }

    #[test]
    fn staleness_boundary_is_exclusive() {
        assert!(!is_stale(20.0, 0, 15.0, 0));
        assert!(is_stale(20.1, 0, 15.0, 0));
    }

    #[test]
    fn staleness_triggers_on_code_mismatch_even_with_same_temperature() {
        assert!(is_stale(20.0, 1, 20.0, 2));
    }

    #[tokio::test]
    async fn season_for_falls_back_to_the_zimbabwe_table_when_uncataloged() {
        let store = crate::store::InMemoryStore::new();
        let season = season_for(&store, "ZW", 7).await;
        assert_eq!(season.name, "Cool dry");
        assert_eq!(season.shona, "Chirimo");
    }

    #[tokio::test]
    async fn season_for_prefers_a_store_override_over_the_fallback_table() {
        let store = crate::store::InMemoryStore::new();
        store
            .insert_one(
                "seasons",
                serde_json::json!({"countryCode": "ZM", "months": [7], "name": "Dry season", "localName": "Chilimwe"}),
            )
            .await
            .unwrap();

        let season = season_for(&store, "zm", 7).await;
        assert_eq!(season.name, "Dry season");
        assert_eq!(season.shona, "Chilimwe");
    }
}
