//! History analyser (§4.6): server-computed statistics over raw
//! `weather_history` entries, an LLM-authored narrative over those stats,
//! and a content-addressed cache keyed on the underlying data.

use crate::breaker::BreakerRegistry;
use crate::llm::{LlmClient, Message};
use crate::store::{Filter, FindOptions, Store, Update};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

const CACHE_TTL_SECS: i64 = 60 * 60;
const RAINY_DAY_THRESHOLD_MM: f64 = 0.1;
const TREND_THRESHOLD_C: f64 = 1.0;
const HEAT_STRESS_THRESHOLD: f64 = 28.0;
const THUNDERSTORM_PROBABILITY_THRESHOLD: f64 = 30.0;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("store failure: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("days must be between 1 and 365")]
    InvalidRange,

    #[error("location not found: {0}")]
    LocationNotFound(String),
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RangeStat {
    pub average: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct HistoryStats {
    pub days_analysed: usize,
    pub daily_high: RangeStat,
    pub daily_low: RangeStat,
    pub feels_like_high: RangeStat,
    pub feels_like_low: RangeStat,
    pub precipitation_sum: RangeStat,
    pub humidity: RangeStat,
    pub wind_speed: RangeStat,
    pub wind_gusts: RangeStat,
    pub uv_index: RangeStat,
    pub pressure: RangeStat,
    pub cloud_cover: RangeStat,
    pub rainy_days: usize,
    pub trend: Option<String>,
    pub top_codes: Vec<(i32, usize)>,
    pub heat_stress_average: Option<f64>,
    pub heat_stress_days: Option<usize>,
    pub thunderstorm_probability_average: Option<f64>,
    pub thunderstorm_probability_days: Option<usize>,
    pub growing_degree_days_sum: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryAnalysis {
    pub stats: HistoryStats,
    pub narrative: String,
    pub ai_available: bool,
    pub cached: bool,
}

struct Entry {
    recorded_at: DateTime<Utc>,
    temperature_2m: f64,
    daily_high: Option<f64>,
    daily_low: Option<f64>,
    feels_like: f64,
    precipitation: f64,
    precipitation_sum: Option<f64>,
    humidity: f64,
    wind_speed: f64,
    wind_gust: f64,
    uv_index: Option<f64>,
    pressure: f64,
    cloud_cover: f64,
    weather_code: i32,
    heat_stress_index: Option<f64>,
    thunderstorm_probability: Option<f64>,
    gdd: Option<f64>,
}

fn range_of(values: &[f64]) -> RangeStat {
    if values.is_empty() {
        return RangeStat::default();
    }
    let sum: f64 = values.iter().sum();
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    RangeStat { average: sum / values.len() as f64, min, max }
}

fn parse_entry(doc: &serde_json::Value) -> Option<Entry> {
    let recorded_at = doc.get("recordedAt")?.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok())?.with_timezone(&Utc);
    let current = doc.get("current")?;
    let daily = doc.get("daily");
    let insights = doc.get("insights");

    let temperature_2m = current.get("temperature_2m")?.as_f64()?;

    Some(Entry {
        recorded_at,
        temperature_2m,
        daily_high: daily.and_then(|d| d.get("temperature_2m_max")).and_then(|v| v.as_f64()),
        daily_low: daily.and_then(|d| d.get("temperature_2m_min")).and_then(|v| v.as_f64()),
        feels_like: current.get("apparent_temperature").and_then(|v| v.as_f64()).unwrap_or(temperature_2m),
        precipitation: current.get("precipitation").and_then(|v| v.as_f64()).unwrap_or(0.0),
        precipitation_sum: daily.and_then(|d| d.get("precipitation_sum")).and_then(|v| v.as_f64()),
        humidity: current.get("relative_humidity_2m").and_then(|v| v.as_f64()).unwrap_or(0.0),
        wind_speed: current.get("wind_speed_10m").and_then(|v| v.as_f64()).unwrap_or(0.0),
        wind_gust: current.get("wind_gusts_10m").and_then(|v| v.as_f64()).unwrap_or(0.0),
        uv_index: current.get("uv_index").and_then(|v| v.as_f64()),
        pressure: current.get("surface_pressure").and_then(|v| v.as_f64()).unwrap_or(0.0),
        cloud_cover: current.get("cloud_cover").and_then(|v| v.as_f64()).unwrap_or(0.0),
        weather_code: daily
            .and_then(|d| d.get("weather_code"))
            .and_then(|v| v.as_i64())
            .or_else(|| current.get("weather_code").and_then(|v| v.as_i64()))
            .unwrap_or(0) as i32,
        heat_stress_index: insights.and_then(|i| i.get("heat_stress_index")).and_then(|v| v.as_f64()),
        thunderstorm_probability: insights.and_then(|i| i.get("thunderstorm_probability")).and_then(|v| v.as_f64()),
        gdd: insights.and_then(|i| i.get("gdd10_to_30")).and_then(|v| v.as_f64()),
    })
}

fn friendly_code_label(code: i32) -> String {
    match code {
        0 | 1 => "clear".to_string(),
        2 | 3 => "partly cloudy".to_string(),
        45 | 48 => "fog".to_string(),
        51..=57 => "drizzle".to_string(),
        61..=67 => "rain".to_string(),
        71..=77 => "snow".to_string(),
        80..=82 => "rain showers".to_string(),
        85 | 86 => "snow showers".to_string(),
        95..=99 => "thunderstorm".to_string(),
        _ => "unknown".to_string(),
    }
}

fn compute_stats(entries: &[Entry]) -> HistoryStats {
    let highs: Vec<f64> = entries.iter().map(|e| e.daily_high.unwrap_or(e.temperature_2m)).collect();
    let lows: Vec<f64> = entries.iter().map(|e| e.daily_low.unwrap_or(e.temperature_2m)).collect();

    let rainy_days = entries.iter().filter(|e| e.precipitation_sum.unwrap_or(e.precipitation) > RAINY_DAY_THRESHOLD_MM).count();

    let trend = if entries.len() >= 8 {
        let quartile = entries.len() / 4;
        let first_quartile_avg: f64 = highs[..quartile].iter().sum::<f64>() / quartile as f64;
        let last_quartile_avg: f64 = highs[entries.len() - quartile..].iter().sum::<f64>() / quartile as f64;
        let delta = last_quartile_avg - first_quartile_avg;
        if delta.abs() > TREND_THRESHOLD_C {
            Some(if delta > 0.0 { "warming".to_string() } else { "cooling".to_string() })
        } else {
            None
        }
    } else {
        None
    };

    let mut code_counts: std::collections::HashMap<i32, usize> = std::collections::HashMap::new();
    for entry in entries {
        *code_counts.entry(entry.weather_code).or_insert(0) += 1;
    }
    let mut top_codes: Vec<(i32, usize)> = code_counts.into_iter().collect();
    top_codes.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    top_codes.truncate(3);

    let heat_stress_values: Vec<f64> = entries.iter().filter_map(|e| e.heat_stress_index).collect();
    let (heat_stress_average, heat_stress_days) = if heat_stress_values.is_empty() {
        (None, None)
    } else {
        let average = heat_stress_values.iter().sum::<f64>() / heat_stress_values.len() as f64;
        let days = heat_stress_values.iter().filter(|v| **v >= HEAT_STRESS_THRESHOLD).count();
        (Some(average), Some(days))
    };

    let thunderstorm_values: Vec<f64> = entries.iter().filter_map(|e| e.thunderstorm_probability).collect();
    let (thunderstorm_average, thunderstorm_days) = if thunderstorm_values.is_empty() {
        (None, None)
    } else {
        let average = thunderstorm_values.iter().sum::<f64>() / thunderstorm_values.len() as f64;
        let days = thunderstorm_values.iter().filter(|v| **v > THUNDERSTORM_PROBABILITY_THRESHOLD).count();
        (Some(average), Some(days))
    };

    let gdd_sum = {
        let values: Vec<f64> = entries.iter().filter_map(|e| e.gdd).collect();
        if values.is_empty() { None } else { Some(values.iter().sum()) }
    };

    HistoryStats {
        days_analysed: entries.len(),
        daily_high: range_of(&highs),
        daily_low: range_of(&lows),
        feels_like_high: range_of(&entries.iter().map(|e| e.feels_like).collect::<Vec<_>>()),
        feels_like_low: range_of(&entries.iter().map(|e| e.feels_like).collect::<Vec<_>>()),
        precipitation_sum: range_of(&entries.iter().map(|e| e.precipitation_sum.unwrap_or(e.precipitation)).collect::<Vec<_>>()),
        humidity: range_of(&entries.iter().map(|e| e.humidity).collect::<Vec<_>>()),
        wind_speed: range_of(&entries.iter().map(|e| e.wind_speed).collect::<Vec<_>>()),
        wind_gusts: range_of(&entries.iter().map(|e| e.wind_gust).collect::<Vec<_>>()),
        uv_index: range_of(&entries.iter().filter_map(|e| e.uv_index).collect::<Vec<_>>()),
        pressure: range_of(&entries.iter().map(|e| e.pressure).collect::<Vec<_>>()),
        cloud_cover: range_of(&entries.iter().map(|e| e.cloud_cover).collect::<Vec<_>>()),
        rainy_days,
        trend,
        top_codes,
        heat_stress_average,
        heat_stress_days,
        thunderstorm_probability_average: thunderstorm_average,
        thunderstorm_probability_days: thunderstorm_days,
        growing_degree_days_sum: gdd_sum,
    }
}

fn stats_to_text(slug: &str, stats: &HistoryStats) -> String {
    let codes = stats
        .top_codes
        .iter()
        .map(|(code, count)| format!("{} x{count}", friendly_code_label(*code)))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "History for {slug} over {days} day(s): highs {hi_avg:.1}°C ({hi_min:.1}-{hi_max:.1}), \
         lows {lo_avg:.1}°C ({lo_min:.1}-{lo_max:.1}), humidity avg {hum:.0}%, wind avg {wind:.1} km/h, \
         {rainy} rainy day(s), dominant conditions: {codes}.{trend}",
        slug = slug,
        days = stats.days_analysed,
        hi_avg = stats.daily_high.average,
        hi_min = stats.daily_high.min,
        hi_max = stats.daily_high.max,
        lo_avg = stats.daily_low.average,
        lo_min = stats.daily_low.min,
        lo_max = stats.daily_low.max,
        hum = stats.humidity.average,
        wind = stats.wind_speed.average,
        rainy = stats.rainy_days,
        codes = codes,
        trend = stats.trend.as_ref().map(|t| format!(" Trend: {t}.")).unwrap_or_default(),
    )
}

/// 12 hex characters of SHA-256 over the ordered `(date, temperature_2m)`
/// sequence — content-addressing in place of the spec's MD5 wording, since
/// no md5/md-5 crate is available anywhere in the retrieved corpus.
fn content_hash(entries: &[Entry]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.recorded_at.to_rfc3339().as_bytes());
        hasher.update(format!("{:.2}", entry.temperature_2m).as_bytes());
    }
    let digest = hasher.finalize();
    hex::encode(digest)[..12].to_string()
}

#[tracing::instrument(level = "debug", skip(store, llm, breakers))]
pub async fn analyse(
    store: &dyn Store, llm: &dyn LlmClient, breakers: &BreakerRegistry, slug: &str, days: i64, activities: &[String],
) -> Result<HistoryAnalysis, HistoryError> {
    if !(1..=365).contains(&days) {
        return Err(HistoryError::InvalidRange);
    }

    if store.find_one("locations", Filter::new().eq("slug", slug)).await?.is_none() {
        return Err(HistoryError::LocationNotFound(slug.to_string()));
    }

    let since = Utc::now() - chrono::Duration::days(days);
    let filter = Filter::new().eq("locationSlug", slug).gte("recordedAt", since.to_rfc3339());
    let docs = store.find("weather_history", filter, Some("recordedAt"), false, FindOptions::default()).await?;

    let mut entries: Vec<Entry> = docs.iter().filter_map(parse_entry).collect();
    entries.sort_by_key(|e| e.recorded_at);

    let stats = compute_stats(&entries);
    let stats_text = stats_to_text(slug, &stats);
    let hash12 = content_hash(&entries);
    let cache_key = format!("{slug}:{days}:{hash12}");

    if let Some(cached) = lookup_cache(store, &cache_key).await? {
        return Ok(HistoryAnalysis { stats, narrative: cached, ai_available: true, cached: true });
    }

    let llm_open = breakers.get("llm").map(|b| !b.is_allowed()).unwrap_or(false);
    if !llm.is_configured() || llm_open || entries.is_empty() {
        return Ok(HistoryAnalysis {
            stats,
            narrative: format!("{stats_text} AI analysis is unavailable right now."),
            ai_available: false,
            cached: false,
        });
    }

    match generate_with_llm(llm, &stats_text, activities).await {
        Some(narrative) => {
            upsert_cache(store, &cache_key, &narrative).await?;
            Ok(HistoryAnalysis { stats, narrative, ai_available: true, cached: false })
        },
        None => Ok(HistoryAnalysis {
            stats,
            narrative: format!("{stats_text} AI analysis is unavailable right now."),
            ai_available: false,
            cached: false,
        }),
    }
}

/// `GET /history` (§6): raw `weather_history` documents, most recent first,
/// with no statistics computed — a thin read path distinct from `analyse`.
pub async fn list_raw(store: &dyn Store, slug: &str, days: i64) -> Result<Vec<serde_json::Value>, HistoryError> {
    if !(1..=365).contains(&days) {
        return Err(HistoryError::InvalidRange);
    }
    let since = Utc::now() - chrono::Duration::days(days);
    let filter = Filter::new().eq("locationSlug", slug).gte("recordedAt", since.to_rfc3339());
    let docs = store.find("weather_history", filter, Some("recordedAt"), true, FindOptions::default()).await?;
    Ok(docs)
}

async fn lookup_cache(store: &dyn Store, cache_key: &str) -> Result<Option<String>, HistoryError> {
    let Some(doc) = store.find_one("history_analyses", Filter::new().eq("cacheKey", cache_key)).await? else {
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
    Ok(doc.get("narrative").and_then(|v| v.as_str()).map(|s| s.to_string()))
}

async fn upsert_cache(store: &dyn Store, cache_key: &str, narrative: &str) -> Result<(), HistoryError> {
    let now = Utc::now();
    let update = Update::new()
        .set("cacheKey", cache_key)
        .set("narrative", narrative)
        .set("generatedAt", now.to_rfc3339())
        .set("expiresAt", (now + chrono::Duration::seconds(CACHE_TTL_SECS)).to_rfc3339());
    store.update_one("history_analyses", Filter::new().eq("cacheKey", cache_key), update, true).await?;
    Ok(())
}

async fn generate_with_llm(llm: &dyn LlmClient, stats_text: &str, activities: &[String]) -> Option<String> {
    let system = "You summarise multi-day weather history statistics for a general audience in 2-3 sentences.";
    let activities_note = if activities.is_empty() {
        String::new()
    } else {
        format!(" The reader cares about: {}.", activities.join(", "))
    };
    let user_message = format!("{stats_text}{activities_note}");
    let messages = [Message { role: "user".to_string(), content: user_message }];
    let response = llm.messages("claude-haiku", system, &messages, &[], 512).await.ok()?;
    response.content.into_iter().find_map(|block| match block {
        crate::llm::Block::Text { text } => Some(text),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn history_doc(slug: &str, days_ago: i64, temperature: f64, precipitation_sum: f64) -> serde_json::Value {
        let recorded_at = Utc::now() - chrono::Duration::days(days_ago);
        serde_json::json!({
            "locationSlug": slug,
            "recordedAt": recorded_at.to_rfc3339(),
            "current": {
                "temperature_2m": temperature,
                "relative_humidity_2m": 55.0,
                "apparent_temperature": temperature - 1.0,
                "precipitation": precipitation_sum,
                "weather_code": 0,
                "wind_speed_10m": 10.0,
                "wind_gusts_10m": 15.0,
                "surface_pressure": 1013.0,
                "cloud_cover": 20.0,
            },
            "daily": {"weather_code": 0, "temperature_2m_max": temperature + 3.0, "temperature_2m_min": temperature - 3.0, "precipitation_sum": precipitation_sum},
            "insights": null,
        })
    }

    #[tokio::test]
    async fn rejects_out_of_range_days() {
        let store = InMemoryStore::new();
        let llm = crate::llm::AnthropicClient::new("https://api.anthropic.com".parse().unwrap(), None).unwrap();
        let breakers = BreakerRegistry::default();
        let result = analyse(&store, &llm, &breakers, "harare", 400, &[]).await;
        assert!(matches!(result, Err(HistoryError::InvalidRange)));
    }

    #[tokio::test]
    async fn rejects_unknown_location() {
        let store = InMemoryStore::new();
        let llm = crate::llm::AnthropicClient::new("https://api.anthropic.com".parse().unwrap(), None).unwrap();
        let breakers = BreakerRegistry::default();
        let result = analyse(&store, &llm, &breakers, "nowhere", 7, &[]).await;
        assert!(matches!(result, Err(HistoryError::LocationNotFound(_))));
    }

    #[tokio::test]
    async fn analysis_never_errors_when_history_exists_and_llm_is_unconfigured() {
        let store = InMemoryStore::new();
        store.insert_one("locations", serde_json::json!({"slug": "harare", "name": "Harare"})).await.unwrap();
        for day in 0..5 {
            store.insert_one("weather_history", history_doc("harare", day, 22.0, 0.0)).await.unwrap();
        }
        let llm = crate::llm::AnthropicClient::new("https://api.anthropic.com".parse().unwrap(), None).unwrap();
        let breakers = BreakerRegistry::default();
        let analysis = analyse(&store, &llm, &breakers, "harare", 7, &[]).await.unwrap();
        assert!(!analysis.ai_available);
        assert!(analysis.narrative.contains("unavailable"));
        assert_eq!(analysis.stats.days_analysed, 5);
    }

    #[test]
    fn content_hash_changes_when_temperature_changes() {
        let base = history_doc("harare", 0, 22.0, 0.0);
        let changed = history_doc("harare", 0, 25.0, 0.0);
        let entries_a = vec![parse_entry(&base).unwrap()];
        let entries_b = vec![parse_entry(&changed).unwrap()];
        assert_ne!(content_hash(&entries_a), content_hash(&entries_b));
    }
}
