//! Tool-using chat orchestrator (§4.4) and its single-turn explore-search
//! variant (§B).

use crate::breaker::BreakerRegistry;
use crate::llm::{Block, LlmClient, LlmError, Message, StopReason, ToolSpec};
use crate::store::{Filter, Store};
use crate::suitability::{self, SuitabilityRule};
use crate::weather::NormalisedWeather;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub const MAX_TOOL_ITERATIONS: u32 = 5;
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(15);
const MESSAGE_MAX_LEN: usize = 2000;
const HISTORY_MAX_TURNS: usize = 10;
const ACTIVITIES_MAX: usize = 20;
const ACTIVITY_ADVICE_CAP: usize = 10;
const REFERENCES_MAX: usize = 5;
const TAG_WHITELIST: &[&str] = &["farming", "mining", "education", "border", "tourism", "urban"];

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("rate limit exceeded")]
    RateLimited,

    #[error("store failure: {0}")]
    Store(#[from] crate::store::StoreError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
    #[serde(default)]
    pub activities: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    Location,
    Weather,
}

#[derive(Debug, Clone, Serialize)]
pub struct Reference {
    pub slug: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ReferenceType,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub message: String,
    pub references: Vec<Reference>,
}

struct RequestCaches {
    weather: HashMap<String, NormalisedWeather>,
    rules: HashMap<String, Option<SuitabilityRule>>,
}

impl RequestCaches {
    fn new() -> Self {
        Self { weather: HashMap::new(), rules: HashMap::new() }
    }
}

fn sanitize_request(mut request: ChatRequest) -> ChatRequest {
    request.message.truncate(MESSAGE_MAX_LEN);
    let skip = request.history.len().saturating_sub(HISTORY_MAX_TURNS);
    request.history = request
        .history
        .into_iter()
        .skip(skip)
        .map(|mut turn| {
            turn.content.truncate(MESSAGE_MAX_LEN);
            turn
        })
        .collect();
    request.activities.truncate(ACTIVITIES_MAX);
    request
}

fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "search_locations".into(),
            description: "Search for locations by free-text query.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"],
            }),
        },
        ToolSpec {
            name: "get_weather".into(),
            description: "Get the cached normalised weather for a location slug.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"location_slug": {"type": "string"}},
                "required": ["location_slug"],
            }),
        },
        ToolSpec {
            name: "get_activity_advice".into(),
            description: "Get suitability ratings for activities at a location.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "location_slug": {"type": "string"},
                    "activities": {"type": "array", "items": {"type": "string"}},
                },
                "required": ["location_slug", "activities"],
            }),
        },
        ToolSpec {
            name: "list_locations_by_tag".into(),
            description: "List locations carrying a given tag.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {"tag": {"type": "string"}},
                "required": ["tag"],
            }),
        },
    ]
}

#[tracing::instrument(level = "debug", skip(store, llm, breakers, request))]
pub async fn run_chat(
    store: &dyn Store, llm: &dyn LlmClient, breakers: &BreakerRegistry, request: ChatRequest,
) -> Result<ChatResponse, ChatError> {
    let request = sanitize_request(request);
    let mut caches = RequestCaches::new();
    let mut references: Vec<Reference> = Vec::new();

    let mut messages: Vec<Message> = request
        .history
        .iter()
        .map(|turn| Message { role: turn.role.clone(), content: turn.content.clone() })
        .collect();
    messages.push(Message { role: "user".to_string(), content: request.message });

    let system = "You are a helpful weather assistant with access to tools for searching locations \
                  and fetching weather. Be concise."
        .to_string();
    let tools = tool_specs();

    for _ in 0..MAX_TOOL_ITERATIONS {
        let Some(breaker) = breakers.get("llm") else {
            return Ok(soft_error("the assistant is temporarily unavailable", references));
        };

        let call = breaker.execute(llm.messages("claude-haiku", &system, &messages, &tools, 1024)).await;

        let response = match call {
            Err(_breaker_open_or_timeout) => {
                return Ok(soft_error("the assistant is temporarily unavailable", references));
            },
            Ok(Err(LlmError::RateLimited)) => return Err(ChatError::RateLimited),
            Ok(Err(_other)) => {
                return Ok(soft_error("the assistant is temporarily unavailable", references));
            },
            Ok(Ok(response)) => response,
        };

        if response.stop_reason != StopReason::ToolUse {
            let text = concatenate_text(&response.content);
            return Ok(ChatResponse { message: text, references: dedup_references(references) });
        }

        let tool_uses: Vec<(String, String, serde_json::Value)> = response
            .content
            .iter()
            .filter_map(|block| match block {
                Block::ToolUse { id, name, input } => Some((id.clone(), name.clone(), input.clone())),
                _ => None,
            })
            .collect();

        let assistant_summary = concatenate_text(&response.content);
        messages.push(Message { role: "assistant".to_string(), content: assistant_summary });

        let results = join_all(tool_uses.iter().map(|(id, name, input)| {
            execute_tool(store, &mut caches, id, name, input.clone(), &request.activities)
        }))
        .await;

        for (outcome, (_, name, _)) in results.iter().zip(tool_uses.iter()) {
            collect_references(name, outcome, &mut references);
        }

        let tool_results_json = serde_json::to_string(&results).unwrap_or_default();
        messages.push(Message { role: "user".to_string(), content: tool_results_json });
    }

    Ok(ChatResponse {
        message: "That request needs more steps than I can take right now — try narrowing it down."
            .to_string(),
        references: dedup_references(references),
    })
}

fn soft_error(message: &str, references: Vec<Reference>) -> ChatResponse {
    ChatResponse { message: message.to_string(), references: dedup_references(references) }
}

fn concatenate_text(blocks: &[Block]) -> String {
    blocks
        .iter()
        .filter_map(|block| match block {
            Block::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

async fn execute_tool(
    store: &dyn Store, caches: &mut RequestCaches, _id: &str, name: &str, input: serde_json::Value,
    request_activities: &[String],
) -> serde_json::Value {
    let outcome = match tokio::time::timeout(TOOL_TIMEOUT, dispatch_tool(store, caches, name, &input, request_activities)).await
    {
        Ok(value) => value,
        Err(_elapsed) => serde_json::json!({"error": "tool call timed out"}),
    };
    outcome
}

async fn dispatch_tool(
    store: &dyn Store, caches: &mut RequestCaches, name: &str, input: &serde_json::Value,
    request_activities: &[String],
) -> serde_json::Value {
    match name {
        "search_locations" => {
            let query = input.get("query").and_then(|v| v.as_str()).unwrap_or_default();
            let matches = crate::geo::search_locations(store, query, 10).await;
            serde_json::json!({"locations": matches})
        },
        "get_weather" => {
            let slug = input.get("location_slug").and_then(|v| v.as_str()).unwrap_or_default();
            if slug.is_empty() {
                return serde_json::json!({"error": "location_slug is required"});
            }
            if let Some(cached) = caches.weather.get(slug) {
                return serde_json::json!({"slug": slug, "current": cached.current});
            }
            match fetch_fresh_cache(store, slug).await {
                Some(weather) => {
                    let projection = serde_json::json!({"slug": slug, "current": weather.current});
                    caches.weather.insert(slug.to_string(), weather);
                    projection
                },
                None => serde_json::json!({"error": "no fresh weather cache entry for this location"}),
            }
        },
        "get_activity_advice" => {
            let slug = input.get("location_slug").and_then(|v| v.as_str()).unwrap_or_default();
            let mut activities: Vec<String> = input
                .get("activities")
                .and_then(|v| v.as_array())
                .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_else(|| request_activities.to_vec());
            activities.truncate(ACTIVITY_ADVICE_CAP);

            let Some(weather) = (match caches.weather.get(slug) {
                Some(w) => Some(w.clone()),
                None => fetch_fresh_cache(store, slug).await,
            }) else {
                return serde_json::json!({"error": "no fresh weather cache entry for this location"});
            };
            caches.weather.entry(slug.to_string()).or_insert_with(|| weather.clone());

            let insights = weather.insights.clone().unwrap_or_default();
            let mut ratings = Vec::new();
            for activity_id in &activities {
                let rule = match caches.rules.get(activity_id) {
                    Some(rule) => rule.clone(),
                    None => {
                        let category = suitability::lookup_activity(store, activity_id).await.ok().flatten().map(|activity| activity.category);
                        let rule = suitability::load_rule(store, activity_id, category.as_deref()).await.ok().flatten();
                        caches.rules.insert(activity_id.clone(), rule.clone());
                        rule
                    },
                };
                ratings.push(suitability::evaluate(rule.as_ref(), &insights));
            }
            serde_json::json!({"slug": slug, "ratings": ratings})
        },
        "list_locations_by_tag" => {
            let tag = input.get("tag").and_then(|v| v.as_str()).unwrap_or_default();
            if !TAG_WHITELIST.contains(&tag) {
                return serde_json::json!({"error": format!("unknown tag '{tag}'")});
            }
            let locations = crate::geo::list_by_tag(store, tag, 20).await;
            serde_json::json!({"locations": locations})
        },
        other => serde_json::json!({"error": format!("unknown tool '{other}'")}),
    }
}

async fn fetch_fresh_cache(store: &dyn Store, slug: &str) -> Option<NormalisedWeather> {
    let doc = store.find_one("weather_cache", Filter::new().eq("locationSlug", slug)).await.ok()??;
    let expires_at = doc
        .get("expiresAt")
        .and_then(|v| v.as_str())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())?;
    if expires_at.with_timezone(&chrono::Utc) <= chrono::Utc::now() {
        return None;
    }
    serde_json::from_value(doc.get("data")?.clone()).ok()
}

/// Reference extraction (§4.4): `search_locations`/`list_locations_by_tag`
/// contribute `location` references; `get_weather` contributes `weather`.
fn collect_references(tool_name: &str, outcome: &serde_json::Value, references: &mut Vec<Reference>) {
    match tool_name {
        "search_locations" | "list_locations_by_tag" => {
            if let Some(locations) = outcome.get("locations").and_then(|v| v.as_array()) {
                for location in locations {
                    if let (Some(slug), Some(name)) = (
                        location.get("slug").and_then(|v| v.as_str()),
                        location.get("name").and_then(|v| v.as_str()),
                    ) {
                        references.push(Reference {
                            slug: slug.to_string(),
                            name: name.to_string(),
                            kind: ReferenceType::Location,
                        });
                    }
                }
            }
        },
        "get_weather" => {
            if let Some(slug) = outcome.get("slug").and_then(|v| v.as_str()) {
                references.push(Reference { slug: slug.to_string(), name: slug.to_string(), kind: ReferenceType::Weather });
            }
        },
        _ => {},
    }
}

/// Dedup by slug, preferring `location` over `weather`, capped at 5.
fn dedup_references(references: Vec<Reference>) -> Vec<Reference> {
    let mut by_slug: HashMap<String, Reference> = HashMap::new();
    for reference in references {
        by_slug
            .entry(reference.slug.clone())
            .and_modify(|existing| {
                if existing.kind == ReferenceType::Weather && reference.kind == ReferenceType::Location {
                    *existing = reference.clone();
                }
            })
            .or_insert(reference);
    }
    let mut deduped: Vec<Reference> = by_slug.into_values().collect();
    deduped.sort_by(|a, b| a.slug.cmp(&b.slug));
    deduped.truncate(REFERENCES_MAX);
    deduped
}

/// Single-turn variant used by `POST /explore/search` (§B): a lighter loop
/// with a smaller toolset, no conversation history, and a substring-search
/// fallback when the LLM is unavailable.
pub async fn explore_search(
    store: &dyn Store, llm: &dyn LlmClient, breakers: &BreakerRegistry, query: &str,
) -> ChatResponse {
    const EXPLORE_MAX_ITERATIONS: u32 = 3;

    let llm_open = breakers.get("llm").map(|b| !b.is_allowed()).unwrap_or(true);
    if !llm.is_configured() || llm_open {
        let matches = crate::geo::search_locations(store, query, 10).await;
        let references = matches
            .into_iter()
            .map(|location| Reference { slug: location.slug, name: location.name, kind: ReferenceType::Location })
            .collect();
        return ChatResponse {
            message: "Here is what I found by name.".to_string(),
            references: dedup_references(references),
        };
    }

    let request = ChatRequest { message: query.to_string(), history: Vec::new(), activities: Vec::new() };
    let mut caches = RequestCaches::new();
    let mut references = Vec::new();
    let system = "Help the user find a location and its current weather in one turn.".to_string();
    let tools = tool_specs();
    let mut messages = vec![Message { role: "user".to_string(), content: request.message.clone() }];

    for _ in 0..EXPLORE_MAX_ITERATIONS {
        let Some(breaker) = breakers.get("llm") else { break };
        let Ok(Ok(response)) = breaker.execute(llm.messages("claude-haiku", &system, &messages, &tools, 512)).await
        else {
            break;
        };

        if response.stop_reason != StopReason::ToolUse {
            return ChatResponse { message: concatenate_text(&response.content), references: dedup_references(references) };
        }

        let tool_uses: Vec<(String, String, serde_json::Value)> = response
            .content
            .iter()
            .filter_map(|block| match block {
                Block::ToolUse { id, name, input } => Some((id.clone(), name.clone(), input.clone())),
                _ => None,
            })
            .collect();
        messages.push(Message { role: "assistant".to_string(), content: concatenate_text(&response.content) });

        let results = join_all(
            tool_uses.iter().map(|(id, name, input)| execute_tool(store, &mut caches, id, name, input.clone(), &[])),
        )
        .await;
        for (outcome, (_, name, _)) in results.iter().zip(tool_uses.iter()) {
            collect_references(name, outcome, &mut references);
        }
        messages.push(Message { role: "user".to_string(), content: serde_json::to_string(&results).unwrap_or_default() });
    }

    ChatResponse {
        message: "I could not finish that search in time.".to_string(),
        references: dedup_references(references),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_prefers_location_over_weather_for_same_slug() {
        let references = vec![
            Reference { slug: "harare".into(), name: "Harare".into(), kind: ReferenceType::Weather },
            Reference { slug: "harare".into(), name: "Harare".into(), kind: ReferenceType::Location },
        ];
        let deduped = dedup_references(references);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].kind, ReferenceType::Location);
    }

    #[test]
    fn dedup_truncates_to_five() {
        let references: Vec<_> = (0..8)
            .map(|i| Reference { slug: format!("slug{i}"), name: format!("name{i}"), kind: ReferenceType::Location })
            .collect();
        assert_eq!(dedup_references(references).len(), 5);
    }

    #[test]
    fn sanitize_truncates_history_to_last_ten_turns() {
        let history: Vec<_> =
            (0..15).map(|i| ChatTurn { role: "user".into(), content: format!("turn {i}") }).collect();
        let request = ChatRequest { message: "hi".into(), history, activities: vec![] };
        let sanitized = sanitize_request(request);
        assert_eq!(sanitized.history.len(), 10);
        assert_eq!(sanitized.history[0].content, "turn 5");
    }

    #[test]
    fn sanitize_truncates_activities_to_twenty() {
        let request = ChatRequest {
            message: "hi".into(),
            history: vec![],
            activities: (0..30).map(|i| format!("activity-{i}")).collect(),
        };
        assert_eq!(sanitize_request(request).activities.len(), 20);
    }
}
