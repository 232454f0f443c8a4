//! Prompt template library (component D).
//!
//! A 5-minute single-writer racy cache over `PromptTemplate` documents, per
//! spec §9's "dict-keyed caches → typed maps" note: readers may observe a
//! slightly stale value while a refresh is in flight, which is acceptable.

use crate::store::{Filter, Store};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptTemplate {
    pub prompt_key: String,
    pub template: String,
    pub model: String,
    pub max_tokens: u32,
    pub active: bool,
    pub order: i32,
}

struct CacheEntry {
    template: PromptTemplate,
    inserted_at: Instant,
}

pub struct PromptLibrary {
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl PromptLibrary {
    pub fn new() -> Self {
        Self { cache: Mutex::new(HashMap::new()) }
    }

    /// Fetches a template by key, falling back to a built-in default when
    /// the store has none active — §4.3 step 4's "fetch the `system:summary`
    /// prompt template (falling back to a built-in template if unavailable)".
    #[tracing::instrument(level = "debug", skip(self, store))]
    pub async fn get(&self, store: &dyn Store, prompt_key: &str) -> PromptTemplate {
        if let Some(cached) = self.cached(prompt_key) {
            return cached;
        }

        let filter = Filter::new().eq("promptKey", prompt_key).eq("active", true);
        let fetched = store
            .find_one("prompt_templates", filter)
            .await
            .ok()
            .flatten()
            .and_then(|doc| serde_json::from_value::<PromptTemplate>(doc).ok());

        let template = fetched.unwrap_or_else(|| built_in_template(prompt_key));
        self.insert(prompt_key, template.clone());
        template
    }

    fn cached(&self, prompt_key: &str) -> Option<PromptTemplate> {
        let cache = self.cache.lock().expect("prompt cache mutex poisoned");
        cache.get(prompt_key).filter(|entry| entry.inserted_at.elapsed() < CACHE_TTL).map(|entry| entry.template.clone())
    }

    fn insert(&self, prompt_key: &str, template: PromptTemplate) {
        let mut cache = self.cache.lock().expect("prompt cache mutex poisoned");
        cache.insert(prompt_key.to_string(), CacheEntry { template, inserted_at: Instant::now() });
    }
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self::new()
    }
}

fn built_in_template(prompt_key: &str) -> PromptTemplate {
    let template = match prompt_key {
        "system:summary" => {
            "You are a concise weather briefing assistant for {name}. Current conditions: \
             {temperature}°C, {humidity}% humidity, code {weather_code}. Tags: {tags}. \
             Activities of interest: {activities}. Write 2-3 short sentences."
        },
        "system:chat" => {
            "You are a helpful weather assistant with access to tools for searching \
             locations and fetching weather. Be concise."
        },
        _ => "You are a helpful assistant.",
    };

    PromptTemplate {
        prompt_key: prompt_key.to_string(),
        template: template.to_string(),
        model: "claude-haiku".to_string(),
        max_tokens: 512,
        active: true,
        order: 0,
    }
}

/// Substitutes `{placeholder}` tokens with values from `values`; unmatched
/// placeholders are left verbatim.
pub fn render(template: &str, values: &HashMap<&str, String>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in values {
        rendered = rendered.replace(&format!("{{{key}}}"), value);
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn falls_back_to_built_in_when_store_has_no_active_template() {
        let store = InMemoryStore::new();
        let library = PromptLibrary::new();
        let template = library.get(&store, "system:summary").await;
        assert!(template.template.contains("{name}"));
    }

    #[test]
    fn render_substitutes_known_placeholders_and_leaves_others() {
        let mut values = HashMap::new();
        values.insert("name", "Harare".to_string());
        let rendered = render("Hello {name}, today is {unknown}", &values);
        assert_eq!(rendered, "Hello Harare, today is {unknown}");
    }
}
