//! Windowed rate limiter (§4.8): an atomic findOneAndUpdate-backed counter
//! keyed on `"{action}:{identity}"`, relying on the store's TTL expiry for
//! window rotation rather than explicit key rotation.

use crate::store::{Filter, Store, Update};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("store failure: {0}")]
    Store(#[from] crate::store::StoreError),
}

#[derive(Debug, Clone)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub count: i64,
    pub max: i64,
    pub expires_at: DateTime<Utc>,
}

/// `check(identity, action, max, window)` from §4.8.
pub async fn check(store: &dyn Store, identity: &str, action: &str, max: i64, window: chrono::Duration) -> Result<RateLimitOutcome, RateLimitError> {
    let key = format!("{action}:{identity}");
    let now = Utc::now();

    let filter = Filter::new().eq("key", &key).gte("expiresAt", now.to_rfc3339());
    let update = Update::new().inc("count", 1).set_on_insert("key", &key).set_on_insert("expiresAt", (now + window).to_rfc3339());

    let doc = store.find_one_and_update("rate_limits", filter, update, true).await?;

    let count = doc.as_ref().and_then(|d| d.get("count")).and_then(|v| v.as_i64()).unwrap_or(1);
    let expires_at = doc
        .as_ref()
        .and_then(|d| d.get("expiresAt"))
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now + window);

    Ok(RateLimitOutcome { allowed: count <= max, count, max, expires_at })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn first_request_in_window_is_allowed() {
        let store = InMemoryStore::new();
        let outcome = check(&store, "abc123", "chat", 5, chrono::Duration::seconds(60)).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.count, 1);
    }

    #[tokio::test]
    async fn exceeding_max_is_not_allowed() {
        let store = InMemoryStore::new();
        for _ in 0..5 {
            check(&store, "abc123", "chat", 5, chrono::Duration::seconds(60)).await.unwrap();
        }
        let outcome = check(&store, "abc123", "chat", 5, chrono::Duration::seconds(60)).await.unwrap();
        assert!(!outcome.allowed);
        assert_eq!(outcome.count, 6);
    }

    #[tokio::test]
    async fn distinct_identities_do_not_share_a_bucket() {
        let store = InMemoryStore::new();
        let a = check(&store, "aaa", "chat", 1, chrono::Duration::seconds(60)).await.unwrap();
        let b = check(&store, "bbb", "chat", 1, chrono::Duration::seconds(60)).await.unwrap();
        assert!(a.allowed);
        assert!(b.allowed);
    }
}
