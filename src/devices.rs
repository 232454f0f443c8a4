//! Device profile CRUD (component B): idempotent create-by-deviceId,
//! fetch, and last-write-wins preference updates.

use crate::store::{Filter, Store, Update};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const VALID_THEMES: &[&str] = &["light", "dark", "system"];
const MAX_ACTIVITIES: usize = 30;
const MAX_SAVED_LOCATIONS: usize = 10;

fn is_valid_slug_shape(slug: &str) -> bool {
    !slug.is_empty() && slug.len() <= 80 && slug.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("store failure: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("invalid theme: {0}")]
    InvalidTheme(String),

    #[error("invalid location slug: {0}")]
    InvalidSlug(String),

    #[error("too many activities (max 30)")]
    TooManyActivities,

    #[error("too many saved locations (max 10)")]
    TooManySavedLocations,

    #[error("device profile not found")]
    NotFound,

    #[error("no fields to update")]
    NoFieldsToUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    #[serde(default = "default_theme")]
    pub theme: String,
    #[serde(default = "default_location")]
    pub selected_location: String,
    #[serde(default)]
    pub saved_locations: Vec<String>,
    #[serde(default)]
    pub selected_activities: Vec<String>,
    #[serde(default)]
    pub has_onboarded: bool,
}

fn default_theme() -> String {
    "system".to_string()
}
fn default_location() -> String {
    "harare".to_string()
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            theme: default_theme(),
            selected_location: default_location(),
            saved_locations: Vec::new(),
            selected_activities: Vec::new(),
            has_onboarded: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeviceRequest {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub preferences: Preferences,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePreferencesRequest {
    pub theme: Option<String>,
    pub selected_location: Option<String>,
    pub saved_locations: Option<Vec<String>>,
    pub selected_activities: Option<Vec<String>>,
    pub has_onboarded: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    pub device_id: String,
    pub preferences: Preferences,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn validate_theme(theme: &str) -> Result<(), DeviceError> {
    if VALID_THEMES.contains(&theme) {
        Ok(())
    } else {
        Err(DeviceError::InvalidTheme(theme.to_string()))
    }
}

fn validate_slug(slug: &str) -> Result<(), DeviceError> {
    if is_valid_slug_shape(slug) {
        Ok(())
    } else {
        Err(DeviceError::InvalidSlug(slug.to_string()))
    }
}

fn validate_saved_locations(locations: &[String]) -> Result<(), DeviceError> {
    if locations.len() > MAX_SAVED_LOCATIONS {
        return Err(DeviceError::TooManySavedLocations);
    }
    locations.iter().try_for_each(|slug| validate_slug(slug))
}

fn validate_activities(activities: &[String]) -> Result<(), DeviceError> {
    if activities.len() > MAX_ACTIVITIES {
        Err(DeviceError::TooManyActivities)
    } else {
        Ok(())
    }
}

fn doc_to_profile(doc: serde_json::Value) -> Result<DeviceProfile, DeviceError> {
    serde_json::from_value(doc).map_err(|_| DeviceError::NotFound)
}

/// Idempotent create: a pre-existing `deviceId` returns the existing
/// profile rather than erroring, since devices may retry the call.
#[tracing::instrument(level = "debug", skip(store, request))]
pub async fn create(store: &dyn Store, request: CreateDeviceRequest) -> Result<DeviceProfile, DeviceError> {
    validate_theme(&request.preferences.theme)?;
    validate_slug(&request.preferences.selected_location)?;
    validate_saved_locations(&request.preferences.saved_locations)?;
    validate_activities(&request.preferences.selected_activities)?;

    let device_id = request.device_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    if let Some(existing) = store.find_one("device_profiles", Filter::new().eq("deviceId", &device_id)).await? {
        return doc_to_profile(existing);
    }

    let now = Utc::now();
    let doc = serde_json::json!({
        "deviceId": device_id,
        "preferences": request.preferences,
        "createdAt": now,
        "updatedAt": now,
    });
    store.insert_one("device_profiles", doc.clone()).await?;
    doc_to_profile(doc)
}

pub async fn get(store: &dyn Store, device_id: &str) -> Result<DeviceProfile, DeviceError> {
    let doc = store.find_one("device_profiles", Filter::new().eq("deviceId", device_id)).await?.ok_or(DeviceError::NotFound)?;
    doc_to_profile(doc)
}

/// Last-write-wins: `savedLocations`/`selectedActivities` are replaced
/// wholesale, not merged, matching the original service's documented
/// multi-device sync behaviour.
#[tracing::instrument(level = "debug", skip(store, request))]
pub async fn update_preferences(store: &dyn Store, device_id: &str, request: UpdatePreferencesRequest) -> Result<DeviceProfile, DeviceError> {
    let touched = request.theme.is_some()
        || request.selected_location.is_some()
        || request.saved_locations.is_some()
        || request.selected_activities.is_some()
        || request.has_onboarded.is_some();
    if !touched {
        return Err(DeviceError::NoFieldsToUpdate);
    }

    let existing = get(store, device_id).await?;
    let mut preferences = existing.preferences;

    if let Some(theme) = &request.theme {
        validate_theme(theme)?;
        preferences.theme = theme.clone();
    }
    if let Some(location) = &request.selected_location {
        validate_slug(location)?;
        preferences.selected_location = location.clone();
    }
    if let Some(saved) = &request.saved_locations {
        validate_saved_locations(saved)?;
        preferences.saved_locations = saved.clone();
    }
    if let Some(activities) = &request.selected_activities {
        validate_activities(activities)?;
        preferences.selected_activities = activities.clone();
    }
    if let Some(has_onboarded) = request.has_onboarded {
        preferences.has_onboarded = has_onboarded;
    }

    let update = Update::new()
        .set("preferences", serde_json::to_value(&preferences).unwrap_or_default())
        .set("updatedAt", Utc::now().to_rfc3339());

    let doc = store
        .find_one_and_update("device_profiles", Filter::new().eq("deviceId", device_id), update, false)
        .await?
        .ok_or(DeviceError::NotFound)?;
    doc_to_profile(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn create_with_explicit_device_id_is_idempotent() {
        let store = InMemoryStore::new();
        let request = CreateDeviceRequest { device_id: Some("device-1".to_string()), preferences: Preferences::default() };
        let first = create(&store, request.clone_for_test()).await.unwrap();
        let second = create(&store, request).await.unwrap();
        assert_eq!(first.device_id, second.device_id);
    }

    #[tokio::test]
    async fn invalid_theme_is_rejected() {
        let store = InMemoryStore::new();
        let mut preferences = Preferences::default();
        preferences.theme = "neon".to_string();
        let request = CreateDeviceRequest { device_id: None, preferences };
        let result = create(&store, request).await;
        assert!(matches!(result, Err(DeviceError::InvalidTheme(_))));
    }

    #[tokio::test]
    async fn update_replaces_saved_locations_wholesale() {
        let store = InMemoryStore::new();
        let created = create(&store, CreateDeviceRequest { device_id: Some("device-2".to_string()), preferences: Preferences::default() })
            .await
            .unwrap();

        let update = UpdatePreferencesRequest { saved_locations: Some(vec!["bulawayo".to_string()]), ..Default::default() };
        let updated = update_preferences(&store, &created.device_id, update).await.unwrap();
        assert_eq!(updated.preferences.saved_locations, vec!["bulawayo".to_string()]);
    }

    #[tokio::test]
    async fn update_with_no_fields_is_rejected() {
        let store = InMemoryStore::new();
        let created = create(&store, CreateDeviceRequest { device_id: Some("device-3".to_string()), preferences: Preferences::default() })
            .await
            .unwrap();
        let result = update_preferences(&store, &created.device_id, UpdatePreferencesRequest::default()).await;
        assert!(matches!(result, Err(DeviceError::NoFieldsToUpdate)));
    }

    impl CreateDeviceRequest {
        fn clone_for_test(&self) -> Self {
            Self { device_id: self.device_id.clone(), preferences: self.preferences.clone() }
        }
    }
}
