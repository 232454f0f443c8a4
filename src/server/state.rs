use crate::breaker::BreakerRegistry;
use crate::config::{ActionRateLimits, Settings};
use crate::geo::{Geocoder, HttpGeocoder};
use crate::llm::{AnthropicClient, LlmClient};
use crate::maptiles::TileProxy;
use crate::prompts::PromptLibrary;
use crate::server::errors::ApiError;
use crate::store::{InMemoryStore, Store};
use crate::weather::{breaker_registry_from_config, OpenMeteoProvider, TomorrowProvider};
use std::fmt;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub llm: Arc<dyn LlmClient>,
    pub tomorrow: Arc<TomorrowProvider>,
    pub open_meteo: Arc<OpenMeteoProvider>,
    pub geocoder: Arc<dyn Geocoder>,
    pub tiles: Arc<TileProxy>,
    pub breakers: Arc<BreakerRegistry>,
    pub prompts: Arc<PromptLibrary>,
    pub action_rate_limits: Arc<ActionRateLimits>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish()
    }
}

fn parse_url(raw: &str, field: &str) -> Result<url::Url, ApiError> {
    raw.parse().map_err(|_| ApiError::BadRequest(format!("invalid {field}: {raw}")))
}

#[tracing::instrument(level = "trace", skip(settings))]
pub async fn initialize_app_state(settings: &Settings) -> Result<AppState, ApiError> {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());

    let llm: Arc<dyn LlmClient> = Arc::new(AnthropicClient::new(
        parse_url(&settings.llm.base_url, "llm.base_url")?,
        settings.llm.api_key.clone(),
    )?);

    let tomorrow = Arc::new(TomorrowProvider::new(
        parse_url(&settings.providers.tomorrow_base_url, "providers.tomorrow_base_url")?,
        settings.providers.tomorrow_api_key.clone(),
    )?);
    let open_meteo =
        Arc::new(OpenMeteoProvider::new(parse_url(&settings.providers.open_meteo_base_url, "providers.open_meteo_base_url")?)?);

    let geocoder: Arc<dyn Geocoder> = Arc::new(HttpGeocoder::new(
        parse_url(&settings.geocoding.nominatim_base_url, "geocoding.nominatim_base_url")?,
        parse_url(&settings.geocoding.open_meteo_geocoding_base_url, "geocoding.open_meteo_geocoding_base_url")?,
    ));

    let tiles = Arc::new(TileProxy::new(
        parse_url(&settings.maptiles.origin, "maptiles.origin")?,
        settings.maptiles.api_key.clone(),
    ));

    let breakers = Arc::new(breaker_registry_from_config(&settings.breakers));
    let prompts = Arc::new(PromptLibrary::new());

    Ok(AppState {
        store,
        llm,
        tomorrow,
        open_meteo,
        geocoder,
        tiles,
        breakers,
        prompts,
        action_rate_limits: Arc::new(settings.action_rate_limits.clone()),
    })
}
