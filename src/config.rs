//! Layered application settings.
//!
//! Replaces the teacher's private `settings_loader` crate (unfetchable from
//! this workspace) with a direct `config`-crate layering: built-in defaults,
//! an optional `config/{base,environment}.yaml` file pair, then environment
//! variable overrides prefixed `WEATHER_CORE`.

use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use secrecy::Secret;
use serde::Deserialize;
use std::time::Duration;

pub const APP_ENVIRONMENT_ENV_VAR: &str = "WEATHER_CORE_ENVIRONMENT";

#[derive(Parser, Debug, Clone)]
#[command(name = "weather-core-server", about = "Weather intelligence API")]
pub struct CliOptions {
    /// Path to the configuration directory (defaults to `./config`).
    #[arg(short, long)]
    pub config_dir: Option<std::path::PathBuf>,

    /// Optional path to a secrets file layered on top of the base config.
    #[arg(short, long)]
    pub secrets: Option<std::path::PathBuf>,
}

impl CliOptions {
    pub const fn env_app_environment() -> &'static str {
        APP_ENVIRONMENT_ENV_VAR
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub http: HttpSettings,
    pub store: StoreSettings,
    pub providers: ProviderSettings,
    pub geocoding: GeocodingSettings,
    pub maptiles: MapTileSettings,
    pub llm: LlmSettings,
    pub breakers: BreakerSettings,
    pub action_rate_limits: ActionRateLimits,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSettings {
    pub host: String,
    pub port: u16,
    #[serde(with = "humantime_serde_secs")]
    pub timeout: Duration,
    pub api_prefix: String,
    pub rate_limit: RateLimitSettings,
}

impl HttpSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    pub burst_size: u32,
    #[serde(with = "humantime_serde_secs")]
    pub per_duration: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    pub connection_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    pub tomorrow_api_key: Option<Secret<String>>,
    pub open_meteo_base_url: String,
    pub tomorrow_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeocodingSettings {
    pub nominatim_base_url: String,
    pub open_meteo_geocoding_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MapTileSettings {
    pub origin: String,
    pub api_key: Option<Secret<String>>,
}

/// Per-action request caps (§4.8), distinct from `http.rate_limit`'s
/// coarse per-IP HTTP-layer burst limiter — these gate individual
/// expensive operations (LLM calls, location creation) per client identity.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionRateLimits {
    pub chat: ActionRateLimit,
    pub ai_followup: ActionRateLimit,
    pub explore_search: ActionRateLimit,
    pub history_analyze: ActionRateLimit,
    pub report_submit: ActionRateLimit,
    pub report_clarify: ActionRateLimit,
    pub location_create: ActionRateLimit,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ActionRateLimit {
    pub max: u32,
    #[serde(with = "humantime_serde_secs")]
    pub window: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmSettings {
    pub api_key: Option<Secret<String>>,
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSettings {
    pub tomorrow: BreakerConfig,
    pub open_meteo: BreakerConfig,
    pub llm: BreakerConfig,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "humantime_serde_secs")]
    pub cool_down: Duration,
    #[serde(with = "humantime_serde_secs")]
    pub window: Duration,
    #[serde(with = "humantime_serde_secs")]
    pub timeout: Duration,
}

impl Settings {
    pub fn load(options: &CliOptions) -> Result<Self, ConfigError> {
        let config_dir = options
            .config_dir
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("config"));
        let environment = std::env::var(APP_ENVIRONMENT_ENV_VAR).unwrap_or_else(|_| "local".into());

        let mut builder = Config::builder()
            .set_default("http.host", "0.0.0.0")?
            .set_default("http.port", 8080)?
            .set_default("http.timeout", "30s")?
            .set_default("http.api_prefix", "/api/v1")?
            .set_default("http.rate_limit.burst_size", 30)?
            .set_default("http.rate_limit.per_duration", "60s")?
            .set_default("providers.open_meteo_base_url", "https://api.open-meteo.com")?
            .set_default("providers.tomorrow_base_url", "https://api.tomorrow.io")?
            .set_default("geocoding.nominatim_base_url", "https://nominatim.openstreetmap.org")?
            .set_default("geocoding.open_meteo_geocoding_base_url", "https://geocoding-api.open-meteo.com/v1")?
            .set_default("maptiles.origin", "https://api.tomorrow.io")?
            .set_default("llm.base_url", "https://api.anthropic.com")?
            .set_default("llm.model", "claude-haiku")?
            .set_default("action_rate_limits.chat.max", 20)?
            .set_default("action_rate_limits.chat.window", "3600s")?
            .set_default("action_rate_limits.ai_followup.max", 30)?
            .set_default("action_rate_limits.ai_followup.window", "3600s")?
            .set_default("action_rate_limits.explore_search.max", 15)?
            .set_default("action_rate_limits.explore_search.window", "3600s")?
            .set_default("action_rate_limits.history_analyze.max", 10)?
            .set_default("action_rate_limits.history_analyze.window", "3600s")?
            .set_default("action_rate_limits.report_submit.max", 5)?
            .set_default("action_rate_limits.report_submit.window", "3600s")?
            .set_default("action_rate_limits.report_clarify.max", 10)?
            .set_default("action_rate_limits.report_clarify.window", "3600s")?
            .set_default("action_rate_limits.location_create.max", 5)?
            .set_default("action_rate_limits.location_create.window", "3600s")?
            .set_default("breakers.tomorrow.failure_threshold", 3)?
            .set_default("breakers.tomorrow.cool_down", "120s")?
            .set_default("breakers.tomorrow.window", "300s")?
            .set_default("breakers.tomorrow.timeout", "5s")?
            .set_default("breakers.open_meteo.failure_threshold", 5)?
            .set_default("breakers.open_meteo.cool_down", "300s")?
            .set_default("breakers.open_meteo.window", "300s")?
            .set_default("breakers.open_meteo.timeout", "8s")?
            .set_default("breakers.llm.failure_threshold", 3)?
            .set_default("breakers.llm.cool_down", "300s")?
            .set_default("breakers.llm.window", "600s")?
            .set_default("breakers.llm.timeout", "15s")?
            .add_source(File::from(config_dir.join("base")).required(false))
            .add_source(File::from(config_dir.join(&environment)).required(false));

        if let Some(secrets_path) = options.secrets.as_ref() {
            builder = builder.add_source(File::from(secrets_path.clone()).required(false));
        }

        let config = builder.add_source(Environment::with_prefix("WEATHER_CORE").separator("__")).build()?;

        config.try_deserialize()
    }
}

/// `humantime`-free duration (de)serialization using the plain strings the
/// teacher's `config` YAML files already use ("30s", "5min", ...).
mod humantime_serde_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    fn parse(raw: &str) -> Result<Duration, String> {
        let raw = raw.trim();
        let (digits, unit) = raw
            .find(|c: char| !c.is_ascii_digit())
            .map(|idx| raw.split_at(idx))
            .ok_or_else(|| format!("duration '{raw}' has no unit"))?;
        let value: u64 = digits.parse().map_err(|_| format!("invalid duration digits in '{raw}'"))?;
        match unit {
            "s" => Ok(Duration::from_secs(value)),
            "ms" => Ok(Duration::from_millis(value)),
            "min" | "m" => Ok(Duration::from_secs(value * 60)),
            other => Err(format!("unsupported duration unit '{other}' in '{raw}'")),
        }
    }
}
