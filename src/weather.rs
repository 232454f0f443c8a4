//! Weather fetch pipeline (§4.2): cache → primary provider → secondary
//! provider → seasonal synthesis, normalised to a single shape, with
//! history capture. The endpoint never surfaces a hard error — synthesis
//! is the terminal, infallible step.

use crate::breaker::{BreakerError, BreakerRegistry};
use crate::store::{Filter, Store, Update};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::time;
use thiserror::Error;
use url::Url;
use utoipa::ToSchema;

pub const CACHE_TTL_SECS: i64 = 15 * 60;

#[derive(Debug, Error)]
pub enum WeatherError {
    #[error("provider API call failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("error occurred in HTTP middleware calling provider API: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    #[error("provider returned a response this pipeline could not parse: {0}")]
    MalformedResponse(String),

    #[error("no credential configured for this provider")]
    Unconfigured,

    #[error("{0}")]
    Breaker(#[from] BreakerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    Cache,
    Tomorrow,
    OpenMeteo,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CurrentConditions {
    pub time: DateTime<Utc>,
    pub temperature_2m: f64,
    pub relative_humidity_2m: f64,
    pub apparent_temperature: f64,
    pub precipitation: f64,
    pub weather_code: i32,
    pub wind_speed_10m: f64,
    pub wind_direction_10m: f64,
    pub wind_gusts_10m: f64,
    pub surface_pressure: f64,
    pub cloud_cover: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uv_index: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct HourlySeries {
    pub time: Vec<DateTime<Utc>>,
    pub temperature_2m: Vec<f64>,
    pub relative_humidity_2m: Vec<f64>,
    pub apparent_temperature: Vec<f64>,
    pub precipitation: Vec<f64>,
    pub weather_code: Vec<i32>,
    pub wind_speed_10m: Vec<f64>,
    pub wind_direction_10m: Vec<f64>,
    pub wind_gusts_10m: Vec<f64>,
    pub surface_pressure: Vec<f64>,
    pub cloud_cover: Vec<f64>,
}

impl HourlySeries {
    const MAX_LEN: usize = 24;

    fn truncated(mut self) -> Self {
        self.time.truncate(Self::MAX_LEN);
        self.temperature_2m.truncate(Self::MAX_LEN);
        self.relative_humidity_2m.truncate(Self::MAX_LEN);
        self.apparent_temperature.truncate(Self::MAX_LEN);
        self.precipitation.truncate(Self::MAX_LEN);
        self.weather_code.truncate(Self::MAX_LEN);
        self.wind_speed_10m.truncate(Self::MAX_LEN);
        self.wind_direction_10m.truncate(Self::MAX_LEN);
        self.wind_gusts_10m.truncate(Self::MAX_LEN);
        self.surface_pressure.truncate(Self::MAX_LEN);
        self.cloud_cover.truncate(Self::MAX_LEN);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct DailySeries {
    pub time: Vec<DateTime<Utc>>,
    pub weather_code: Vec<i32>,
    pub temperature_2m_max: Vec<f64>,
    pub temperature_2m_min: Vec<f64>,
    pub apparent_temperature_max: Vec<f64>,
    pub apparent_temperature_min: Vec<f64>,
    pub precipitation_sum: Vec<f64>,
    pub precipitation_probability_max: Vec<f64>,
    pub wind_speed_10m_max: Vec<f64>,
    pub wind_gusts_10m_max: Vec<f64>,
    pub wind_direction_10m_dominant: Vec<f64>,
    pub uv_index_max: Vec<f64>,
    pub sunrise: Vec<String>,
    pub sunset: Vec<String>,
}

impl DailySeries {
    const MAX_LEN: usize = 7;

    fn truncated(mut self) -> Self {
        self.time.truncate(Self::MAX_LEN);
        self.weather_code.truncate(Self::MAX_LEN);
        self.temperature_2m_max.truncate(Self::MAX_LEN);
        self.temperature_2m_min.truncate(Self::MAX_LEN);
        self.apparent_temperature_max.truncate(Self::MAX_LEN);
        self.apparent_temperature_min.truncate(Self::MAX_LEN);
        self.precipitation_sum.truncate(Self::MAX_LEN);
        self.precipitation_probability_max.truncate(Self::MAX_LEN);
        self.wind_speed_10m_max.truncate(Self::MAX_LEN);
        self.wind_gusts_10m_max.truncate(Self::MAX_LEN);
        self.wind_direction_10m_dominant.truncate(Self::MAX_LEN);
        self.uv_index_max.truncate(Self::MAX_LEN);
        self.sunrise.truncate(Self::MAX_LEN);
        self.sunset.truncate(Self::MAX_LEN);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct Insights {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heat_stress_index: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thunderstorm_probability: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uv_health_concern: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wind_speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wind_gust: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dew_point: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gdd10_to_30: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evapotranspiration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moon_phase: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_base: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_ceiling: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precipitation_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NormalisedWeather {
    pub current: CurrentConditions,
    pub hourly: HourlySeries,
    pub daily: DailySeries,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insights: Option<Insights>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeatherResult {
    pub data: NormalisedWeather,
    pub provenance: Provenance,
}

/// Maps Tomorrow.io weather codes to the canonical WMO space (§4.2).
pub fn map_tomorrow_code(code: i32) -> i32 {
    match code {
        0 | 1000 => 0,
        1100 => 1,
        1101 => 2,
        1102 | 1001 => 3,
        2000 => 45,
        2100 => 48,
        4000 => 51,
        4001 => 61,
        4200 => 63,
        4201 => 65,
        5000 => 71,
        5001 => 73,
        5100 => 75,
        5101 => 77,
        6000 => 56,
        6001 => 66,
        6200 | 6201 => 67,
        7000 => 77,
        7101 => 85,
        7102 => 86,
        8000 => 95,
        _ => 0,
    }
}

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_configured(&self) -> bool;
    async fn fetch(&self, lat: f64, lon: f64) -> Result<NormalisedWeather, WeatherError>;
}

fn make_http_client(user_agent: &str) -> Result<ClientWithMiddleware, WeatherError> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_str(user_agent).expect("static user agent"));

    let client = reqwest::Client::builder()
        .pool_idle_timeout(time::Duration::from_secs(60))
        .default_headers(headers)
        .pool_max_idle_per_host(5)
        .build()?;

    let retry_policy = ExponentialBackoff::builder()
        .retry_bounds(time::Duration::from_millis(200), time::Duration::from_secs(5))
        .build_with_max_retries(2);

    Ok(reqwest_middleware::ClientBuilder::new(client)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build())
}

/// Tomorrow.io-shaped primary provider.
#[derive(Debug, Clone)]
pub struct TomorrowProvider {
    client: ClientWithMiddleware,
    base_url: Url,
    api_key: Option<Secret<String>>,
}

impl TomorrowProvider {
    pub fn new(base_url: Url, api_key: Option<Secret<String>>) -> Result<Self, WeatherError> {
        Ok(Self { client: make_http_client("weather-core/1.0")?, base_url, api_key })
    }
}

#[derive(Debug, Deserialize)]
struct TomorrowEnvelope {
    data: TomorrowData,
}

#[derive(Debug, Deserialize)]
struct TomorrowData {
    timelines: Vec<TomorrowTimeline>,
}

#[derive(Debug, Deserialize)]
struct TomorrowTimeline {
    timestep: String,
    intervals: Vec<TomorrowInterval>,
}

#[derive(Debug, Deserialize)]
struct TomorrowInterval {
    #[serde(rename = "startTime")]
    start_time: DateTime<Utc>,
    values: serde_json::Map<String, serde_json::Value>,
}

fn num(values: &serde_json::Map<String, serde_json::Value>, key: &str) -> f64 {
    values.get(key).and_then(serde_json::Value::as_f64).unwrap_or(0.0)
}

fn num_opt(values: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<f64> {
    values.get(key).and_then(serde_json::Value::as_f64)
}

#[async_trait]
impl WeatherProvider for TomorrowProvider {
    fn name(&self) -> &'static str {
        "tomorrow"
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn fetch(&self, lat: f64, lon: f64) -> Result<NormalisedWeather, WeatherError> {
        let Some(api_key) = self.api_key.as_ref() else {
            return Err(WeatherError::Unconfigured);
        };

        let mut url = self.base_url.clone();
        url.path_segments_mut().map_err(|()| WeatherError::MalformedResponse("base url".into()))?
            .push("v4")
            .push("timelines");
        url.query_pairs_mut()
            .append_pair("location", &format!("{lat},{lon}"))
            .append_pair("timesteps", "current,1h,1d")
            .append_pair("apikey", api_key.expose_secret());

        let response = self.client.get(url).send().await?.error_for_status()?;
        let body: TomorrowEnvelope = response.json().await?;

        let hourly_timeline = body.data.timelines.iter().find(|t| t.timestep == "1h");
        let daily_timeline = body.data.timelines.iter().find(|t| t.timestep == "1d");
        let current_timeline = body.data.timelines.iter().find(|t| t.timestep == "current");

        let current_interval = current_timeline
            .and_then(|t| t.intervals.first())
            .or_else(|| hourly_timeline.and_then(|t| t.intervals.first()))
            .ok_or_else(|| WeatherError::MalformedResponse("no current interval".into()))?;
        let values = &current_interval.values;
        let weather_code = map_tomorrow_code(num(values, "weatherCode") as i32);

        let current = CurrentConditions {
            time: current_interval.start_time,
            temperature_2m: num(values, "temperature"),
            relative_humidity_2m: num(values, "humidity"),
            apparent_temperature: num(values, "temperatureApparent"),
            precipitation: num(values, "precipitationIntensity"),
            weather_code,
            wind_speed_10m: num(values, "windSpeed"),
            wind_direction_10m: num(values, "windDirection"),
            wind_gusts_10m: num(values, "windGust"),
            surface_pressure: num(values, "pressureSurfaceLevel"),
            cloud_cover: num(values, "cloudCover"),
            uv_index: num_opt(values, "uvIndex"),
        };

        let mut hourly = HourlySeries::default();
        for interval in hourly_timeline.map(|t| t.intervals.as_slice()).unwrap_or_default() {
            hourly.time.push(interval.start_time);
            hourly.temperature_2m.push(num(&interval.values, "temperature"));
            hourly.relative_humidity_2m.push(num(&interval.values, "humidity"));
            hourly.apparent_temperature.push(num(&interval.values, "temperatureApparent"));
            hourly.precipitation.push(num(&interval.values, "precipitationIntensity"));
            hourly.weather_code.push(map_tomorrow_code(num(&interval.values, "weatherCode") as i32));
            hourly.wind_speed_10m.push(num(&interval.values, "windSpeed"));
            hourly.wind_direction_10m.push(num(&interval.values, "windDirection"));
            hourly.wind_gusts_10m.push(num(&interval.values, "windGust"));
            hourly.surface_pressure.push(num(&interval.values, "pressureSurfaceLevel"));
            hourly.cloud_cover.push(num(&interval.values, "cloudCover"));
        }

        let mut daily = DailySeries::default();
        for interval in daily_timeline.map(|t| t.intervals.as_slice()).unwrap_or_default() {
            daily.time.push(interval.start_time);
            daily.weather_code.push(map_tomorrow_code(num(&interval.values, "weatherCodeMax") as i32));
            daily.temperature_2m_max.push(num(&interval.values, "temperatureMax"));
            daily.temperature_2m_min.push(num(&interval.values, "temperatureMin"));
            daily.apparent_temperature_max.push(num(&interval.values, "temperatureApparentMax"));
            daily.apparent_temperature_min.push(num(&interval.values, "temperatureApparentMin"));
            daily.precipitation_sum.push(num(&interval.values, "precipitationSum"));
            daily.precipitation_probability_max.push(num(&interval.values, "precipitationProbabilityMax"));
            daily.wind_speed_10m_max.push(num(&interval.values, "windSpeedMax"));
            daily.wind_gusts_10m_max.push(num(&interval.values, "windGustMax"));
            daily.wind_direction_10m_dominant.push(num(&interval.values, "windDirectionAvg"));
            daily.uv_index_max.push(num(&interval.values, "uvIndexMax"));
            daily.sunrise.push(values_string(&interval.values, "sunriseTime"));
            daily.sunset.push(values_string(&interval.values, "sunsetTime"));
        }

        // Insights are populated only from the first daily entry (spec §9:
        // "today", even when the upstream supplies more than one day).
        let insights = daily_timeline.and_then(|t| t.intervals.first()).map(|first| Insights {
            heat_stress_index: num_opt(&first.values, "heatIndexMax"),
            thunderstorm_probability: num_opt(&first.values, "thunderstormProbability"),
            uv_health_concern: num_opt(&first.values, "uvHealthConcernMax"),
            visibility: num_opt(&first.values, "visibilityAvg"),
            wind_speed: num_opt(&first.values, "windSpeedMax"),
            wind_gust: num_opt(&first.values, "windGustMax"),
            dew_point: num_opt(&first.values, "dewPointAvg"),
            gdd10_to_30: num_opt(&first.values, "gdd10To30"),
            evapotranspiration: num_opt(&first.values, "evapotranspirationAvg"),
            moon_phase: num_opt(&first.values, "moonPhase"),
            cloud_base: num_opt(&first.values, "cloudBaseAvg"),
            cloud_ceiling: num_opt(&first.values, "cloudCeilingAvg"),
            precipitation_type: first.values.get("precipitationTypeMax").and_then(|v| v.as_str()).map(str::to_string),
        });

        Ok(NormalisedWeather { current, hourly: hourly.truncated(), daily: daily.truncated(), insights })
    }
}

fn values_string(values: &serde_json::Map<String, serde_json::Value>, key: &str) -> String {
    values.get(key).and_then(|v| v.as_str()).unwrap_or_default().to_string()
}

/// Open-Meteo-shaped secondary provider: unconditional free tier.
#[derive(Debug, Clone)]
pub struct OpenMeteoProvider {
    client: ClientWithMiddleware,
    base_url: Url,
}

impl OpenMeteoProvider {
    pub fn new(base_url: Url) -> Result<Self, WeatherError> {
        Ok(Self { client: make_http_client("weather-core/1.0")?, base_url })
    }
}

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    current: OpenMeteoCurrent,
    hourly: OpenMeteoHourly,
    daily: OpenMeteoDaily,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoCurrent {
    time: DateTime<Utc>,
    temperature_2m: f64,
    relative_humidity_2m: f64,
    apparent_temperature: f64,
    precipitation: f64,
    weather_code: i32,
    wind_speed_10m: f64,
    wind_direction_10m: f64,
    wind_gusts_10m: f64,
    surface_pressure: f64,
    cloud_cover: f64,
}

#[derive(Debug, Default, Deserialize)]
struct OpenMeteoHourly {
    #[serde(default)]
    time: Vec<DateTime<Utc>>,
    #[serde(default)]
    temperature_2m: Vec<f64>,
    #[serde(default)]
    relative_humidity_2m: Vec<f64>,
    #[serde(default)]
    apparent_temperature: Vec<f64>,
    #[serde(default)]
    precipitation: Vec<f64>,
    #[serde(default)]
    weather_code: Vec<i32>,
    #[serde(default)]
    wind_speed_10m: Vec<f64>,
    #[serde(default)]
    wind_direction_10m: Vec<f64>,
    #[serde(default)]
    wind_gusts_10m: Vec<f64>,
    #[serde(default)]
    surface_pressure: Vec<f64>,
    #[serde(default)]
    cloud_cover: Vec<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenMeteoDaily {
    #[serde(default)]
    time: Vec<DateTime<Utc>>,
    #[serde(default)]
    weather_code: Vec<i32>,
    #[serde(default)]
    temperature_2m_max: Vec<f64>,
    #[serde(default)]
    temperature_2m_min: Vec<f64>,
    #[serde(default)]
    apparent_temperature_max: Vec<f64>,
    #[serde(default)]
    apparent_temperature_min: Vec<f64>,
    #[serde(default)]
    precipitation_sum: Vec<f64>,
    #[serde(default)]
    precipitation_probability_max: Vec<f64>,
    #[serde(default)]
    wind_speed_10m_max: Vec<f64>,
    #[serde(default)]
    wind_gusts_10m_max: Vec<f64>,
    #[serde(default)]
    wind_direction_10m_dominant: Vec<f64>,
    #[serde(default)]
    uv_index_max: Vec<f64>,
    #[serde(default)]
    sunrise: Vec<String>,
    #[serde(default)]
    sunset: Vec<String>,
}

#[async_trait]
impl WeatherProvider for OpenMeteoProvider {
    fn name(&self) -> &'static str {
        "open-meteo"
    }

    fn is_configured(&self) -> bool {
        true
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn fetch(&self, lat: f64, lon: f64) -> Result<NormalisedWeather, WeatherError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut().map_err(|()| WeatherError::MalformedResponse("base url".into()))?
            .push("v1")
            .push("forecast");
        url.query_pairs_mut()
            .append_pair("latitude", &lat.to_string())
            .append_pair("longitude", &lon.to_string())
            .append_pair(
                "current",
                "temperature_2m,relative_humidity_2m,apparent_temperature,precipitation,weather_code,\
                 wind_speed_10m,wind_direction_10m,wind_gusts_10m,surface_pressure,cloud_cover",
            )
            .append_pair(
                "hourly",
                "temperature_2m,relative_humidity_2m,apparent_temperature,precipitation,weather_code,\
                 wind_speed_10m,wind_direction_10m,wind_gusts_10m,surface_pressure,cloud_cover",
            )
            .append_pair(
                "daily",
                "weather_code,temperature_2m_max,temperature_2m_min,apparent_temperature_max,\
                 apparent_temperature_min,precipitation_sum,precipitation_probability_max,\
                 wind_speed_10m_max,wind_gusts_10m_max,wind_direction_10m_dominant,uv_index_max,\
                 sunrise,sunset",
            );

        let response = self.client.get(url).send().await?.error_for_status()?;
        let body: OpenMeteoResponse = response.json().await?;

        let current = CurrentConditions {
            time: body.current.time,
            temperature_2m: body.current.temperature_2m,
            relative_humidity_2m: body.current.relative_humidity_2m,
            apparent_temperature: body.current.apparent_temperature,
            precipitation: body.current.precipitation,
            weather_code: body.current.weather_code,
            wind_speed_10m: body.current.wind_speed_10m,
            wind_direction_10m: body.current.wind_direction_10m,
            wind_gusts_10m: body.current.wind_gusts_10m,
            surface_pressure: body.current.surface_pressure,
            cloud_cover: body.current.cloud_cover,
            uv_index: None,
        };

        let hourly = HourlySeries {
            time: body.hourly.time,
            temperature_2m: body.hourly.temperature_2m,
            relative_humidity_2m: body.hourly.relative_humidity_2m,
            apparent_temperature: body.hourly.apparent_temperature,
            precipitation: body.hourly.precipitation,
            weather_code: body.hourly.weather_code,
            wind_speed_10m: body.hourly.wind_speed_10m,
            wind_direction_10m: body.hourly.wind_direction_10m,
            wind_gusts_10m: body.hourly.wind_gusts_10m,
            surface_pressure: body.hourly.surface_pressure,
            cloud_cover: body.hourly.cloud_cover,
        }
        .truncated();

        let daily = DailySeries {
            time: body.daily.time,
            weather_code: body.daily.weather_code,
            temperature_2m_max: body.daily.temperature_2m_max,
            temperature_2m_min: body.daily.temperature_2m_min,
            apparent_temperature_max: body.daily.apparent_temperature_max,
            apparent_temperature_min: body.daily.apparent_temperature_min,
            precipitation_sum: body.daily.precipitation_sum,
            precipitation_probability_max: body.daily.precipitation_probability_max,
            wind_speed_10m_max: body.daily.wind_speed_10m_max,
            wind_gusts_10m_max: body.daily.wind_gusts_10m_max,
            wind_direction_10m_dominant: body.daily.wind_direction_10m_dominant,
            uv_index_max: body.daily.uv_index_max,
            sunrise: body.daily.sunrise,
            sunset: body.daily.sunset,
        }
        .truncated();

        // Open-Meteo has no dedicated insights payload; synthesise a
        // minimal one from wind fields, per §4.2 step 3.
        let insights = Some(Insights {
            wind_speed: Some(current.wind_speed_10m),
            wind_gust: Some(current.wind_gusts_10m),
            ..Default::default()
        });

        Ok(NormalisedWeather { current, hourly, daily, insights })
    }
}

/// Never fails. Selects a baseline by hemisphere-month, adjusted for
/// elevation, and fills hourly/daily arrays with the baseline (§4.2 step 4).
pub fn synthesise(lat: f64, lon: f64, elevation: f64, now: DateTime<Utc>) -> NormalisedWeather {
    let (base_temp, wmo_code) = match now.month() {
        11 | 12 | 1 | 2 | 3 => (28.0, 61),
        4 | 5 => (22.0, 2),
        6 | 7 | 8 => (18.0, 0),
        _ => (32.0, 0),
    };
    let temp = base_temp - 0.006 * (elevation - 1000.0).max(0.0);

    let current = CurrentConditions {
        time: now,
        temperature_2m: temp,
        relative_humidity_2m: 55.0,
        apparent_temperature: temp,
        precipitation: 0.0,
        weather_code: wmo_code,
        wind_speed_10m: 10.0,
        wind_direction_10m: 180.0,
        wind_gusts_10m: 15.0,
        surface_pressure: 1013.0,
        cloud_cover: 30.0,
        uv_index: None,
    };

    let hourly = HourlySeries {
        time: (0..24).map(|h| now + chrono::Duration::hours(h)).collect(),
        temperature_2m: vec![temp; 24],
        relative_humidity_2m: vec![55.0; 24],
        apparent_temperature: vec![temp; 24],
        precipitation: vec![0.0; 24],
        weather_code: vec![wmo_code; 24],
        wind_speed_10m: vec![10.0; 24],
        wind_direction_10m: vec![180.0; 24],
        wind_gusts_10m: vec![15.0; 24],
        surface_pressure: vec![1013.0; 24],
        cloud_cover: vec![30.0; 24],
    };

    let daily = DailySeries {
        time: (0..7).map(|d| now + chrono::Duration::days(d)).collect(),
        weather_code: vec![wmo_code; 7],
        temperature_2m_max: vec![temp + 3.0; 7],
        temperature_2m_min: vec![temp - 5.0; 7],
        apparent_temperature_max: vec![temp + 3.0; 7],
        apparent_temperature_min: vec![temp - 5.0; 7],
        precipitation_sum: vec![0.0; 7],
        precipitation_probability_max: vec![10.0; 7],
        wind_speed_10m_max: vec![10.0; 7],
        wind_gusts_10m_max: vec![15.0; 7],
        wind_direction_10m_dominant: vec![180.0; 7],
        uv_index_max: vec![6.0; 7],
        sunrise: vec!["06:00".to_string(); 7],
        sunset: vec!["18:00".to_string(); 7],
    };

    let _ = (lat, lon);
    NormalisedWeather { current, hourly, daily, insights: None }
}

pub fn derive_location_slug(known_slug: Option<&str>, lat: f64, lon: f64) -> String {
    known_slug.map(str::to_string).unwrap_or_else(|| format!("{lat:.2}_{lon:.2}"))
}

#[allow(clippy::too_many_arguments)]
#[tracing::instrument(level = "debug", skip(store, breakers, tomorrow, open_meteo))]
pub async fn fetch_weather(
    store: &dyn Store, breakers: &BreakerRegistry, tomorrow: &TomorrowProvider,
    open_meteo: &OpenMeteoProvider, lat: f64, lon: f64, elevation: f64, known_slug: Option<&str>,
) -> WeatherResult {
    let slug = derive_location_slug(known_slug, lat, lon);

    if let Some(cached) = cache_lookup(store, &slug).await {
        return WeatherResult { data: cached, provenance: Provenance::Cache };
    }

    if tomorrow.is_configured() {
        if let Some(breaker) = breakers.get("tomorrow") {
            if let Ok(Ok(data)) = breaker.execute(tomorrow.fetch(lat, lon)).await {
                record_side_effects(store, &slug, lat, lon, &data, "tomorrow").await;
                return WeatherResult { data, provenance: Provenance::Tomorrow };
            }
        }
    }

    if let Some(breaker) = breakers.get("open-meteo") {
        if let Ok(Ok(data)) = breaker.execute(open_meteo.fetch(lat, lon)).await {
            record_side_effects(store, &slug, lat, lon, &data, "open-meteo").await;
            return WeatherResult { data, provenance: Provenance::OpenMeteo };
        }
    }

    WeatherResult { data: synthesise(lat, lon, elevation, Utc::now()), provenance: Provenance::Fallback }
}

async fn cache_lookup(store: &dyn Store, slug: &str) -> Option<NormalisedWeather> {
    let doc = store.find_one("weather_cache", Filter::new().eq("locationSlug", slug)).await.ok()??;
    let expires_at = doc.get("expiresAt")?.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok())?;
    if expires_at.with_timezone(&Utc) <= Utc::now() {
        return None;
    }
    serde_json::from_value(doc.get("data")?.clone()).ok()
}

/// Best-effort: cache upsert and history append, only for a real provider
/// fetch, never for cache hits or synthesis. Failures are logged and
/// swallowed (§4.2, §7's "user never observes a partial write").
async fn record_side_effects(
    store: &dyn Store, slug: &str, lat: f64, lon: f64, data: &NormalisedWeather, provider: &str,
) {
    let now = Utc::now();
    let expires_at = now + chrono::Duration::seconds(CACHE_TTL_SECS);

    let cache_update = Update::new()
        .set("locationSlug", slug)
        .set("data", serde_json::to_value(data).unwrap_or_default())
        .set("provider", provider)
        .set("lat", lat)
        .set("lon", lon)
        .set("fetchedAt", now.to_rfc3339())
        .set("expiresAt", expires_at.to_rfc3339());

    if let Err(error) =
        store.update_one("weather_cache", Filter::new().eq("locationSlug", slug), cache_update, true).await
    {
        tracing::warn!(%error, %slug, "failed to upsert weather cache entry");
    }

    let history_doc = serde_json::json!({
        "locationSlug": slug,
        "recordedAt": now.to_rfc3339(),
        "current": data.current,
        "daily": data.daily.time.first().map(|_| serde_json::json!({
            "weather_code": data.daily.weather_code.first(),
            "temperature_2m_max": data.daily.temperature_2m_max.first(),
            "temperature_2m_min": data.daily.temperature_2m_min.first(),
        })),
        "insights": data.insights,
    });
    if let Err(error) = store.insert_one("weather_history", history_doc).await {
        tracing::warn!(%error, %slug, "failed to append weather history record");
    }
}

pub fn breaker_registry_from_config(config: &crate::config::BreakerSettings) -> BreakerRegistry {
    use crate::breaker::BreakerConfig as Cfg;
    BreakerRegistry::new()
        .register(
            "tomorrow",
            Cfg {
                failure_threshold: config.tomorrow.failure_threshold,
                cool_down: config.tomorrow.cool_down,
                window: config.tomorrow.window,
                timeout: config.tomorrow.timeout,
            },
        )
        .register(
            "open-meteo",
            Cfg {
                failure_threshold: config.open_meteo.failure_threshold,
                cool_down: config.open_meteo.cool_down,
                window: config.open_meteo.window,
                timeout: config.open_meteo.timeout,
            },
        )
        .register(
            "llm",
            Cfg {
                failure_threshold: config.llm.failure_threshold,
                cool_down: config.llm.cool_down,
                window: config.llm.window,
                timeout: config.llm.timeout,
            },
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn map_tomorrow_code_covers_known_and_unknown_values() {
        assert_eq!(map_tomorrow_code(1000), 0);
        assert_eq!(map_tomorrow_code(4001), 61);
        assert_eq!(map_tomorrow_code(8000), 95);
        assert_eq!(map_tomorrow_code(99999), 0);
    }

    #[test]
    fn synthesis_never_fails_and_respects_array_bounds() {
        let data = synthesise(-17.83, 31.05, 1500.0, Utc::now());
        assert_eq!(data.hourly.temperature_2m.len(), 24);
        assert_eq!(data.daily.temperature_2m_max.len(), 7);
    }

    #[test]
    fn synthesis_picks_southern_hemisphere_summer_baseline() {
        let january = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        let data = synthesise(-17.83, 31.05, 0.0, january);
        assert_eq!(data.current.weather_code, 61);
        assert!((data.current.temperature_2m - 28.0).abs() < 1e-9);
    }

    #[test]
    fn elevation_adjusts_baseline_temperature_downward() {
        let june = Utc.with_ymd_and_hms(2026, 6, 15, 12, 0, 0).unwrap();
        let sea_level = synthesise(-17.83, 31.05, 0.0, june);
        let highland = synthesise(-17.83, 31.05, 2000.0, june);
        assert!(highland.current.temperature_2m < sea_level.current.temperature_2m);
    }

    #[tokio::test]
    async fn cache_hit_short_circuits_before_any_provider_call() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store
            .insert_one(
                "weather_cache",
                serde_json::json!({
                    "locationSlug": "harare",
                    "data": serde_json::to_value(synthesise(-17.83, 31.05, 0.0, now)).unwrap(),
                    "provider": "tomorrow",
                    "fetchedAt": now.to_rfc3339(),
                    "expiresAt": (now + chrono::Duration::minutes(5)).to_rfc3339(),
                }),
            )
            .await
            .unwrap();

        let breakers = BreakerRegistry::new();
        let tomorrow = TomorrowProvider::new("https://api.tomorrow.io".parse().unwrap(), None).unwrap();
        let open_meteo = OpenMeteoProvider::new("https://api.open-meteo.com".parse().unwrap()).unwrap();

        let result =
            fetch_weather(&store, &breakers, &tomorrow, &open_meteo, -17.83, 31.05, 0.0, Some("harare")).await;
        assert_eq!(result.provenance, Provenance::Cache);
    }

    #[tokio::test]
    async fn open_meteo_provider_parses_a_live_response() {
        let server = wiremock::MockServer::start().await;
        let body = serde_json::json!({
            "current": {
                "time": "2026-07-30T12:00:00Z",
                "temperature_2m": 22.5,
                "relative_humidity_2m": 40.0,
                "apparent_temperature": 21.0,
                "precipitation": 0.0,
                "weather_code": 1,
                "wind_speed_10m": 10.0,
                "wind_direction_10m": 90.0,
                "wind_gusts_10m": 15.0,
                "surface_pressure": 1012.0,
                "cloud_cover": 20.0,
            },
            "hourly": {"time": [], "temperature_2m": [], "relative_humidity_2m": [], "apparent_temperature": [],
                "precipitation": [], "weather_code": [], "wind_speed_10m": [], "wind_direction_10m": [],
                "wind_gusts_10m": [], "surface_pressure": [], "cloud_cover": []},
            "daily": {"time": [], "weather_code": [], "temperature_2m_max": [], "temperature_2m_min": [],
                "apparent_temperature_max": [], "apparent_temperature_min": [], "precipitation_sum": [],
                "precipitation_probability_max": [], "wind_speed_10m_max": [], "wind_gusts_10m_max": [],
                "wind_direction_10m_dominant": [], "uv_index_max": [], "sunrise": [], "sunset": []},
        });

        wiremock::Mock::given(wiremock::matchers::path("/v1/forecast"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let provider = OpenMeteoProvider::new(server.uri().parse().unwrap()).unwrap();
        let data = provider.fetch(-17.83, 31.05).await.unwrap();
        assert_eq!(data.current.weather_code, 1);
        assert!((data.current.temperature_2m - 22.5).abs() < 1e-9);
    }
}
