//! Map tile proxy (§6 `GET /map-tiles`): pinned origin, whitelisted layers,
//! range-checked zoom, and a validated timestamp, keeping the provider API
//! key server-side. Grounded in `original_source/api/py/_tiles.py`.

use reqwest_middleware::ClientWithMiddleware;
use secrecy::{ExposeSecret, Secret};
use std::time::Duration;
use thiserror::Error;
use url::Url;

const VALID_LAYERS: &[&str] = &["precipitationIntensity", "temperature", "windSpeed", "cloudCover", "humidity"];

#[derive(Debug, Error)]
pub enum MapTileError {
    #[error("invalid layer: {0}")]
    InvalidLayer(String),

    #[error("zoom out of range (must be 1-12)")]
    ZoomOutOfRange,

    #[error("invalid timestamp")]
    InvalidTimestamp,

    #[error("no credential configured for the tile provider")]
    Unconfigured,

    #[error("tile provider request failed: {0}")]
    HttpRequest(#[from] reqwest_middleware::Error),
}

pub fn validate_layer(layer: &str) -> Result<(), MapTileError> {
    if VALID_LAYERS.contains(&layer) {
        Ok(())
    } else {
        Err(MapTileError::InvalidLayer(layer.to_string()))
    }
}

pub fn validate_zoom(z: i32) -> Result<(), MapTileError> {
    if (1..=12).contains(&z) {
        Ok(())
    } else {
        Err(MapTileError::ZoomOutOfRange)
    }
}

/// `^(now|\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z)$`, hand-rolled since `regex`
/// is not available anywhere in the retrieved corpus.
pub fn validate_timestamp(timestamp: &str) -> Result<(), MapTileError> {
    if timestamp == "now" || is_iso8601_utc(timestamp) {
        Ok(())
    } else {
        Err(MapTileError::InvalidTimestamp)
    }
}

fn is_iso8601_utc(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.len() != 20 {
        return false;
    }
    let digit_positions = [0, 1, 2, 3, 5, 6, 8, 9, 11, 12, 14, 15, 17, 18];
    let literal_positions = [(4, b'-'), (7, b'-'), (10, b'T'), (13, b':'), (16, b':'), (19, b'Z')];
    digit_positions.iter().all(|&i| bytes[i].is_ascii_digit())
        && literal_positions.iter().all(|&(i, c)| bytes[i] == c)
}

pub struct TileProxy {
    client: ClientWithMiddleware,
    origin: Url,
    api_key: Option<Secret<String>>,
}

pub struct ProxiedTile {
    pub status: reqwest::StatusCode,
    pub body: Vec<u8>,
}

impl TileProxy {
    pub fn new(origin: Url, api_key: Option<Secret<String>>) -> Self {
        let inner = reqwest::Client::builder().timeout(Duration::from_secs(8)).build().expect("static reqwest client configuration");
        let client = reqwest_middleware::ClientBuilder::new(inner).build();
        Self { client, origin, api_key }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// SSRF-safe by construction: the origin is pinned at startup and every
    /// path segment is a validated integer/whitelisted string, never raw
    /// caller input spliced into the URL.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn fetch(&self, z: i32, x: i32, y: i32, layer: &str, timestamp: &str) -> Result<ProxiedTile, MapTileError> {
        validate_layer(layer)?;
        validate_zoom(z)?;
        validate_timestamp(timestamp)?;
        let api_key = self.api_key.as_ref().ok_or(MapTileError::Unconfigured)?;

        let mut url = self.origin.clone();
        url.path_segments_mut()
            .map(|mut segments| {
                segments.extend(["v4", "map", "tile", &z.to_string(), &x.to_string(), &y.to_string(), layer, &format!("{timestamp}.png")]);
            })
            .ok();
        url.query_pairs_mut().append_pair("apikey", api_key.expose_secret());

        let response = self.client.get(url).send().await?;
        let status = response.status();
        let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
        Ok(ProxiedTile { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_and_iso8601_timestamps_are_valid() {
        assert!(validate_timestamp("now").is_ok());
        assert!(validate_timestamp("2026-07-30T12:00:00Z").is_ok());
        assert!(validate_timestamp("tomorrow").is_err());
        assert!(validate_timestamp("2026-07-30").is_err());
    }

    #[test]
    fn zoom_must_be_one_through_twelve() {
        assert!(validate_zoom(1).is_ok());
        assert!(validate_zoom(12).is_ok());
        assert!(validate_zoom(0).is_err());
        assert!(validate_zoom(13).is_err());
    }

    #[test]
    fn unknown_layer_is_rejected() {
        assert!(validate_layer("precipitationIntensity").is_ok());
        assert!(validate_layer("rainbow").is_err());
    }

    #[tokio::test]
    async fn fetch_proxies_bytes_and_status_from_the_origin() {
        let server = wiremock::MockServer::start().await;
        let png_bytes = vec![0x89, 0x50, 0x4e, 0x47];
        wiremock::Mock::given(wiremock::matchers::path("/v4/map/tile/4/8/8/temperature/now.png"))
            .and(wiremock::matchers::query_param("apikey", "test-key"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_bytes(png_bytes.clone()))
            .mount(&server)
            .await;

        let proxy = TileProxy::new(server.uri().parse().unwrap(), Some(Secret::new("test-key".to_string())));
        assert!(proxy.is_configured());

        let tile = proxy.fetch(4, 8, 8, "temperature", "now").await.expect("fetch should succeed");
        assert_eq!(tile.status, reqwest::StatusCode::OK);
        assert_eq!(tile.body, png_bytes);
    }

    #[tokio::test]
    async fn fetch_rejects_an_unconfigured_proxy_before_any_request() {
        let proxy = TileProxy::new(Url::parse("https://tile.example.invalid").unwrap(), None);
        assert!(!proxy.is_configured());
        assert!(matches!(proxy.fetch(4, 8, 8, "temperature", "now").await, Err(MapTileError::Unconfigured)));
    }
}
