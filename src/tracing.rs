//! Structured logging setup.
//!
//! Mirrors the teacher's `weather::tracing::{get_tracing_subscriber, init_subscriber}`
//! naming; the implementation itself follows the `tracing_subscriber` builder
//! shape used for the sibling exporter binaries in this pack.

use tracing::Subscriber;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

pub fn get_tracing_subscriber(default_level: &str) -> impl Subscriber + Send + Sync {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let formatting_layer = BunyanFormattingLayer::new("weather-core".into(), std::io::stdout);

    Registry::default().with(env_filter).with(JsonStorageLayer).with(formatting_layer)
}

pub fn init_subscriber(subscriber: impl Subscriber + Send + Sync) {
    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");
}
