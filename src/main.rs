use clap::Parser;
use weather_core::config::{CliOptions, Settings};
use weather_core::server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = weather_core::tracing::get_tracing_subscriber("info");
    weather_core::tracing::init_subscriber(subscriber);

    let options = parse_options();
    let settings = load_settings(&options)?;

    let server = Server::build(&settings).await?;
    server.run_until_stopped().await.map_err(|err| err.into())
}

fn parse_options() -> CliOptions {
    let options = CliOptions::parse();
    if options.secrets.is_none() {
        tracing::warn!("No secrets configuration provided. Credentials should be sourced from a secure secrets store, not committed config files.");
    }

    options
}

fn load_settings(options: &CliOptions) -> anyhow::Result<Settings> {
    let app_environment = std::env::var(CliOptions::env_app_environment()).ok();
    if app_environment.is_none() {
        tracing::info!("No environment configuration override provided.");
    }

    Settings::load(options).map_err(|err| err.into())
}
