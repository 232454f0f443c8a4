mod ai_routes;
mod chat_routes;
mod devices_routes;
mod errors;
mod health_routes;
mod history_routes;
mod locations_routes;
mod maptiles_routes;
mod reports_routes;
mod state;
mod status_routes;
mod suitability_routes;
mod weather_routes;

pub use state::AppState;

use crate::config::Settings;
use axum::error_handling::HandleErrorLayer;
use axum::http::{Response, StatusCode, Uri};
use axum::{BoxError, Router};
use errors::ApiError;
use std::net::TcpListener;
use tokio::signal;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::GovernorLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tower_http::ServiceBuilderExt;
use utoipa::OpenApi;
use utoipa_swagger_ui::{SwaggerUi, Url as SwaggerUrl};

pub type HttpJoinHandle = JoinHandle<Result<(), ApiError>>;

pub struct Server {
    port: u16,
    server_handle: HttpJoinHandle,
}

impl Server {
    #[tracing::instrument(level = "debug", skip(settings))]
    pub async fn build(settings: &Settings) -> Result<Self, ApiError> {
        let address = settings.http.address();
        let listener = tokio::net::TcpListener::bind(&address).await?;
        tracing::info!("{:?} API listening on {address}: {listener:?}", std::env::current_exe());
        let std_listener = listener.into_std()?;
        let port = std_listener.local_addr()?.port();

        let server_handle = run_http_server(std_listener, settings).await?;

        Ok(Self { port, server_handle })
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub async fn run_until_stopped(self) -> Result<(), ApiError> {
        self.server_handle.await?
    }
}

#[tracing::instrument(level = "trace", skip(settings))]
pub async fn run_http_server(listener: TcpListener, settings: &Settings) -> Result<HttpJoinHandle, ApiError> {
    let app_state = state::initialize_app_state(settings).await?;

    let governor_conf = Box::new(
        GovernorConfigBuilder::default()
            .burst_size(settings.http.rate_limit.burst_size)
            .period(settings.http.rate_limit.per_duration)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .unwrap(),
    );

    let middleware_stack = ServiceBuilder::new()
        .layer(HandleErrorLayer::new(handle_api_error))
        .layer(GovernorLayer {
            config: Box::leak(governor_conf), // created once, then reused by the layer for the process lifetime
        })
        .timeout(settings.http.timeout)
        .compression()
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .propagate_x_request_id();

    let api_routes = Router::new()
        .nest("/health", health_routes::api())
        .nest("/status", status_routes::api())
        .nest("/weather", weather_routes::api())
        .nest("/ai", ai_routes::api())
        .nest("/chat", chat_routes::api())
        .nest("/explore", chat_routes::explore_api())
        .nest("/history/analyze", history_routes::analyze_api())
        .nest("/history", history_routes::list_api())
        .nest("/reports", reports_routes::api())
        .nest("/suitability", suitability_routes::api())
        .nest("/locations", locations_routes::locations_api())
        .nest("/search", locations_routes::search_api())
        .nest("/geo", locations_routes::geo_api())
        .nest("/devices", devices_routes::api())
        .nest("/map-tiles", maptiles_routes::api())
        .with_state(app_state);

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").urls(vec![
            (SwaggerUrl::with_primary("weather_api", "/api-doc/weather-openapi.json", true), weather_routes::WeatherApiDoc::openapi()),
            (SwaggerUrl::new("health_api", "/api-doc/health-openapi.json"), health_routes::HealthApiDoc::openapi()),
            (SwaggerUrl::new("status_api", "/api-doc/status-openapi.json"), status_routes::StatusApiDoc::openapi()),
        ]))
        .nest(&settings.http.api_prefix, api_routes)
        .fallback(fallback)
        .layer(middleware_stack);

    let handle = tokio::spawn(async move {
        tracing::debug!(app_routes=?app, "starting API server...");
        let builder = axum::Server::from_tcp(listener)?;
        let server = builder.serve(app.into_make_service_with_connect_info::<std::net::SocketAddr>());
        let graceful = server.with_graceful_shutdown(shutdown_signal());
        graceful.await?;
        tracing::info!("{:?} API shutting down", std::env::current_exe());
        Ok(())
    });

    Ok(handle)
}

async fn fallback(uri: Uri) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("No route found for {uri}"))
}

async fn handle_api_error(error: BoxError) -> Response<String> {
    if error.is::<tower::timeout::error::Elapsed>() {
        let response = Response::new(format!("REQUEST TIMEOUT: {error}"));
        let (mut parts, body) = response.into_parts();
        parts.status = StatusCode::REQUEST_TIMEOUT;
        Response::from_parts(parts, body)
    } else if error.is::<tower_governor::errors::GovernorError>() {
        tower_governor::errors::display_error(error)
    } else {
        let response = Response::new(format!("INTERNAL SERVER ERROR: {error}"));
        let (mut parts, body) = response.into_parts();
        parts.status = StatusCode::INTERNAL_SERVER_ERROR;
        Response::from_parts(parts, body)
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("signal received, starting graceful shutdown");
}
