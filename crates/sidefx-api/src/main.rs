use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use sidefx_api::{routes, state::AppState};
use sidefx_artifacts::ArtifactSink;
use sidefx_broker::{BrokerAdapter, HttpBrokerAdapter};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sidefx_config::bootstrap_dotenv();
    sidefx_config::init_tracing();

    let config = sidefx_config::ApiConfig::from_env()?;

    let broker: Arc<dyn BrokerAdapter> =
        Arc::new(HttpBrokerAdapter::new(&config.broker_url).context("build broker adapter")?);
    let artifacts = ArtifactSink::new(&config.artifacts_dir).context("open artifact sink")?;

    let ledger = match &config.database_url {
        Some(url) => {
            let pool = sidefx_ledger::connect(url).await?;
            sidefx_ledger::migrate(&pool).await?;
            Some(pool)
        }
        None => {
            tracing::warn!("SIDEFX_DATABASE_URL not set; /v1/debug/side-effects will return 503");
            None
        }
    };

    let state = Arc::new(AppState::new(
        broker,
        ledger,
        artifacts,
        config.owner.clone(),
        config.max_attempts_default,
        config.events_lease_ms,
    ));

    let app = routes::build_router(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    ).layer(cors_localhost_only());

    info!(addr = %config.bind_addr, "sidefx-api listening");

    axum::serve(tokio::net::TcpListener::bind(config.bind_addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

/// CORS: allow only localhost origins, matching the worker-fleet's dev
/// convention for browser-facing ingress.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
