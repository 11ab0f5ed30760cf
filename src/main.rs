use anyhow::Result;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sliding_ratelimit::{
    config::Settings,
    http::{router, AppState},
    metrics::Metrics,
    redis::{RedisClient, RedisConfig},
    registry::LimiterRegistry,
    utils::SystemClock,
};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load(std::env::var("SETTINGS_PATH").ok().as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| settings.log_filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting sliding window rate limiter");

    let rules = settings.rules()?;
    let store = Arc::new(RedisClient::new(RedisConfig::from(&settings.redis)).await?);
    let metrics = Arc::new(Metrics::new()?);
    let registry =
        LimiterRegistry::new(store, &rules, Arc::new(SystemClock), Some(metrics.clone()))?;

    let app = router(AppState { registry, metrics });
    let addr: SocketAddr = settings.http_addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl+C, shutting down");
    }
}
