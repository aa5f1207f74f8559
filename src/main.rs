use std::sync::Arc;

use anyhow::Context;
use roomcast::{AppState, config::{Config, LogFormat}, db::SqliteStore, hub::Hub};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_logging(config.log_format);

    let store = SqliteStore::connect(&config.database_url).await?;
    store.migrate().await?;

    let hub = Hub::new(Arc::new(store), config.outbound_buffer);
    let app = roomcast::app(AppState { hub }, config.session_idle());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, database = %config.database_url, "listening");
    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}

fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("roomcast=info,tower_http=info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init().ok(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init().ok(),
    };
}
