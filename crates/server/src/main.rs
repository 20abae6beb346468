use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use relay_server::{
    routes::create_router,
    websocket::{DefaultHandler, Dispatcher, HandlerRegistry},
    AppState, Config,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!("Relay server v{} starting", env!("CARGO_PKG_VERSION"));

    let (dispatcher, dispatcher_task) = Dispatcher::spawn(config.dispatcher_config());
    let handlers = HandlerRegistry::new(Arc::new(DefaultHandler::new(dispatcher.clone()))).await;

    let state = AppState::new(&config, dispatcher.clone(), handlers);
    let app = create_router(state);

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    tracing::info!(address = %config.bind_address, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("HTTP server stopped, shutting down dispatcher");
    if let Err(e) = dispatcher.shutdown().await {
        tracing::warn!(error = %e, "Dispatcher already stopped");
    }
    dispatcher.stopped().await;
    if let Err(e) = dispatcher_task.await {
        tracing::error!(error = %e, "Dispatcher task failed");
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("relay_server=info,tower_http=info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
