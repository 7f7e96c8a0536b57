//! Gemini Relay binary.

use gemini_relay::{create_router, AppState, Config};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Gemini Relay");

    let config: Config = config::Config::builder()
        .add_source(config::File::with_name("relay").required(false))
        .add_source(config::Environment::with_prefix("RELAY"))
        .build()
        .and_then(|c| c.try_deserialize())
        .unwrap_or_else(|e| {
            // Fall back only when no config exists; parsing errors fail hard.
            let err_str = format!("{e}");
            if err_str.contains("not found") || err_str.contains("missing field") {
                warn!(error = %e, "No config file found, using defaults");
                Config::default()
            } else {
                error!(error = %e, "FATAL: Config error, fix env vars or relay.toml");
                std::process::exit(1);
            }
        });

    if config.api_keys.is_empty() && config.vertex_api_keys.is_empty() {
        warn!("No upstream API keys configured; every proxy call will fail");
    }
    if config.auth_token.is_empty() && config.allowed_tokens.is_empty() {
        warn!("No client tokens configured; the proxy surface rejects all callers");
    }

    info!(
        upstream = %config.upstream_base_url,
        window_secs = config.rpm_window_seconds,
        prefer_cache = config.rpm_prefer_cache,
        "Configuration loaded"
    );

    let bind_address = config.bind_address.clone();
    let state = Arc::new(AppState::new(config)?);

    info!(
        api_keys = state.api_pool.key_count(),
        vertex_keys = state.vertex_pool.key_count(),
        "Relay ready"
    );

    let cancel = CancellationToken::new();

    let log = Arc::clone(&state.log);
    let cancel_bg = cancel.clone();
    tokio::spawn(async move {
        log.run_pruner(cancel_bg).await;
    });

    let app = create_router(state.clone());

    info!(address = %bind_address, "Listening");

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("HTTP server stopped");
    cancel.cancel();

    info!("Relay shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
