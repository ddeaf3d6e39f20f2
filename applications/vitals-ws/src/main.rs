use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vitals_ws::{config::Config, create_router, upstream, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first; the log format lives there
    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/config.yaml".to_string());
    let config = Config::load(&config_path)?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "vitals_ws=debug,tower_http=debug".into());
    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting vitals-ws service");
    info!("Configuration loaded from: {}", config_path);

    // TLS provider for wss:// upstreams
    let _ = rustls::crypto::ring::default_provider().install_default();

    let state = Arc::new(AppState::from_config(&config));

    let sweeper = state
        .sessions
        .clone()
        .spawn_sweeper(config.auth.sweep_interval());

    let upstream = config.upstream.clone().map(|upstream_config| {
        info!(
            "Upstream provider configured: {} (device: {})",
            upstream_config.url, upstream_config.device_id
        );
        upstream::spawn(
            upstream_config,
            state.store.clone(),
            state.dispatcher.clone(),
        )
    });

    let app = create_router(state);

    // Start HTTP server
    let addr = config.bind_address();
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Server ready to accept device connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(upstream) = upstream {
        upstream.disconnect();
        upstream.abort();
    }
    sweeper.abort();

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
