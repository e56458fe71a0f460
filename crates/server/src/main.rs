//! Worldsync Server Entry Point

use std::net::SocketAddr;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use worldsync_config::{load_settings, Settings};
use worldsync_core::CloseReason;
use worldsync_server::{
    bridge, create_router, init_metrics, session::spawn_heartbeat_sweep, tick::spawn_tick_loops,
    AppState, NotificationBridge,
};
use worldsync_store::{Listener, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from files and environment
    // Priority: env vars > config/{env}.yaml > config/default.yaml > defaults
    let env = std::env::var("WORLDSYNC_ENV").ok();
    let settings = match load_settings(env.as_deref()) {
        Ok(settings) => {
            // Tracing not yet initialised, use eprintln for early logging
            eprintln!(
                "Loaded configuration (env: {})",
                env.as_deref().unwrap_or("default")
            );
            settings
        }
        Err(e) => {
            eprintln!("Warning: Failed to load config: {}. Using defaults.", e);
            Settings::default()
        }
    };

    init_tracing(&settings);

    tracing::info!("Starting worldsync server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(environment = ?settings.environment, "Configuration loaded");

    if settings.server.tls_enabled {
        tracing::warn!(
            "TLS termination is delegated to the fronting proxy; listening in plain HTTP"
        );
    }

    if settings.observability.metrics_enabled {
        init_metrics();
    }

    let store = Store::connect(&settings.database).await?;

    // Recover from a crash mid-capture before any tick loop starts
    let purged = store.purge_incomplete_ticks().await?;
    if purged > 0 {
        tracing::info!(purged, "Startup recovery removed incomplete ticks");
    }

    let groups = store.load_sync_groups().await?;
    tracing::info!(count = groups.len(), "Loaded sync group configuration");

    let listener = Listener::connect(&store, &settings.replication).await?;

    let (bridge_handle, bridge_rx) = NotificationBridge::channel();
    let state = AppState::new(settings, store, bridge_handle);
    state.set_sync_groups(groups);

    let shutdown = state.shutdown.clone();
    let bridge_task = bridge::spawn(state.clone(), listener, bridge_rx, shutdown.clone());
    let heartbeat_task = spawn_heartbeat_sweep(state.clone(), shutdown.clone());
    let tick_tasks = spawn_tick_loops(&state, &shutdown);

    let app = create_router(state.clone());

    let addr: SocketAddr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    )
    .parse()?;
    let tcp_listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(tcp_listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop accepting, say goodbye, let each group finish its in-flight tick
    tracing::info!("Shutting down");
    state.registry.close_all(CloseReason::ServerShutdown);
    shutdown.cancel();

    for task in tick_tasks {
        let _ = task.await;
    }
    let _ = heartbeat_task.await;
    let _ = bridge_task.await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

/// Initialise tracing from configuration
fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &settings.observability.log_level;
        format!("worldsync={},tower_http=info", level).into()
    });

    let subscriber = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    subscriber.with(fmt_layer).init();
}
