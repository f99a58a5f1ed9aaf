use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use log::{error, info, warn};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use botfleet::callback::configure_callback_routes;
use botfleet::lifecycle::configure_bot_routes;
use botfleet::shared::utils::{create_conn, run_migrations};
use botfleet::{build_orchestrator, AppConfig, AppState, CommandBus, Reaper};

async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let db_ok = state.conn.get().is_ok();

    let status = if db_ok { "healthy" } else { "degraded" };
    let code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(serde_json::json!({
            "status": status,
            "service": "botfleet",
            "version": env!("CARGO_PKG_VERSION"),
            "database": db_ok
        })),
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::from_env().map_err(std::io::Error::other)?;
    info!(
        "Starting botfleet {} (orchestrator: {:?})",
        env!("CARGO_PKG_VERSION"),
        config.orch_kind
    );

    let pool = create_conn(&config.store_url).map_err(|e| {
        error!("Failed to create store pool: {}", e);
        std::io::Error::new(std::io::ErrorKind::ConnectionRefused, e.to_string())
    })?;

    info!("Running store migrations...");
    if let Err(e) = run_migrations(&pool) {
        error!("Failed to run migrations: {}", e);
        warn!("Continuing; the store may be partially migrated");
    }

    let bus = CommandBus::connect(&config.bus_url).map_err(std::io::Error::other)?;
    bus.ping().await;

    let config = Arc::new(config);
    let orchestrator = build_orchestrator(&config);
    let state = Arc::new(AppState::new(
        pool,
        Arc::clone(&config),
        bus,
        orchestrator,
    ));

    let reaper = Reaper::new(
        state.store.clone(),
        Arc::clone(&state.orchestrator),
        config.reaper.clone(),
    );
    let reaper_handle = reaper.start();

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(configure_bot_routes())
        .merge(configure_callback_routes())
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(std::io::Error::other)?;
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(
                "Failed to bind to {}: {} - is another instance running?",
                addr, e
            );
            return Err(e);
        }
    };
    info!("HTTP server listening on {}", addr);

    let result = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(std::io::Error::other);

    reaper_handle.abort();
    result
}
