use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use edupulse_api::chat::{ChatService, PgMessageStore, PgPresenceStore, PgUserDirectory};
use edupulse_api::{routes, AppState, Config};

const DEFAULT_LOG_FILTER: &str = "edupulse_api=info,edupulse_shared=info,tower_http=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    let config = Config::from_env().context("failed to load configuration")?;

    // Initialize tracing/logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    tracing::info!("EduPulse messaging API v{} starting", env!("CARGO_PKG_VERSION"));

    let pool = edupulse_shared::db::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("failed to connect to database")?;
    edupulse_shared::db::run_migrations(&pool)
        .await
        .context("failed to run migrations")?;

    // No socket survives a restart, so nobody is online yet
    let presence_store = Arc::new(PgPresenceStore::new(pool.clone()));
    let reset = presence_store
        .reset_all_offline()
        .await
        .context("failed to reset presence")?;
    if reset > 0 {
        tracing::info!(users = reset, "Marked stale presence records offline");
    }

    let chat = Arc::new(ChatService::new(
        Arc::new(PgMessageStore::new(pool.clone())),
        Arc::new(PgUserDirectory::new(pool.clone())),
        presence_store,
        config.history_limits(),
    ));

    let bind_address = config.bind_address.clone();
    let state = AppState::new(pool, config, chat);
    let app = routes::create_router(state);

    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {}", bind_address))?;
    tracing::info!(address = %bind_address, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
