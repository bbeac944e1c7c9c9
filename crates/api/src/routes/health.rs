//! Health endpoints for orchestrators and dashboards
//!
//! `/health` reports the database and the realtime layer; `/health/ready` gates traffic on
//! the database alone, since sockets can be accepted with nobody online.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use sqlx::PgPool;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub database: DatabaseHealth,
    pub realtime: RealtimeHealth,
}

#[derive(Debug, Serialize)]
pub struct DatabaseHealth {
    pub reachable: bool,
}

/// Live socket and presence counts from this process
#[derive(Debug, Serialize)]
pub struct RealtimeHealth {
    pub connections: usize,
    pub online_users: usize,
}

async fn database_reachable(pool: &PgPool) -> bool {
    match sqlx::query("SELECT 1").execute(pool).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Health check: database unreachable");
            false
        }
    }
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let reachable = database_reachable(&state.pool).await;
    let realtime = RealtimeHealth {
        connections: state.chat.connection_count().await,
        online_users: state.chat.online_users().await.len(),
    };

    let (code, status) = if reachable {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        code,
        Json(HealthReport {
            status,
            version: env!("CARGO_PKG_VERSION"),
            database: DatabaseHealth { reachable },
            realtime,
        }),
    )
}

/// GET /health/live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// GET /health/ready
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if database_reachable(&state.pool).await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
