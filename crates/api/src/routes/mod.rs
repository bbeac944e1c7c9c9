//! API routes

pub mod chat;
pub mod health;

use axum::{
    extract::DefaultBodyLimit,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method,
    },
    middleware,
    routing::get,
    Router,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{auth::require_auth, state::AppState, websocket::ws_handler};

/// Request bodies are small JSON documents; nothing here accepts uploads
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let auth_state = state.auth_state();

    // Chat routes (bearer auth) - under /api/v1
    let chat_routes = Router::new()
        .route("/chat/users", get(chat::chat_users))
        .route("/chat/online-users", get(chat::online_users))
        .route("/chat/history/:other_user_id", get(chat::history))
        .route("/chat/conversations", get(chat::conversations))
        .layer(middleware::from_fn_with_state(auth_state, require_auth));

    // WebSocket routes (auth handled in handler via query parameter)
    let websocket_routes = Router::new().route("/ws", get(ws_handler));

    let cors = cors_layer(&state.config.cors_allowed_origins);

    // Combine all routes
    Router::new()
        .merge(health_routes)
        .merge(websocket_routes)
        .nest("/api/v1", chat_routes)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true)
}
