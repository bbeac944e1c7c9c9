//! Shared application state

use sqlx::PgPool;
use std::sync::Arc;

use crate::auth::{AuthState, JwtManager};
use crate::chat::ChatService;
use crate::config::Config;

/// Lifetime of tokens minted by `JwtManager::generate_access_token`
const ACCESS_TOKEN_EXPIRY_HOURS: i64 = 24;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub jwt: JwtManager,
    pub chat: Arc<ChatService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, chat: Arc<ChatService>) -> Self {
        Self {
            jwt: JwtManager::new(&config.jwt_secret, ACCESS_TOKEN_EXPIRY_HOURS),
            pool,
            config: Arc::new(config),
            chat,
        }
    }

    /// Subset of state handed to the auth middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt: self.jwt.clone(),
        }
    }
}
