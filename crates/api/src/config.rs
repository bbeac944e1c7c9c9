//! Application configuration

use std::env;

use crate::chat::HistoryLimits;

const DEFAULT_CORS_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:5173",
];

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub cors_allowed_origins: Vec<String>,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Authentication
    pub jwt_secret: String,

    // Chat
    pub history_default_limit: u32,
    pub history_max_limit: u32,

    // Logging
    pub log_json: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let history_max_limit = parse_or("CHAT_HISTORY_MAX_LIMIT", 100u32)?;
        if history_max_limit == 0 {
            return Err(ConfigError::Invalid(
                "CHAT_HISTORY_MAX_LIMIT",
                "must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:5000".to_string()),
            cors_allowed_origins: match env::var("CORS_ALLOWED_ORIGINS") {
                Ok(raw) => raw
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(String::from)
                    .collect(),
                Err(_) => DEFAULT_CORS_ORIGINS.iter().map(|s| s.to_string()).collect(),
            },

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 10)?,

            // Authentication
            jwt_secret: {
                let secret =
                    env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },

            // Chat
            history_default_limit: parse_or("CHAT_HISTORY_DEFAULT_LIMIT", 50u32)?
                .clamp(1, history_max_limit),
            history_max_limit,

            // Logging
            log_json: parse_or("LOG_JSON", false)?,
        })
    }

    pub fn history_limits(&self) -> HistoryLimits {
        HistoryLimits {
            default_limit: self.history_default_limit,
            max_limit: self.history_max_limit,
        }
    }
}

fn parse_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid(key, e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
