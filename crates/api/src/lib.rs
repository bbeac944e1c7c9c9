//! EduPulse messaging API
//!
//! Real-time direct messaging and presence for the EduPulse platform: a WebSocket
//! transport, the chat core behind it, and a small read-only REST surface.

pub mod auth;
pub mod chat;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod websocket;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
