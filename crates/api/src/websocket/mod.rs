//! WebSocket transport for chat and presence
//!
//! # Architecture
//!
//! - **Connection**: One authenticated socket bound to a single user
//! - **Events**: Type-safe client/server event definitions
//! - **Handler**: Axum upgrade route, reader loop and writer task
//!
//! Connection lifecycle, delivery and presence live in [`crate::chat`]; this module
//! only moves events between sockets and the chat service.

pub mod connection;
pub mod events;
pub mod handler;

pub use handler::ws_handler;
