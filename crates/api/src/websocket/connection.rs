//! WebSocket connection handle
//!
//! Represents one authenticated WebSocket session bound to a single user.

use edupulse_shared::{ConnectionId, UserId};
use tokio::sync::{mpsc, Notify};

use super::events::ServerEvent;

/// Represents an active WebSocket connection
#[derive(Debug)]
pub struct Connection {
    /// Unique ID for this connection
    pub connection_id: ConnectionId,

    /// Authenticated user ID
    pub user_id: UserId,

    /// Channel to send events to this connection's writer task
    sender: mpsc::UnboundedSender<ServerEvent>,

    /// Signalled when a newer connection for the same user takes over
    evicted: Notify,
}

impl Connection {
    /// Create a new connection
    pub fn new(user_id: UserId, sender: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            connection_id: ConnectionId::new(),
            user_id,
            sender,
            evicted: Notify::new(),
        }
    }

    /// Send an event to this connection
    ///
    /// Returns Ok(()) if queued, Err if the writer side is gone
    #[allow(clippy::result_large_err)] // Error type is from tokio mpsc, containing the failed event
    pub fn send(&self, event: ServerEvent) -> Result<(), mpsc::error::SendError<ServerEvent>> {
        self.sender.send(event)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Tell the client it was replaced and wake the reader loop so it shuts down.
    pub fn evict(&self) {
        let _ = self.sender.send(ServerEvent::SessionReplaced);
        // notify_one stores a permit, so a reader that is not yet waiting still sees it
        self.evicted.notify_one();
    }

    /// Resolves once `evict` has been called.
    pub async fn evicted(&self) {
        self.evicted.notified().await;
    }
}
