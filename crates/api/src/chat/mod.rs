//! Presence-aware direct messaging
//!
//! # Architecture
//!
//! - **Registry**: authoritative user -> live connection binding (one per user)
//! - **Presence**: online/offline state and last-seen per user, with write-through persistence
//! - **Store**: append-only message persistence and paginated history
//! - **Delivery**: immediate push of new messages to recipient and sender
//! - **Broadcaster**: full online-user snapshot pushed to every connection on each change
//! - **Service**: connection lifecycle and per-user serialization tying the above together

pub mod broadcaster;
pub mod delivery;
pub mod directory;
pub mod memory;
pub mod presence;
pub mod registry;
pub mod service;
pub mod store;

use std::sync::Arc;
use time::OffsetDateTime;

pub use broadcaster::{BroadcastReport, PresenceBroadcaster};
pub use delivery::{DeliveryEngine, DeliveryReport};
pub use directory::{PgUserDirectory, UserDirectory};
pub use memory::{MemoryDirectory, MemoryMessageStore, MemoryPresenceStore};
pub use presence::{PgPresenceStore, PresenceChange, PresenceStore, PresenceTracker};
pub use registry::{ConnectionRegistry, RemoveOutcome};
pub use service::{ChatService, ConversationView, HistoryLimits};
pub use store::{HistoryQuery, MessageStore, PgMessageStore};

/// Source of wall-clock time, swappable in tests.
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(OffsetDateTime::now_utc)
}
