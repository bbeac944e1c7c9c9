//! Common types used across EduPulse messaging

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::PulseError;

/// Longest accepted message body, counted in characters after trimming.
pub const MAX_MESSAGE_BODY_CHARS: usize = 1000;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
///
/// Opaque and issued by the identity provider; this service never mints them
/// outside of tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Connection ID wrapper, one per live WebSocket session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ConnectionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Message ID, assigned by the store in append order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Kind of content a message body carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "image" => Ok(MessageKind::Image),
            "file" => Ok(MessageKind::File),
            other => Err(PulseError::Validation(format!(
                "unknown message type '{}', expected text, image or file",
                other
            ))),
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

/// A message that passed validation and is ready to be appended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: String,
    pub kind: MessageKind,
}

impl NewMessage {
    /// Build a message, trimming the body and checking it against the length rules.
    pub fn new(
        sender_id: UserId,
        receiver_id: UserId,
        body: &str,
        kind: MessageKind,
    ) -> Result<Self, PulseError> {
        let message = Self {
            sender_id,
            receiver_id,
            body: body.trim().to_string(),
            kind,
        };
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<(), PulseError> {
        if self.body.trim().is_empty() {
            return Err(PulseError::Validation("message body is required".to_string()));
        }
        if self.body.chars().count() > MAX_MESSAGE_BODY_CHARS {
            return Err(PulseError::Validation(format!(
                "message body exceeds {} characters",
                MAX_MESSAGE_BODY_CHARS
            )));
        }
        Ok(())
    }
}

/// A persisted, immutable direct message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub body: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Message {
    /// Total order key for history: timestamp first, id breaks ties.
    pub fn order_key(&self) -> (OffsetDateTime, MessageId) {
        (self.created_at, self.id)
    }

    /// Whether this message belongs to the conversation between `a` and `b`.
    pub fn is_between(&self, a: UserId, b: UserId) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }

    /// The other participant, seen from `user_id`.
    pub fn peer_of(&self, user_id: UserId) -> UserId {
        if self.sender_id == user_id {
            self.receiver_id
        } else {
            self.sender_id
        }
    }
}

/// Latest activity in one conversation, seen from one participant
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub peer_id: UserId,
    pub last_message: Message,
    pub total_messages: i64,
}

// =============================================================================
// Users and Presence
// =============================================================================

/// Display projection supplied by the user directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
    pub role: String,
    pub avatar: String,
}

impl UserProfile {
    /// Placeholder for users the directory cannot resolve.
    pub fn unknown() -> Self {
        Self {
            name: "Unknown".to_string(),
            role: String::new(),
            avatar: String::new(),
        }
    }
}

/// Online state for one user
///
/// Kept after disconnect so `last_seen` survives; only the tracker mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceState {
    pub user_id: UserId,
    pub is_online: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub current_connection_id: Option<ConnectionId>,
}
