//! WebSocket event types and serialization
//!
//! Defines all client-to-server and server-to-client event types
//! with type-safe serde serialization. Payloads are validated here,
//! before anything reaches the chat core.

use edupulse_shared::{
    ConnectionId, Message, MessageId, MessageKind, NewMessage, PulseError, UserId, UserProfile,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::chat::store::HistoryQuery;

// =============================================================================
// Client-to-Server Events
// =============================================================================

/// Events sent from client to server
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Explicit presence announcement after the transport connects
    AnnounceOnline { user_id: UserId },

    /// Send a direct message
    SendMessage(SendMessagePayload),

    /// Request a page of conversation history
    GetMessageHistory(HistoryRequest),

    /// Heartbeat ping to keep presence fresh
    Ping,
}

/// Raw `send_message` payload
///
/// Every field is optional so a missing one surfaces as a validation error
/// rather than an unparseable event.
#[derive(Debug, Default, Deserialize)]
pub struct SendMessagePayload {
    #[serde(default)]
    pub sender_id: Option<UserId>,
    #[serde(default)]
    pub receiver_id: Option<UserId>,
    #[serde(default, alias = "message")]
    pub body: Option<String>,
    #[serde(default)]
    pub message_type: Option<String>,
}

impl SendMessagePayload {
    /// Check the payload against the authenticated sender.
    pub fn validate(self, authenticated: UserId) -> Result<NewMessage, PulseError> {
        if let Some(claimed) = self.sender_id {
            if claimed != authenticated {
                return Err(PulseError::Auth(
                    "sender_id does not match the authenticated user".to_string(),
                ));
            }
        }
        let receiver_id = self
            .receiver_id
            .ok_or_else(|| PulseError::Validation("receiver_id is required".to_string()))?;
        let body = self
            .body
            .ok_or_else(|| PulseError::Validation("message body is required".to_string()))?;
        let kind = match self.message_type.as_deref() {
            None => MessageKind::default(),
            Some(raw) => raw.parse()?,
        };

        NewMessage::new(authenticated, receiver_id, &body, kind)
    }
}

/// Raw `get_message_history` payload
#[derive(Debug, Default, Deserialize)]
pub struct HistoryRequest {
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub other_user_id: Option<UserId>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub before_id: Option<MessageId>,
}

impl HistoryRequest {
    /// Users may only read conversations they take part in.
    pub fn validate(self, authenticated: UserId) -> Result<HistoryQuery, PulseError> {
        if let Some(claimed) = self.user_id {
            if claimed != authenticated {
                return Err(PulseError::Auth(
                    "cannot read another user's conversations".to_string(),
                ));
            }
        }
        let other_user_id = self
            .other_user_id
            .ok_or_else(|| PulseError::Validation("other_user_id is required".to_string()))?;

        Ok(HistoryQuery {
            user_id: authenticated,
            other_user_id,
            limit: self.limit,
            before_id: self.before_id,
        })
    }
}

// =============================================================================
// Server-to-Client Events
// =============================================================================

/// Events sent from server to client
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Connection acknowledged
    Connected {
        connection_id: ConnectionId,
        user_id: UserId,
    },

    /// Full snapshot of everyone currently online
    OnlineUsers { users: Vec<OnlineUser> },

    /// A message to or from this user
    NewMessage { message: EnrichedMessage },

    /// Response to `get_message_history`, oldest first
    MessageHistory {
        other_user_id: UserId,
        messages: Vec<EnrichedMessage>,
    },

    /// Another session for the same user took over; this socket is closing
    SessionReplaced,

    /// Heartbeat response
    Pong,

    /// Error message
    Error { code: String, message: String },
}

impl ServerEvent {
    /// Error event for the requesting connection. Storage details stay in the server log.
    pub fn error(err: &PulseError) -> Self {
        let message = match err {
            PulseError::Persistence(_) => "Storage is unavailable, please retry".to_string(),
            PulseError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };
        ServerEvent::Error {
            code: err.code().to_string(),
            message,
        }
    }
}

// =============================================================================
// Event Data Structures
// =============================================================================

/// Online user entry in a presence snapshot
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct OnlineUser {
    pub user_id: UserId,
    pub name: String,
    pub role: String,
    pub avatar: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

/// Display projection of a message participant
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct UserSummary {
    pub user_id: UserId,
    pub name: String,
    pub role: String,
    pub avatar: String,
}

impl UserSummary {
    pub fn from_profile(user_id: UserId, profile: UserProfile) -> Self {
        Self {
            user_id,
            name: profile.name,
            role: profile.role,
            avatar: profile.avatar,
        }
    }
}

/// Chat roster entry: another user with their last known presence
///
/// `last_seen` is absent for users who have never connected.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct ChatContact {
    pub user_id: UserId,
    pub name: String,
    pub role: String,
    pub avatar: String,
    pub is_online: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
}

/// Message together with sender/receiver projections
#[derive(Debug, Serialize, Clone)]
pub struct EnrichedMessage {
    #[serde(flatten)]
    pub message: Message,
    pub sender: UserSummary,
    pub receiver: UserSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_message_deserialization() {
        let json = r#"{"type":"send_message","receiver_id":"550e8400-e29b-41d4-a716-446655440000","body":"hi","message_type":"image"}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        match event {
            ClientEvent::SendMessage(payload) => {
                assert_eq!(
                    payload.receiver_id.unwrap().to_string(),
                    "550e8400-e29b-41d4-a716-446655440000"
                );
                assert_eq!(payload.body.as_deref(), Some("hi"));
                assert_eq!(payload.message_type.as_deref(), Some("image"));
            }
            _ => panic!("Expected SendMessage event"),
        }
    }

    #[test]
    fn test_legacy_message_field_is_accepted() {
        let json = r#"{"type":"send_message","receiver_id":"550e8400-e29b-41d4-a716-446655440000","message":"hello"}"#;
        let event: ClientEvent = serde_json::from_str(json).unwrap();
        let ClientEvent::SendMessage(payload) = event else {
            panic!("Expected SendMessage event");
        };
        assert_eq!(payload.body.as_deref(), Some("hello"));
    }

    #[test]
    fn test_send_payload_validation() {
        let me = UserId::new();
        let other = UserId::new();

        let missing_receiver = SendMessagePayload {
            body: Some("hi".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            missing_receiver.validate(me),
            Err(PulseError::Validation(_))
        ));

        let missing_body = SendMessagePayload {
            receiver_id: Some(other),
            ..Default::default()
        };
        assert!(matches!(missing_body.validate(me), Err(PulseError::Validation(_))));

        let spoofed = SendMessagePayload {
            sender_id: Some(other),
            receiver_id: Some(me),
            body: Some("hi".to_string()),
            message_type: None,
        };
        assert!(matches!(spoofed.validate(me), Err(PulseError::Auth(_))));

        let bad_kind = SendMessagePayload {
            receiver_id: Some(other),
            body: Some("hi".to_string()),
            message_type: Some("video".to_string()),
            ..Default::default()
        };
        assert!(matches!(bad_kind.validate(me), Err(PulseError::Validation(_))));

        let ok = SendMessagePayload {
            sender_id: Some(me),
            receiver_id: Some(other),
            body: Some(" hi ".to_string()),
            message_type: None,
        }
        .validate(me)
        .unwrap();
        assert_eq!(ok.body, "hi");
        assert_eq!(ok.kind, MessageKind::Text);
    }

    #[test]
    fn test_history_request_validation() {
        let me = UserId::new();
        let other = UserId::new();

        let query = HistoryRequest {
            user_id: Some(me),
            other_user_id: Some(other),
            limit: Some(10),
            before_id: Some(MessageId(42)),
        }
        .validate(me)
        .unwrap();
        assert_eq!(query.other_user_id, other);
        assert_eq!(query.limit, Some(10));

        let foreign = HistoryRequest {
            user_id: Some(other),
            other_user_id: Some(me),
            ..Default::default()
        };
        assert!(matches!(foreign.validate(me), Err(PulseError::Auth(_))));

        assert!(matches!(
            HistoryRequest::default().validate(me),
            Err(PulseError::Validation(_))
        ));
    }

    #[test]
    fn test_server_event_serialization() {
        let event = ServerEvent::Pong;
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);

        let json = serde_json::to_string(&ServerEvent::SessionReplaced).unwrap();
        assert_eq!(json, r#"{"type":"session_replaced"}"#);
    }

    #[test]
    fn test_error_event_serialization() {
        let event = ServerEvent::error(&PulseError::Validation("body missing".to_string()));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "validation_error");
        assert!(json["message"].as_str().unwrap().contains("body missing"));

        let event = ServerEvent::error(&PulseError::Persistence("relation does not exist".to_string()));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["code"], "persistence_failure");
        assert!(!json["message"].as_str().unwrap().contains("relation"));
    }

    #[test]
    fn test_new_message_event_flattens_message() {
        let sender = UserId::new();
        let receiver = UserId::new();
        let event = ServerEvent::NewMessage {
            message: EnrichedMessage {
                message: Message {
                    id: MessageId(3),
                    sender_id: sender,
                    receiver_id: receiver,
                    body: "hi".to_string(),
                    kind: MessageKind::Text,
                    created_at: OffsetDateTime::UNIX_EPOCH,
                },
                sender: UserSummary::from_profile(sender, UserProfile::unknown()),
                receiver: UserSummary::from_profile(receiver, UserProfile::unknown()),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "new_message");
        assert_eq!(json["message"]["type"], "text");
        assert_eq!(json["message"]["body"], "hi");
        assert_eq!(json["message"]["sender"]["name"], "Unknown");
    }
}
