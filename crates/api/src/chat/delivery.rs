//! Live delivery of new messages
//!
//! Fire-and-forget: one push attempt to the receiver's current connection and one
//! echo to the sender's. Offline receivers pick the message up through history.

use edupulse_shared::{Message, UserId, UserProfile};
use std::collections::HashMap;
use std::sync::Arc;

use super::directory::UserDirectory;
use super::registry::ConnectionRegistry;
use crate::websocket::connection::Connection;
use crate::websocket::events::{EnrichedMessage, ServerEvent, UserSummary};

/// Which pushes were queued for a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub to_receiver: bool,
    pub echoed: bool,
}

pub struct DeliveryEngine {
    registry: Arc<ConnectionRegistry>,
    directory: Arc<dyn UserDirectory>,
}

impl DeliveryEngine {
    pub fn new(registry: Arc<ConnectionRegistry>, directory: Arc<dyn UserDirectory>) -> Self {
        Self {
            registry,
            directory,
        }
    }

    /// Push a freshly stored message to the receiver (if online) and back to the sender.
    pub async fn deliver(&self, message: &Message) -> DeliveryReport {
        let Some(enriched) = self.enrich(std::slice::from_ref(message)).await.pop() else {
            return DeliveryReport::default();
        };
        let event = ServerEvent::NewMessage { message: enriched };
        let mut report = DeliveryReport::default();

        match self.registry.lookup(&message.receiver_id).await {
            Some(conn) => report.to_receiver = push(&conn, event.clone(), message),
            None => {
                tracing::debug!(
                    message_id = %message.id,
                    receiver_id = %message.receiver_id,
                    "Receiver offline, message available through history"
                );
            }
        }

        // A note to self lands on the same connection; push it once
        if message.sender_id == message.receiver_id {
            report.echoed = report.to_receiver;
            return report;
        }

        if let Some(conn) = self.registry.lookup(&message.sender_id).await {
            report.echoed = push(&conn, event, message);
        }

        report
    }

    /// Attach sender/receiver display projections.
    ///
    /// Directory failures degrade to placeholder profiles rather than failing delivery.
    pub async fn enrich(&self, messages: &[Message]) -> Vec<EnrichedMessage> {
        let mut user_ids: Vec<UserId> = messages
            .iter()
            .flat_map(|m| [m.sender_id, m.receiver_id])
            .collect();
        user_ids.sort();
        user_ids.dedup();

        let profiles = match self.directory.get_profiles(&user_ids).await {
            Ok(profiles) => profiles,
            Err(e) => {
                tracing::warn!(error = %e, "Profile lookup failed, using placeholders");
                HashMap::new()
            }
        };

        messages
            .iter()
            .map(|m| EnrichedMessage {
                message: m.clone(),
                sender: summary(&profiles, m.sender_id),
                receiver: summary(&profiles, m.receiver_id),
            })
            .collect()
    }
}

fn summary(profiles: &HashMap<UserId, UserProfile>, user_id: UserId) -> UserSummary {
    let profile = profiles
        .get(&user_id)
        .cloned()
        .unwrap_or_else(UserProfile::unknown);
    UserSummary::from_profile(user_id, profile)
}

fn push(conn: &Connection, event: ServerEvent, message: &Message) -> bool {
    match conn.send(event) {
        Ok(()) => {
            tracing::debug!(
                message_id = %message.id,
                connection_id = %conn.connection_id,
                user_id = %conn.user_id,
                "Message pushed"
            );
            true
        }
        Err(_) => {
            tracing::warn!(
                message_id = %message.id,
                connection_id = %conn.connection_id,
                "Failed to push message to connection (likely closed)"
            );
            false
        }
    }
}
