//! Presence broadcast
//!
//! Every presence change sends the *full* online-user snapshot to *every* registered
//! connection. Cost is O(online users) per change; incremental diffs are not attempted.

use edupulse_shared::UserProfile;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::directory::UserDirectory;
use super::presence::{PresenceChange, PresenceTracker};
use super::registry::ConnectionRegistry;
use crate::websocket::events::{OnlineUser, ServerEvent};

/// Outcome of one broadcast round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub online_users: usize,
    pub recipients: usize,
    pub failed: usize,
}

pub struct PresenceBroadcaster {
    registry: Arc<ConnectionRegistry>,
    tracker: Arc<PresenceTracker>,
    directory: Arc<dyn UserDirectory>,
    /// One round at a time, so an older snapshot can never arrive after a newer one
    round: Mutex<()>,
}

impl PresenceBroadcaster {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        tracker: Arc<PresenceTracker>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            registry,
            tracker,
            directory,
            round: Mutex::new(()),
        }
    }

    /// Current online users with directory projections, most recently seen first.
    pub async fn online_users(&self) -> Vec<OnlineUser> {
        let snapshot = self.tracker.snapshot().await;
        let user_ids: Vec<_> = snapshot.iter().map(|s| s.user_id).collect();

        let mut profiles = match self.directory.get_profiles(&user_ids).await {
            Ok(profiles) => profiles,
            Err(e) => {
                tracing::warn!(error = %e, "Profile lookup failed, using placeholders");
                HashMap::new()
            }
        };

        let mut users: Vec<OnlineUser> = snapshot
            .into_iter()
            .map(|state| {
                let profile = profiles
                    .remove(&state.user_id)
                    .unwrap_or_else(UserProfile::unknown);
                OnlineUser {
                    user_id: state.user_id,
                    name: profile.name,
                    role: profile.role,
                    avatar: profile.avatar,
                    last_seen: state.last_seen,
                }
            })
            .collect();
        users.sort_by_key(|u| (Reverse(u.last_seen), u.user_id));
        users
    }

    /// Recompute the snapshot and push it to every registered connection.
    pub async fn broadcast(&self, change: &PresenceChange) -> BroadcastReport {
        let _round = self.round.lock().await;

        let users = self.online_users().await;
        let online_users = users.len();
        let event = ServerEvent::OnlineUsers { users };

        let mut report = BroadcastReport {
            online_users,
            ..Default::default()
        };
        for conn in self.registry.connections().await {
            match conn.send(event.clone()) {
                Ok(()) => report.recipients += 1,
                Err(_) => {
                    report.failed += 1;
                    tracing::warn!(
                        connection_id = %conn.connection_id,
                        "Failed to send presence snapshot to connection (likely closed)"
                    );
                }
            }
        }

        tracing::debug!(
            user_id = %change.user_id,
            is_online = change.is_online,
            online_users = report.online_users,
            recipients = report.recipients,
            failed = report.failed,
            "Broadcast presence snapshot"
        );

        report
    }
}
