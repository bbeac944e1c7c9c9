//! Chat service
//!
//! Owns the registry, presence tracker, message store and delivery machinery, and
//! drives the connection lifecycle: `Absent -> Connected -> Absent`, where a new
//! connect for an already-connected user evicts the previous connection.
//!
//! Registry and presence transitions for one user run under that user's lock, so a
//! reconnect and the superseded connection's disconnect never interleave.

use edupulse_shared::{Message, NewMessage, PresenceState, PulseError, UserId, UserProfile};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::broadcaster::PresenceBroadcaster;
use super::delivery::DeliveryEngine;
use super::directory::UserDirectory;
use super::presence::{PresenceStore, PresenceTracker};
use super::registry::{ConnectionRegistry, RemoveOutcome};
use super::store::{HistoryQuery, MessageStore};
use crate::websocket::connection::Connection;
use crate::websocket::events::{ChatContact, EnrichedMessage, OnlineUser, UserSummary};

/// Page size rules for history requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryLimits {
    pub default_limit: u32,
    pub max_limit: u32,
}

impl HistoryLimits {
    /// Requested size, defaulted and clamped to `1..=max_limit`.
    pub fn resolve(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit.max(1))
    }
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            default_limit: 50,
            max_limit: 100,
        }
    }
}

/// Conversation list entry with the partner's display projection
#[derive(Debug, Clone, Serialize)]
pub struct ConversationView {
    pub peer: UserSummary,
    pub last_message: Message,
    pub total_messages: i64,
}

/// Lazily created async mutex per user
#[derive(Default)]
struct UserLocks {
    locks: StdMutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl UserLocks {
    async fn lock(&self, user_id: UserId) -> UserGuard<'_> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(locks.entry(user_id).or_default())
        };
        let guard = mutex.lock_owned().await;
        UserGuard {
            locks: self,
            user_id,
            guard: Some(guard),
        }
    }
}

struct UserGuard<'a> {
    locks: &'a UserLocks,
    user_id: UserId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Drop the entry once nobody else holds or waits on it
        let mut locks = self.locks.locks.lock().unwrap_or_else(|p| p.into_inner());
        if locks
            .get(&self.user_id)
            .is_some_and(|m| Arc::strong_count(m) == 1)
        {
            locks.remove(&self.user_id);
        }
    }
}

pub struct ChatService {
    registry: Arc<ConnectionRegistry>,
    tracker: Arc<PresenceTracker>,
    store: Arc<dyn MessageStore>,
    directory: Arc<dyn UserDirectory>,
    delivery: DeliveryEngine,
    broadcaster: PresenceBroadcaster,
    limits: HistoryLimits,
    user_locks: UserLocks,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn UserDirectory>,
        presence_store: Arc<dyn PresenceStore>,
        limits: HistoryLimits,
    ) -> Self {
        Self::with_tracker(store, directory, PresenceTracker::new(presence_store), limits)
    }

    pub fn with_tracker(
        store: Arc<dyn MessageStore>,
        directory: Arc<dyn UserDirectory>,
        tracker: PresenceTracker,
        limits: HistoryLimits,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let tracker = Arc::new(tracker);

        Self {
            delivery: DeliveryEngine::new(Arc::clone(&registry), Arc::clone(&directory)),
            broadcaster: PresenceBroadcaster::new(
                Arc::clone(&registry),
                Arc::clone(&tracker),
                Arc::clone(&directory),
            ),
            registry,
            tracker,
            store,
            directory,
            limits,
            user_locks: UserLocks::default(),
        }
    }

    pub fn limits(&self) -> HistoryLimits {
        self.limits
    }

    /// Whether the directory knows `user_id`; sockets for unknown users are refused.
    pub async fn user_exists(&self, user_id: UserId) -> Result<bool, PulseError> {
        Ok(self.directory.get_profile(user_id).await?.is_some())
    }

    /// Register a new connection, evicting any previous one, and announce the user online.
    pub async fn connect(&self, conn: Arc<Connection>) {
        let change = {
            let _guard = self.user_locks.lock(conn.user_id).await;
            if let Some(evicted) = self.registry.register(Arc::clone(&conn)).await {
                tracing::info!(
                    user_id = %conn.user_id,
                    connection_id = %conn.connection_id,
                    evicted_connection_id = %evicted.connection_id,
                    "Replacing existing session"
                );
                evicted.evict();
            }
            self.tracker
                .mark_online(conn.user_id, conn.connection_id)
                .await
        };

        self.broadcaster.broadcast(&change).await;
    }

    /// Re-assert presence for a connection that is still current.
    ///
    /// Evicted connections cannot reclaim the user; their announcements are ignored.
    pub async fn announce_online(&self, conn: &Connection) {
        let change = {
            let _guard = self.user_locks.lock(conn.user_id).await;
            match self.registry.lookup(&conn.user_id).await {
                Some(current) if current.connection_id == conn.connection_id => Some(
                    self.tracker
                        .mark_online(conn.user_id, conn.connection_id)
                        .await,
                ),
                _ => None,
            }
        };

        match change {
            Some(change) => {
                self.broadcaster.broadcast(&change).await;
            }
            None => tracing::debug!(
                user_id = %conn.user_id,
                connection_id = %conn.connection_id,
                "Ignoring announcement from superseded connection"
            ),
        }
    }

    /// Tear down a connection. A no-op for connections that were already replaced.
    pub async fn disconnect(&self, conn: &Connection) {
        let change = {
            let _guard = self.user_locks.lock(conn.user_id).await;
            if let RemoveOutcome::Stale = self.registry.remove(&conn.connection_id).await {
                tracing::debug!(
                    user_id = %conn.user_id,
                    connection_id = %conn.connection_id,
                    "Disconnect of superseded connection"
                );
            }
            self.tracker
                .mark_offline(conn.user_id, conn.connection_id)
                .await
        };

        if let Some(change) = change {
            self.broadcaster.broadcast(&change).await;
        }
    }

    /// Heartbeat from a connection: refresh last-seen without a broadcast.
    pub async fn touch(&self, conn: &Connection) -> bool {
        let _guard = self.user_locks.lock(conn.user_id).await;
        self.tracker.touch(conn.user_id, conn.connection_id).await
    }

    /// Persist a validated message, then push it live.
    ///
    /// A storage failure is returned without any delivery attempt.
    pub async fn send_message(&self, message: NewMessage) -> Result<Message, PulseError> {
        let sender_id = message.sender_id;
        let receiver_id = message.receiver_id;

        let stored = match self.store.append(message).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    sender_id = %sender_id,
                    receiver_id = %receiver_id,
                    "Failed to persist message, not delivered"
                );
                return Err(e);
            }
        };

        let report = self.delivery.deliver(&stored).await;
        tracing::info!(
            message_id = %stored.id,
            sender_id = %sender_id,
            receiver_id = %receiver_id,
            delivered = report.to_receiver,
            echoed = report.echoed,
            "Message sent"
        );

        Ok(stored)
    }

    /// A page of the conversation between the requester and another user, oldest first.
    ///
    /// Unknown partners yield an empty page.
    pub async fn history(&self, query: HistoryQuery) -> Result<Vec<EnrichedMessage>, PulseError> {
        if self
            .directory
            .get_profile(query.other_user_id)
            .await?
            .is_none()
        {
            tracing::debug!(
                user_id = %query.user_id,
                other_user_id = %query.other_user_id,
                "History requested for unknown user"
            );
            return Ok(Vec::new());
        }

        let limit = self.limits.resolve(query.limit);
        let messages = self
            .store
            .history(query.user_id, query.other_user_id, limit, query.before_id)
            .await
            .map_err(|e| {
                tracing::error!(
                    error = %e,
                    user_id = %query.user_id,
                    other_user_id = %query.other_user_id,
                    "Failed to load message history"
                );
                e
            })?;

        Ok(self.delivery.enrich(&messages).await)
    }

    /// Conversation partners of `user_id`, most recent first.
    pub async fn conversations(&self, user_id: UserId) -> Result<Vec<ConversationView>, PulseError> {
        let summaries = self.store.conversations(user_id).await?;
        let peer_ids: Vec<UserId> = summaries.iter().map(|s| s.peer_id).collect();
        let mut profiles = self.directory.get_profiles(&peer_ids).await?;

        Ok(summaries
            .into_iter()
            .map(|s| ConversationView {
                peer: UserSummary::from_profile(
                    s.peer_id,
                    profiles
                        .remove(&s.peer_id)
                        .unwrap_or_else(UserProfile::unknown),
                ),
                last_message: s.last_message,
                total_messages: s.total_messages,
            })
            .collect())
    }

    /// Everyone except `user_id`, by name, with online flag and last-seen.
    pub async fn chat_users(&self, user_id: UserId) -> Result<Vec<ChatContact>, PulseError> {
        let profiles: Vec<(UserId, UserProfile)> = self
            .directory
            .list_profiles()
            .await?
            .into_iter()
            .filter(|(id, _)| *id != user_id)
            .collect();
        let ids: Vec<UserId> = profiles.iter().map(|(id, _)| *id).collect();
        let mut presence = self.tracker.last_known(&ids).await?;

        Ok(profiles
            .into_iter()
            .map(|(id, profile)| {
                let state = presence.remove(&id);
                ChatContact {
                    user_id: id,
                    name: profile.name,
                    role: profile.role,
                    avatar: profile.avatar,
                    is_online: state.as_ref().is_some_and(|s| s.is_online),
                    last_seen: state.map(|s| s.last_seen),
                }
            })
            .collect())
    }

    pub async fn online_users(&self) -> Vec<OnlineUser> {
        self.broadcaster.online_users().await
    }

    pub async fn presence(&self, user_id: &UserId) -> Option<PresenceState> {
        self.tracker.state(user_id).await
    }

    pub async fn current_connection(&self, user_id: &UserId) -> Option<Arc<Connection>> {
        self.registry.lookup(user_id).await
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::memory::{MemoryDirectory, MemoryMessageStore, MemoryPresenceStore};
    use crate::websocket::events::ServerEvent;
    use async_trait::async_trait;
    use edupulse_shared::{ConversationSummary, MessageId, MessageKind};
    use tokio::sync::mpsc;

    struct BrokenStore;

    #[async_trait]
    impl MessageStore for BrokenStore {
        async fn append(&self, _message: NewMessage) -> Result<Message, PulseError> {
            Err(PulseError::Persistence("connection reset".to_string()))
        }

        async fn history(
            &self,
            _a: UserId,
            _b: UserId,
            _limit: u32,
            _before_id: Option<MessageId>,
        ) -> Result<Vec<Message>, PulseError> {
            Err(PulseError::Persistence("connection reset".to_string()))
        }

        async fn conversations(
            &self,
            _user_id: UserId,
        ) -> Result<Vec<ConversationSummary>, PulseError> {
            Ok(Vec::new())
        }
    }

    fn profile(name: &str) -> UserProfile {
        UserProfile {
            name: name.to_string(),
            role: "Student".to_string(),
            avatar: String::new(),
        }
    }

    fn service_with(store: Arc<dyn MessageStore>, users: &[UserId]) -> ChatService {
        let directory = MemoryDirectory::from_profiles(
            users.iter().map(|u| (*u, profile(&u.to_string()))),
        );
        ChatService::new(
            store,
            Arc::new(directory),
            Arc::new(MemoryPresenceStore::new()),
            HistoryLimits::default(),
        )
    }

    fn connection(user_id: UserId) -> (Arc<Connection>, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Connection::new(user_id, tx)), rx)
    }

    #[test]
    fn test_history_limits_resolve() {
        let limits = HistoryLimits::default();
        assert_eq!(limits.resolve(None), 50);
        assert_eq!(limits.resolve(Some(0)), 1);
        assert_eq!(limits.resolve(Some(20)), 20);
        assert_eq!(limits.resolve(Some(10_000)), 100);
    }

    #[tokio::test]
    async fn test_connect_evicts_previous_connection() {
        let user = UserId::new();
        let service = service_with(Arc::new(MemoryMessageStore::new()), &[user]);
        let (c1, mut rx1) = connection(user);
        let (c2, _rx2) = connection(user);

        service.connect(Arc::clone(&c1)).await;
        service.connect(Arc::clone(&c2)).await;

        let mut saw_replaced = false;
        while let Ok(event) = rx1.try_recv() {
            if matches!(event, ServerEvent::SessionReplaced) {
                saw_replaced = true;
            }
        }
        assert!(saw_replaced);

        // Old connection's disconnect arrives late
        service.disconnect(&c1).await;

        let state = service.presence(&user).await.unwrap();
        assert!(state.is_online);
        assert_eq!(state.current_connection_id, Some(c2.connection_id));
        assert_eq!(
            service.current_connection(&user).await.unwrap().connection_id,
            c2.connection_id
        );
    }

    #[tokio::test]
    async fn test_disconnect_marks_offline() {
        let user = UserId::new();
        let service = service_with(Arc::new(MemoryMessageStore::new()), &[user]);
        let (conn, _rx) = connection(user);

        service.connect(Arc::clone(&conn)).await;
        assert_eq!(service.online_users().await.len(), 1);

        service.disconnect(&conn).await;
        assert!(service.online_users().await.is_empty());
        assert!(!service.presence(&user).await.unwrap().is_online);
        assert_eq!(service.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_announce_from_evicted_connection_is_ignored() {
        let user = UserId::new();
        let service = service_with(Arc::new(MemoryMessageStore::new()), &[user]);
        let (c1, _rx1) = connection(user);
        let (c2, _rx2) = connection(user);

        service.connect(Arc::clone(&c1)).await;
        service.connect(Arc::clone(&c2)).await;
        service.announce_online(&c1).await;

        assert_eq!(
            service.presence(&user).await.unwrap().current_connection_id,
            Some(c2.connection_id)
        );
    }

    #[tokio::test]
    async fn test_persistence_failure_is_not_delivered() {
        let a = UserId::new();
        let b = UserId::new();
        let service = service_with(Arc::new(BrokenStore), &[a, b]);
        let (ca, mut rx_a) = connection(a);
        let (cb, mut rx_b) = connection(b);
        service.connect(ca).await;
        service.connect(cb).await;
        while rx_a.try_recv().is_ok() {}
        while rx_b.try_recv().is_ok() {}

        let result = service
            .send_message(NewMessage::new(a, b, "hi", MessageKind::Text).unwrap())
            .await;

        assert!(matches!(result, Err(PulseError::Persistence(_))));
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_history_for_unknown_user_is_empty() {
        let a = UserId::new();
        let service = service_with(Arc::new(BrokenStore), &[a]);

        // The store would fail, but the unknown partner short-circuits first
        let page = service
            .history(HistoryQuery {
                user_id: a,
                other_user_id: UserId::new(),
                limit: None,
                before_id: None,
            })
            .await
            .unwrap();
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn test_conversations_are_enriched() {
        let a = UserId::new();
        let b = UserId::new();
        let service = service_with(Arc::new(MemoryMessageStore::new()), &[a, b]);

        service
            .send_message(NewMessage::new(a, b, "hello", MessageKind::Text).unwrap())
            .await
            .unwrap();

        let conversations = service.conversations(a).await.unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].peer.user_id, b);
        assert_eq!(conversations[0].peer.name, b.to_string());
        assert_eq!(conversations[0].total_messages, 1);
    }

    #[tokio::test]
    async fn test_user_locks_are_released() {
        let locks = UserLocks::default();
        let user = UserId::new();
        {
            let _guard = locks.lock(user).await;
            assert_eq!(locks.locks.lock().unwrap().len(), 1);
        }
        assert!(locks.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chat_users_excludes_caller_and_reports_presence() {
        let caller = UserId::new();
        let online = UserId::new();
        let departed = UserId::new();
        let never = UserId::new();
        let directory = MemoryDirectory::from_profiles([
            (caller, profile("Asha")),
            (online, profile("Dara")),
            (departed, profile("Bilal")),
            (never, profile("Chen")),
        ]);
        let service = ChatService::new(
            Arc::new(MemoryMessageStore::new()),
            Arc::new(directory),
            Arc::new(MemoryPresenceStore::new()),
            HistoryLimits::default(),
        );

        let (c_online, _rx1) = connection(online);
        let (c_departed, _rx2) = connection(departed);
        service.connect(c_online).await;
        service.connect(Arc::clone(&c_departed)).await;
        service.disconnect(&c_departed).await;

        let roster = service.chat_users(caller).await.unwrap();
        let names: Vec<_> = roster.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Bilal", "Chen", "Dara"]);

        assert!(!roster[0].is_online);
        assert!(roster[0].last_seen.is_some());
        assert!(!roster[1].is_online);
        assert!(roster[1].last_seen.is_none());
        assert!(roster[2].is_online);
    }
}
