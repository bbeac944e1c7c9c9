//! In-process implementations of the storage boundaries
//!
//! Used by tests and by embedders that do not need durability.

use async_trait::async_trait;
use edupulse_shared::{
    ConversationSummary, Message, MessageId, NewMessage, PresenceState, PulseError, UserId,
    UserProfile,
};
use std::collections::HashMap;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};

use super::directory::UserDirectory;
use super::presence::PresenceStore;
use super::store::MessageStore;
use super::{system_clock, Clock};

// =============================================================================
// Messages
// =============================================================================

#[derive(Default)]
struct MessageLog {
    next_id: i64,
    last_created_at: Option<OffsetDateTime>,
    /// Sorted by id, and therefore by (created_at, id)
    messages: Vec<Message>,
}

/// Message store held in memory
pub struct MemoryMessageStore {
    log: Mutex<MessageLog>,
    clock: Clock,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            log: Mutex::new(MessageLog {
                next_id: 1,
                ..Default::default()
            }),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.log.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, message: NewMessage) -> Result<Message, PulseError> {
        message.validate()?;

        let mut log = self.log.lock().await;
        // Clamp so timestamps never decrease in id order
        let now = (self.clock)();
        let created_at = match log.last_created_at {
            Some(last) if last > now => last,
            _ => now,
        };
        let id = MessageId(log.next_id);
        log.next_id += 1;
        log.last_created_at = Some(created_at);

        let stored = Message {
            id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
            body: message.body,
            kind: message.kind,
            created_at,
        };
        log.messages.push(stored.clone());
        Ok(stored)
    }

    async fn history(
        &self,
        a: UserId,
        b: UserId,
        limit: u32,
        before_id: Option<MessageId>,
    ) -> Result<Vec<Message>, PulseError> {
        let log = self.log.lock().await;
        let end = match before_id {
            None => log.messages.len(),
            Some(cursor) => match log.messages.binary_search_by_key(&cursor, |m| m.id) {
                Ok(index) => index,
                Err(_) => return Ok(Vec::new()),
            },
        };

        let mut page: Vec<Message> = log.messages[..end]
            .iter()
            .rev()
            .filter(|m| m.is_between(a, b))
            .take(limit as usize)
            .cloned()
            .collect();
        page.reverse();
        Ok(page)
    }

    async fn conversations(&self, user_id: UserId) -> Result<Vec<ConversationSummary>, PulseError> {
        let log = self.log.lock().await;
        let mut by_peer: HashMap<UserId, ConversationSummary> = HashMap::new();

        for message in log
            .messages
            .iter()
            .filter(|m| m.sender_id == user_id || m.receiver_id == user_id)
        {
            let peer_id = message.peer_of(user_id);
            by_peer
                .entry(peer_id)
                .and_modify(|summary| {
                    summary.total_messages += 1;
                    summary.last_message = message.clone();
                })
                .or_insert_with(|| ConversationSummary {
                    peer_id,
                    last_message: message.clone(),
                    total_messages: 1,
                });
        }

        let mut summaries: Vec<_> = by_peer.into_values().collect();
        summaries.sort_by(|x, y| y.last_message.order_key().cmp(&x.last_message.order_key()));
        Ok(summaries)
    }
}

// =============================================================================
// Directory
// =============================================================================

/// Fixed table of user profiles
#[derive(Default)]
pub struct MemoryDirectory {
    profiles: RwLock<HashMap<UserId, UserProfile>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_profiles(profiles: impl IntoIterator<Item = (UserId, UserProfile)>) -> Self {
        Self {
            profiles: RwLock::new(profiles.into_iter().collect()),
        }
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn get_profile(&self, user_id: UserId) -> Result<Option<UserProfile>, PulseError> {
        Ok(self.profiles.read().await.get(&user_id).cloned())
    }

    async fn list_profiles(&self) -> Result<Vec<(UserId, UserProfile)>, PulseError> {
        let mut profiles: Vec<_> = self
            .profiles
            .read()
            .await
            .iter()
            .map(|(id, profile)| (*id, profile.clone()))
            .collect();
        profiles.sort_by(|(a_id, a), (b_id, b)| a.name.cmp(&b.name).then(a_id.cmp(b_id)));
        Ok(profiles)
    }
}

// =============================================================================
// Presence
// =============================================================================

/// Presence records held in memory
#[derive(Default)]
pub struct MemoryPresenceStore {
    records: RwLock<HashMap<UserId, PresenceState>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, user_id: &UserId) -> Option<PresenceState> {
        self.records.read().await.get(user_id).cloned()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn save(&self, state: &PresenceState) -> Result<(), PulseError> {
        self.records.write().await.insert(state.user_id, state.clone());
        Ok(())
    }

    async fn load(&self, user_ids: &[UserId]) -> Result<HashMap<UserId, PresenceState>, PulseError> {
        let records = self.records.read().await;
        Ok(user_ids
            .iter()
            .filter_map(|id| records.get(id).map(|state| (*id, state.clone())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edupulse_shared::MessageKind;
    use std::sync::Arc;

    fn fixed_clock() -> Clock {
        Arc::new(|| OffsetDateTime::UNIX_EPOCH)
    }

    fn text(from: UserId, to: UserId, body: &str) -> NewMessage {
        NewMessage::new(from, to, body, MessageKind::Text).unwrap()
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids() {
        let store = MemoryMessageStore::new();
        let a = UserId::new();
        let b = UserId::new();

        let first = store.append(text(a, b, "one")).await.unwrap();
        let second = store.append(text(b, a, "two")).await.unwrap();

        assert!(second.id > first.id);
        assert!(second.order_key() > first.order_key());
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_append_rejects_invalid_message() {
        let store = MemoryMessageStore::new();
        let message = NewMessage {
            sender_id: UserId::new(),
            receiver_id: UserId::new(),
            body: "   ".to_string(),
            kind: MessageKind::Text,
        };

        assert!(matches!(
            store.append(message).await,
            Err(PulseError::Validation(_))
        ));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_same_instant_orders_by_id() {
        let store = MemoryMessageStore::with_clock(fixed_clock());
        let a = UserId::new();
        let b = UserId::new();

        let m1 = store.append(text(a, b, "first")).await.unwrap();
        let m2 = store.append(text(b, a, "second")).await.unwrap();
        assert_eq!(m1.created_at, m2.created_at);

        let history = store.history(a, b, 50, None).await.unwrap();
        let ids: Vec<_> = history.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![m1.id, m2.id]);
    }

    #[tokio::test]
    async fn test_history_filters_pair_and_takes_latest() {
        let store = MemoryMessageStore::new();
        let a = UserId::new();
        let b = UserId::new();
        let c = UserId::new();

        for i in 0..5 {
            store.append(text(a, b, &format!("ab-{}", i))).await.unwrap();
            store.append(text(a, c, &format!("ac-{}", i))).await.unwrap();
        }

        let page = store.history(b, a, 3, None).await.unwrap();
        let bodies: Vec<_> = page.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["ab-2", "ab-3", "ab-4"]);
    }

    #[tokio::test]
    async fn test_history_pagination_with_cursor() {
        let store = MemoryMessageStore::new();
        let a = UserId::new();
        let b = UserId::new();

        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(store.append(text(a, b, &format!("m{}", i))).await.unwrap().id);
        }

        let latest = store.history(a, b, 2, None).await.unwrap();
        assert_eq!(latest[0].id, ids[4]);

        let older = store.history(a, b, 2, Some(latest[0].id)).await.unwrap();
        let older_ids: Vec<_> = older.iter().map(|m| m.id).collect();
        assert_eq!(older_ids, vec![ids[2], ids[3]]);

        let oldest = store.history(a, b, 10, Some(ids[0])).await.unwrap();
        assert!(oldest.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_cursor_yields_empty_page() {
        let store = MemoryMessageStore::new();
        let a = UserId::new();
        let b = UserId::new();
        store.append(text(a, b, "hi")).await.unwrap();

        let page = store.history(a, b, 10, Some(MessageId(999))).await.unwrap();
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn test_conversations_summary() {
        let store = MemoryMessageStore::new();
        let a = UserId::new();
        let b = UserId::new();
        let c = UserId::new();

        store.append(text(a, b, "to b")).await.unwrap();
        store.append(text(c, a, "from c")).await.unwrap();
        store.append(text(b, a, "from b")).await.unwrap();

        let summaries = store.conversations(a).await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].peer_id, b);
        assert_eq!(summaries[0].total_messages, 2);
        assert_eq!(summaries[0].last_message.body, "from b");
        assert_eq!(summaries[1].peer_id, c);
        assert_eq!(summaries[1].total_messages, 1);
    }

    #[tokio::test]
    async fn test_directory_lookup() {
        let known = UserId::new();
        let directory = MemoryDirectory::from_profiles([(
            known,
            UserProfile {
                name: "Asha".to_string(),
                role: "Student".to_string(),
                avatar: String::new(),
            },
        )]);

        assert_eq!(
            directory.get_profile(known).await.unwrap().unwrap().name,
            "Asha"
        );
        assert!(directory.get_profile(UserId::new()).await.unwrap().is_none());

        let profiles = directory
            .get_profiles(&[known, UserId::new()])
            .await
            .unwrap();
        assert_eq!(profiles.len(), 1);
    }
}
