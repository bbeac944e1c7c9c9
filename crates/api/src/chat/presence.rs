//! Presence tracking
//!
//! Derives each user's online state from connection lifecycle events. The in-memory
//! map is authoritative; every transition is written through to a [`PresenceStore`]
//! so last-seen survives restarts.

use async_trait::async_trait;
use edupulse_shared::{ConnectionId, PresenceState, PulseError, UserId};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{system_clock, Clock};

/// Durable sink for presence records
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn save(&self, state: &PresenceState) -> Result<(), PulseError>;

    /// Last stored record for each of `user_ids`. Users never seen are absent.
    async fn load(&self, user_ids: &[UserId]) -> Result<HashMap<UserId, PresenceState>, PulseError>;
}

/// Presence persistence backed by the `user_presence` table
#[derive(Clone)]
pub struct PgPresenceStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct PresenceRow {
    user_id: Uuid,
    is_online: bool,
    last_seen_at: OffsetDateTime,
    connection_id: Option<Uuid>,
}

impl PgPresenceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Mark every stored user offline.
    ///
    /// Run at startup: connections never outlive the process that accepted them.
    pub async fn reset_all_offline(&self) -> Result<u64, PulseError> {
        let result = sqlx::query(
            r#"
            UPDATE user_presence
            SET is_online = FALSE, connection_id = NULL, updated_at = NOW()
            WHERE is_online
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PresenceStore for PgPresenceStore {
    async fn save(&self, state: &PresenceState) -> Result<(), PulseError> {
        sqlx::query(
            r#"
            INSERT INTO user_presence (user_id, is_online, last_seen_at, connection_id, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
              is_online = EXCLUDED.is_online,
              last_seen_at = GREATEST(user_presence.last_seen_at, EXCLUDED.last_seen_at),
              connection_id = EXCLUDED.connection_id,
              updated_at = NOW()
            "#,
        )
        .bind(state.user_id.0)
        .bind(state.is_online)
        .bind(state.last_seen)
        .bind(state.current_connection_id.map(|c| c.0))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load(&self, user_ids: &[UserId]) -> Result<HashMap<UserId, PresenceState>, PulseError> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let ids: Vec<Uuid> = user_ids.iter().map(|u| u.0).collect();
        let rows = sqlx::query_as::<_, PresenceRow>(
            r#"
            SELECT user_id, is_online, last_seen_at, connection_id
            FROM user_presence
            WHERE user_id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let state = PresenceState {
                    user_id: UserId(row.user_id),
                    is_online: row.is_online,
                    last_seen: row.last_seen_at,
                    current_connection_id: row.connection_id.map(ConnectionId),
                };
                (state.user_id, state)
            })
            .collect())
    }
}

/// Notification that a user's presence changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen: OffsetDateTime,
}

impl From<&PresenceState> for PresenceChange {
    fn from(state: &PresenceState) -> Self {
        Self {
            user_id: state.user_id,
            is_online: state.is_online,
            last_seen: state.last_seen,
        }
    }
}

/// Per-user presence state
pub struct PresenceTracker {
    states: RwLock<HashMap<UserId, PresenceState>>,
    store: Arc<dyn PresenceStore>,
    clock: Clock,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn PresenceStore>) -> Self {
        Self::with_clock(store, system_clock())
    }

    pub fn with_clock(store: Arc<dyn PresenceStore>, clock: Clock) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            store,
            clock,
        }
    }

    /// Record `connection_id` as the user's live connection.
    pub async fn mark_online(&self, user_id: UserId, connection_id: ConnectionId) -> PresenceChange {
        let state = {
            let mut states = self.states.write().await;
            let last_seen = self.next_last_seen(states.get(&user_id));
            let state = states.entry(user_id).or_insert_with(|| PresenceState {
                user_id,
                is_online: false,
                last_seen,
                current_connection_id: None,
            });
            state.is_online = true;
            state.current_connection_id = Some(connection_id);
            state.last_seen = last_seen;
            state.clone()
        };

        tracing::info!(user_id = %user_id, connection_id = %connection_id, "User online");
        self.persist(&state).await;
        PresenceChange::from(&state)
    }

    /// Mark the user offline if `connection_id` is still their live connection.
    ///
    /// Returns `None` for disconnects of superseded connections.
    pub async fn mark_offline(
        &self,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Option<PresenceChange> {
        let state = {
            let mut states = self.states.write().await;
            let last_seen = self.next_last_seen(states.get(&user_id));
            let state = states.get_mut(&user_id)?;
            if state.current_connection_id != Some(connection_id) {
                tracing::debug!(
                    user_id = %user_id,
                    connection_id = %connection_id,
                    "Ignoring offline transition for superseded connection"
                );
                return None;
            }
            state.is_online = false;
            state.current_connection_id = None;
            state.last_seen = last_seen;
            state.clone()
        };

        tracing::info!(user_id = %user_id, connection_id = %connection_id, "User offline");
        self.persist(&state).await;
        Some(PresenceChange::from(&state))
    }

    /// Refresh last-seen for a live connection without emitting a change.
    pub async fn touch(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let state = {
            let mut states = self.states.write().await;
            let last_seen = self.next_last_seen(states.get(&user_id));
            match states.get_mut(&user_id) {
                Some(state) if state.current_connection_id == Some(connection_id) => {
                    state.last_seen = last_seen;
                    state.clone()
                }
                _ => return false,
            }
        };

        self.persist(&state).await;
        true
    }

    /// Every user currently online
    pub async fn snapshot(&self) -> Vec<PresenceState> {
        let states = self.states.read().await;
        states.values().filter(|s| s.is_online).cloned().collect()
    }

    pub async fn state(&self, user_id: &UserId) -> Option<PresenceState> {
        self.states.read().await.get(user_id).cloned()
    }

    /// Presence for each of `user_ids`: the live entry when this process has one,
    /// otherwise the stored record, which is always offline since its socket is gone.
    pub async fn last_known(
        &self,
        user_ids: &[UserId],
    ) -> Result<HashMap<UserId, PresenceState>, PulseError> {
        let mut known: HashMap<UserId, PresenceState> = {
            let states = self.states.read().await;
            user_ids
                .iter()
                .filter_map(|id| states.get(id).map(|state| (*id, state.clone())))
                .collect()
        };

        let missing: Vec<UserId> = user_ids
            .iter()
            .filter(|id| !known.contains_key(id))
            .copied()
            .collect();
        if missing.is_empty() {
            return Ok(known);
        }

        for (user_id, mut state) in self.store.load(&missing).await? {
            state.is_online = false;
            state.current_connection_id = None;
            known.insert(user_id, state);
        }
        Ok(known)
    }

    fn next_last_seen(&self, previous: Option<&PresenceState>) -> OffsetDateTime {
        let now = (self.clock)();
        match previous {
            Some(state) if state.last_seen > now => state.last_seen,
            _ => now,
        }
    }

    async fn persist(&self, state: &PresenceState) {
        if let Err(e) = self.store.save(state).await {
            tracing::error!(
                error = %e,
                user_id = %state.user_id,
                is_online = state.is_online,
                "Failed to persist presence"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::memory::MemoryPresenceStore;
    use std::sync::atomic::{AtomicI64, Ordering};
    use time::Duration;

    /// Clock that returns a scripted sequence of offsets (seconds) from the epoch.
    fn scripted_clock(offsets: Vec<i64>) -> Clock {
        let index = AtomicI64::new(0);
        Arc::new(move || {
            let i = index.fetch_add(1, Ordering::SeqCst) as usize;
            let secs = offsets.get(i).copied().unwrap_or(0);
            OffsetDateTime::UNIX_EPOCH + Duration::seconds(secs)
        })
    }

    struct FailingStore;

    #[async_trait]
    impl PresenceStore for FailingStore {
        async fn save(&self, _state: &PresenceState) -> Result<(), PulseError> {
            Err(PulseError::Persistence("disk full".to_string()))
        }

        async fn load(
            &self,
            _user_ids: &[UserId],
        ) -> Result<HashMap<UserId, PresenceState>, PulseError> {
            Err(PulseError::Persistence("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn test_online_then_offline() {
        let store = Arc::new(MemoryPresenceStore::new());
        let tracker = PresenceTracker::new(store.clone());
        let user_id = UserId::new();
        let conn = ConnectionId::new();

        let change = tracker.mark_online(user_id, conn).await;
        assert!(change.is_online);
        assert_eq!(tracker.snapshot().await.len(), 1);

        let change = tracker.mark_offline(user_id, conn).await.unwrap();
        assert!(!change.is_online);
        assert!(tracker.snapshot().await.is_empty());

        let state = tracker.state(&user_id).await.unwrap();
        assert!(!state.is_online);
        assert_eq!(state.current_connection_id, None);

        // State is written through
        let persisted = store.get(&user_id).await.unwrap();
        assert!(!persisted.is_online);
    }

    #[tokio::test]
    async fn test_stale_offline_is_ignored() {
        let tracker = PresenceTracker::new(Arc::new(MemoryPresenceStore::new()));
        let user_id = UserId::new();
        let c1 = ConnectionId::new();
        let c2 = ConnectionId::new();

        tracker.mark_online(user_id, c1).await;
        tracker.mark_online(user_id, c2).await;

        assert!(tracker.mark_offline(user_id, c1).await.is_none());

        let state = tracker.state(&user_id).await.unwrap();
        assert!(state.is_online);
        assert_eq!(state.current_connection_id, Some(c2));
    }

    #[tokio::test]
    async fn test_offline_for_unknown_user_is_ignored() {
        let tracker = PresenceTracker::new(Arc::new(MemoryPresenceStore::new()));
        assert!(tracker
            .mark_offline(UserId::new(), ConnectionId::new())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_last_seen_never_moves_backwards() {
        let clock = scripted_clock(vec![100, 50, 10, 200]);
        let tracker =
            PresenceTracker::with_clock(Arc::new(MemoryPresenceStore::new()), clock);
        let user_id = UserId::new();
        let conn = ConnectionId::new();

        let online = tracker.mark_online(user_id, conn).await;
        assert_eq!(online.last_seen.unix_timestamp(), 100);

        // Clock stepped back to 50
        assert!(tracker.touch(user_id, conn).await);
        assert_eq!(tracker.state(&user_id).await.unwrap().last_seen.unix_timestamp(), 100);

        // And to 10
        let offline = tracker.mark_offline(user_id, conn).await.unwrap();
        assert_eq!(offline.last_seen.unix_timestamp(), 100);

        let again = tracker.mark_online(user_id, ConnectionId::new()).await;
        assert_eq!(again.last_seen.unix_timestamp(), 200);
    }

    #[tokio::test]
    async fn test_touch_requires_current_connection() {
        let tracker = PresenceTracker::new(Arc::new(MemoryPresenceStore::new()));
        let user_id = UserId::new();
        let conn = ConnectionId::new();

        assert!(!tracker.touch(user_id, conn).await);
        tracker.mark_online(user_id, conn).await;
        assert!(!tracker.touch(user_id, ConnectionId::new()).await);
        assert!(tracker.touch(user_id, conn).await);
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_block_transition() {
        let tracker = PresenceTracker::new(Arc::new(FailingStore));
        let user_id = UserId::new();

        tracker.mark_online(user_id, ConnectionId::new()).await;
        assert!(tracker.state(&user_id).await.unwrap().is_online);
    }

    #[tokio::test]
    async fn test_last_known_prefers_live_state_over_stored() {
        let store = Arc::new(MemoryPresenceStore::new());
        let live = UserId::new();
        let stored = UserId::new();
        let never_seen = UserId::new();

        // Left over from an earlier process that never got to mark the user offline
        store
            .save(&PresenceState {
                user_id: stored,
                is_online: true,
                last_seen: OffsetDateTime::UNIX_EPOCH,
                current_connection_id: Some(ConnectionId::new()),
            })
            .await
            .unwrap();

        let tracker = PresenceTracker::new(store);
        let conn = ConnectionId::new();
        tracker.mark_online(live, conn).await;

        let known = tracker
            .last_known(&[live, stored, never_seen])
            .await
            .unwrap();

        assert_eq!(known.len(), 2);
        assert!(known[&live].is_online);
        assert_eq!(known[&live].current_connection_id, Some(conn));
        assert!(!known[&stored].is_online);
        assert_eq!(known[&stored].last_seen, OffsetDateTime::UNIX_EPOCH);
        assert_eq!(known[&stored].current_connection_id, None);
        assert!(!known.contains_key(&never_seen));
    }

    #[tokio::test]
    async fn test_last_known_surfaces_store_errors() {
        let tracker = PresenceTracker::new(Arc::new(FailingStore));
        let result = tracker.last_known(&[UserId::new()]).await;
        assert!(matches!(result, Err(PulseError::Persistence(_))));
    }
}
