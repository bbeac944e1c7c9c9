//! Connection registry
//!
//! Maps each user to the single connection currently allowed to receive their pushes.

use edupulse_shared::{ConnectionId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::websocket::connection::Connection;

/// Result of a conditional removal
#[derive(Debug)]
pub enum RemoveOutcome {
    /// The connection was current and is now unregistered
    Removed(Arc<Connection>),
    /// The connection was already superseded or removed
    Stale,
}

#[derive(Default)]
struct RegistryInner {
    /// user_id -> current connection
    by_user: HashMap<UserId, Arc<Connection>>,
    /// connection_id -> user_id, only for current connections
    by_connection: HashMap<ConnectionId, UserId>,
}

/// Authoritative user -> connection bindings
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `conn` as the user's current connection.
    ///
    /// Returns the connection it replaced, which the caller must evict.
    pub async fn register(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write().await;
        inner.by_connection.insert(conn.connection_id, conn.user_id);

        let previous = inner.by_user.insert(conn.user_id, Arc::clone(&conn));
        let evicted = match previous {
            Some(old) if old.connection_id != conn.connection_id => {
                inner.by_connection.remove(&old.connection_id);
                Some(old)
            }
            _ => None,
        };

        tracing::debug!(
            user_id = %conn.user_id,
            connection_id = %conn.connection_id,
            evicted = evicted.is_some(),
            total_connections = inner.by_user.len(),
            "Connection registered"
        );

        evicted
    }

    /// Current connection for a user, if any
    pub async fn lookup(&self, user_id: &UserId) -> Option<Arc<Connection>> {
        let inner = self.inner.read().await;
        inner.by_user.get(user_id).cloned()
    }

    /// Unregister a connection, but only if it is still the current one for its user.
    pub async fn remove(&self, connection_id: &ConnectionId) -> RemoveOutcome {
        let mut inner = self.inner.write().await;
        let Some(user_id) = inner.by_connection.remove(connection_id) else {
            return RemoveOutcome::Stale;
        };

        let is_current = inner
            .by_user
            .get(&user_id)
            .is_some_and(|c| c.connection_id == *connection_id);
        if !is_current {
            return RemoveOutcome::Stale;
        }

        match inner.by_user.remove(&user_id) {
            Some(conn) => {
                tracing::debug!(
                    user_id = %user_id,
                    connection_id = %connection_id,
                    remaining_connections = inner.by_user.len(),
                    "Connection unregistered"
                );
                RemoveOutcome::Removed(conn)
            }
            None => RemoveOutcome::Stale,
        }
    }

    /// Snapshot of every registered connection
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        let inner = self.inner.read().await;
        inner.by_user.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_user.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
