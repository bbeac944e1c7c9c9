//! User directory lookups
//!
//! Profiles (name, role, avatar) belong to the user-management side of the system;
//! messaging only reads them to decorate outgoing events.

use async_trait::async_trait;
use edupulse_shared::{PulseError, UserId, UserProfile};
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_profile(&self, user_id: UserId) -> Result<Option<UserProfile>, PulseError>;

    /// Every known user, ordered by name.
    async fn list_profiles(&self) -> Result<Vec<(UserId, UserProfile)>, PulseError>;

    /// Resolve several users at once. Unknown ids are absent from the map.
    async fn get_profiles(
        &self,
        user_ids: &[UserId],
    ) -> Result<HashMap<UserId, UserProfile>, PulseError> {
        let mut profiles = HashMap::with_capacity(user_ids.len());
        for user_id in user_ids {
            if let Some(profile) = self.get_profile(*user_id).await? {
                profiles.insert(*user_id, profile);
            }
        }
        Ok(profiles)
    }
}

/// Directory backed by the `users` table
#[derive(Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct ProfileRow {
    id: Uuid,
    name: String,
    role: String,
    avatar: String,
}

impl From<ProfileRow> for UserProfile {
    fn from(row: ProfileRow) -> Self {
        UserProfile {
            name: row.name,
            role: row.role,
            avatar: row.avatar,
        }
    }
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn get_profile(&self, user_id: UserId) -> Result<Option<UserProfile>, PulseError> {
        let row = sqlx::query_as::<_, ProfileRow>(
            r#"
            SELECT id, name, role, COALESCE(profile_pic, '') AS avatar
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(UserProfile::from))
    }

    async fn list_profiles(&self) -> Result<Vec<(UserId, UserProfile)>, PulseError> {
        let rows = sqlx::query_as::<_, ProfileRow>(
            r#"
            SELECT id, name, role, COALESCE(profile_pic, '') AS avatar
            FROM users
            ORDER BY name ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (UserId(row.id), UserProfile::from(row)))
            .collect())
    }

    async fn get_profiles(
        &self,
        user_ids: &[UserId],
    ) -> Result<HashMap<UserId, UserProfile>, PulseError> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let ids: Vec<Uuid> = user_ids.iter().map(|u| u.0).collect();
        let rows = sqlx::query_as::<_, ProfileRow>(
            r#"
            SELECT id, name, role, COALESCE(profile_pic, '') AS avatar
            FROM users
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (UserId(row.id), UserProfile::from(row)))
            .collect())
    }
}
