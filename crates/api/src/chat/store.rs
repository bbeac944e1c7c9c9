//! Message persistence
//!
//! Append-only storage of direct messages. History is ordered by `(created_at, id)`;
//! the id breaks ties between messages stamped with the same instant.

use async_trait::async_trait;
use edupulse_shared::{
    ConversationSummary, Message, MessageId, MessageKind, NewMessage, PulseError, UserId,
};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

/// History page request between two users
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryQuery {
    pub user_id: UserId,
    pub other_user_id: UserId,
    pub limit: Option<u32>,
    /// Only messages strictly before this one in history order
    pub before_id: Option<MessageId>,
}

/// Durable, append-only message storage
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message, assigning its id and timestamp together.
    async fn append(&self, message: NewMessage) -> Result<Message, PulseError>;

    /// The latest `limit` messages between `a` and `b` preceding `before_id`,
    /// returned oldest first. An unknown `before_id` yields an empty page.
    async fn history(
        &self,
        a: UserId,
        b: UserId,
        limit: u32,
        before_id: Option<MessageId>,
    ) -> Result<Vec<Message>, PulseError>;

    /// One summary per conversation partner of `user_id`, newest first.
    async fn conversations(&self, user_id: UserId) -> Result<Vec<ConversationSummary>, PulseError>;
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    sender_id: Uuid,
    receiver_id: Uuid,
    body: String,
    message_type: String,
    created_at: OffsetDateTime,
}

impl TryFrom<MessageRow> for Message {
    type Error = PulseError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let kind: MessageKind = row.message_type.parse().map_err(|_| {
            PulseError::Internal(format!(
                "message {} has unrecognized type '{}'",
                row.id, row.message_type
            ))
        })?;

        Ok(Message {
            id: MessageId(row.id),
            sender_id: UserId(row.sender_id),
            receiver_id: UserId(row.receiver_id),
            body: row.body,
            kind,
            created_at: row.created_at,
        })
    }
}

/// PostgreSQL message store over `chat_messages`
#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn append(&self, message: NewMessage) -> Result<Message, PulseError> {
        message.validate()?;

        // id and created_at both come from this single INSERT
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            INSERT INTO chat_messages (sender_id, receiver_id, body, message_type, created_at)
            VALUES ($1, $2, $3, $4, clock_timestamp())
            RETURNING id, sender_id, receiver_id, body, message_type, created_at
            "#,
        )
        .bind(message.sender_id.0)
        .bind(message.receiver_id.0)
        .bind(&message.body)
        .bind(message.kind.as_str())
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn history(
        &self,
        a: UserId,
        b: UserId,
        limit: u32,
        before_id: Option<MessageId>,
    ) -> Result<Vec<Message>, PulseError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT id, sender_id, receiver_id, body, message_type, created_at
            FROM (
              SELECT id, sender_id, receiver_id, body, message_type, created_at
              FROM chat_messages
              WHERE ((sender_id = $1 AND receiver_id = $2) OR (sender_id = $2 AND receiver_id = $1))
                AND (
                  $3::BIGINT IS NULL
                  OR (created_at, id) < (SELECT c.created_at, c.id FROM chat_messages c WHERE c.id = $3)
                )
              ORDER BY created_at DESC, id DESC
              LIMIT $4
            ) page
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(a.0)
        .bind(b.0)
        .bind(before_id.map(|id| id.0))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Message::try_from).collect()
    }

    async fn conversations(&self, user_id: UserId) -> Result<Vec<ConversationSummary>, PulseError> {
        #[derive(sqlx::FromRow)]
        struct ConversationRow {
            peer_id: Uuid,
            total_messages: i64,
            #[sqlx(flatten)]
            last: MessageRow,
        }

        let rows = sqlx::query_as::<_, ConversationRow>(
            r#"
            SELECT DISTINCT ON (peer_id)
              peer_id, id, sender_id, receiver_id, body, message_type, created_at,
              COUNT(*) OVER (PARTITION BY peer_id) AS total_messages
            FROM (
              SELECT
                CASE WHEN sender_id = $1 THEN receiver_id ELSE sender_id END AS peer_id,
                id, sender_id, receiver_id, body, message_type, created_at
              FROM chat_messages
              WHERE sender_id = $1 OR receiver_id = $1
            ) mine
            ORDER BY peer_id, created_at DESC, id DESC
            "#,
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = rows
            .into_iter()
            .map(|row| {
                Ok(ConversationSummary {
                    peer_id: UserId(row.peer_id),
                    total_messages: row.total_messages,
                    last_message: Message::try_from(row.last)?,
                })
            })
            .collect::<Result<Vec<_>, PulseError>>()?;

        summaries.sort_by(|x, y| y.last_message.order_key().cmp(&x.last_message.order_key()));
        Ok(summaries)
    }
}
