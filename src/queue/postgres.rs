use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::types::Json as SqlJson;
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use uuid::Uuid;

use super::{parse_message_kind, Message, MessageKind, WorkQueue};

const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Broker shared between processes, backed by the `queue_messages` table.
/// Claims take a row lock with `SKIP LOCKED`, so competing consumers never
/// hand out the same message twice inside a visibility window.
pub struct PostgresQueue {
    pool: PgPool,
    visibility: Duration,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: Uuid,
    kind: String,
    payload: SqlJson<JsonValue>,
    receive_count: i32,
}

impl PostgresQueue {
    pub fn new(pool: PgPool, visibility: Duration) -> Self {
        Self { pool, visibility }
    }

    async fn claim_next(&self) -> Result<Option<Message>> {
        let row: Option<MessageRow> = sqlx::query_as(
            r#"
            WITH next AS (
                SELECT id
                FROM queue_messages
                WHERE visible_at <= NOW()
                ORDER BY created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_messages AS message
            SET
                visible_at = NOW() + make_interval(secs => $1::double precision),
                receive_count = message.receive_count + 1
            FROM next
            WHERE message.id = next.id
            RETURNING message.id, message.kind, message.payload, message.receive_count
            "#,
        )
        .bind(self.visibility.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let Some(kind) = parse_message_kind(&row.kind) else {
            // Unknown kinds are dead on arrival; drop so they stop cycling.
            tracing::warn!(id = %row.id, kind = %row.kind, "dropping message of unknown kind");
            sqlx::query("DELETE FROM queue_messages WHERE id = $1")
                .bind(row.id)
                .execute(&self.pool)
                .await?;
            return Ok(None);
        };

        Ok(Some(Message {
            id: row.id,
            kind,
            payload: row.payload.0,
            receive_count: row.receive_count,
        }))
    }
}

#[async_trait]
impl WorkQueue for PostgresQueue {
    async fn send(&self, kind: MessageKind, payload: JsonValue) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_messages (id, kind, payload, visible_at, receive_count, created_at)
            VALUES ($1, $2, $3, NOW(), 0, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(kind.as_str())
        .bind(SqlJson(payload))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Message>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(message) = self.claim_next().await? {
                return Ok(Some(message));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(RECEIVE_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn extend_visibility(&self, message: &Message, extension: Duration) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = NOW() + make_interval(secs => $2::double precision)
            WHERE id = $1 AND receive_count = $3
            "#,
        )
        .bind(message.id)
        .bind(extension.as_secs_f64())
        .bind(message.receive_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ack(&self, message: &Message) -> Result<()> {
        sqlx::query("DELETE FROM queue_messages WHERE id = $1 AND receive_count = $2")
            .bind(message.id)
            .bind(message.receive_count)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack(&self, message: &Message) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = NOW()
            WHERE id = $1 AND receive_count = $2
            "#,
        )
        .bind(message.id)
        .bind(message.receive_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
