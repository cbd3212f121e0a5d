use anyhow::Result;
use serde_json::Value as JsonValue;
use sqlx::types::Json as SqlJson;
use sqlx::{FromRow, Postgres, Transaction};
use uuid::Uuid;

use crate::domain::{EventName, EventSource, NewEvent};
use crate::queue::{MessageKind, WorkQueue};

use super::{EventDisposition, EventPolicy, Store};

/// Appends events inside the caller's transaction. Returns whether any
/// row was marked for publishing, so the caller can nudge the flusher
/// after commit.
pub(crate) async fn append(
    tx: &mut Transaction<'_, Postgres>,
    policy: &EventPolicy,
    events: &[NewEvent],
) -> Result<bool> {
    let mut queued_any = false;
    for event in events {
        let disposition = policy.disposition(event);
        let pending = match disposition {
            EventDisposition::Publish => true,
            EventDisposition::PersistOnly => false,
            EventDisposition::Discard => continue,
        };
        sqlx::query(
            r#"
            INSERT INTO events (
                event_source,
                event_source_id,
                event_source_monitor_id,
                event_name,
                event_data,
                pending_publish,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(event.source.as_str())
        .bind(event.source_id)
        .bind(event.monitor_id)
        .bind(event.name.as_str())
        .bind(SqlJson(event.data.clone()))
        .bind(pending)
        .execute(&mut **tx)
        .await?;
        queued_any = queued_any || pending;
    }
    Ok(queued_any)
}

#[derive(Debug, FromRow)]
struct PendingEventRow {
    id: i64,
    event_source: String,
    event_source_id: i64,
    event_source_monitor_id: i64,
    event_name: String,
    event_data: SqlJson<JsonValue>,
}

impl Store {
    /// Moves committed pending events onto the queue. Rows are claimed
    /// with `SKIP LOCKED` so concurrent flushers split the backlog; a
    /// crash between send and commit redelivers (at-least-once).
    pub async fn flush_pending_events(
        &self,
        queue: &dyn WorkQueue,
        limit: i64,
    ) -> Result<usize> {
        let mut tx = self.pool().begin().await?;
        let rows: Vec<PendingEventRow> = sqlx::query_as(
            r#"
            SELECT id, event_source, event_source_id, event_source_monitor_id, event_name, event_data
            FROM events
            WHERE pending_publish = TRUE
            ORDER BY id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        let mut published: Vec<i64> = Vec::with_capacity(rows.len());
        for row in &rows {
            let payload = serde_json::json!({
                "event_id": row.id,
                "event_source": row.event_source,
                "event_source_id": row.event_source_id,
                "event_source_monitor_id": row.event_source_monitor_id,
                "event_name": row.event_name,
                "event_data": row.event_data.0,
            });
            queue.send(MessageKind::Event, payload).await?;
            published.push(row.id);
        }

        sqlx::query("UPDATE events SET pending_publish = FALSE WHERE id = ANY($1)")
            .bind(&published)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        crate::metrics::incr(crate::metrics::EVENTS_PUBLISHED);
        Ok(published.len())
    }

    /// Event tied to the monitor itself rather than a child entity.
    pub async fn emit_monitor_event(
        &self,
        monitor_id: i64,
        name: EventName,
        data: JsonValue,
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let queued = self
            .append_events(
                &mut tx,
                &[NewEvent::new(
                    EventSource::Monitor,
                    monitor_id,
                    monitor_id,
                    name,
                    data,
                )],
            )
            .await?;
        tx.commit().await?;
        self.after_commit(queued);
        Ok(())
    }
}

/// Execution-row identifier embedded in run tokens.
pub(crate) fn new_execution_id() -> Uuid {
    Uuid::new_v4()
}
