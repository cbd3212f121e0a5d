use anyhow::Result;
use serde_json::{json, Value as JsonValue};
use sqlx::types::Json as SqlJson;

use crate::domain::{EventName, EventSource, NewEvent, NotificationRow, Priority};

use super::Store;

impl Store {
    /// One active notification per (alert, class); a second create for the
    /// same pair returns the existing id.
    pub async fn create_notification(
        &self,
        alert_id: i64,
        notification_class: &str,
        target: &str,
        min_priority_to_send: Priority,
        mention: &JsonValue,
    ) -> Result<Option<i64>> {
        let mut tx = self.pool().begin().await?;
        let monitor: Option<(i64,)> =
            sqlx::query_as("SELECT monitor_id FROM alerts WHERE id = $1")
                .bind(alert_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((monitor_id,)) = monitor else {
            tx.commit().await?;
            return Ok(None);
        };

        let existing: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT id
            FROM notifications
            WHERE alert_id = $1 AND notification_class = $2 AND status = 'active'
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(alert_id)
        .bind(notification_class)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some((id,)) = existing {
            tx.commit().await?;
            return Ok(Some(id));
        }

        let inserted: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO notifications (
                alert_id, notification_class, target, status,
                min_priority_to_send, mention, created_at
            )
            VALUES ($1, $2, $3, 'active', $4, $5, NOW())
            RETURNING id
            "#,
        )
        .bind(alert_id)
        .bind(notification_class)
        .bind(target)
        .bind(min_priority_to_send.as_str())
        .bind(SqlJson(mention.clone()))
        .fetch_one(&mut *tx)
        .await?;

        let queued = self
            .append_events(
                &mut tx,
                &[NewEvent::new(
                    EventSource::Notification,
                    inserted.0,
                    monitor_id,
                    EventName::NotificationCreated,
                    json!({
                        "alert_id": alert_id,
                        "notification_class": notification_class,
                        "target": target,
                    }),
                )],
            )
            .await?;
        tx.commit().await?;
        self.after_commit(queued);
        Ok(Some(inserted.0))
    }

    pub async fn close_notification(&self, notification_id: i64) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        let closed: Option<(i64, i64)> = sqlx::query_as(
            r#"
            UPDATE notifications AS notification
            SET status = 'closed'
            FROM alerts AS alert
            WHERE notification.id = $1
              AND notification.status = 'active'
              AND alert.id = notification.alert_id
            RETURNING notification.alert_id, alert.monitor_id
            "#,
        )
        .bind(notification_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((alert_id, monitor_id)) = closed else {
            tx.commit().await?;
            return Ok(false);
        };
        let queued = self
            .append_events(
                &mut tx,
                &[NewEvent::new(
                    EventSource::Notification,
                    notification_id,
                    monitor_id,
                    EventName::NotificationClosed,
                    json!({ "alert_id": alert_id }),
                )],
            )
            .await?;
        tx.commit().await?;
        self.after_commit(queued);
        Ok(true)
    }

    /// Active notifications whose alert has been solved for longer than
    /// the grace window; the janitorial procedure closes them.
    pub async fn notifications_with_solved_alerts(
        &self,
        solved_age_seconds: i64,
    ) -> Result<Vec<NotificationRow>> {
        let rows = sqlx::query_as(
            r#"
            SELECT notification.id, notification.alert_id,
                   notification.notification_class, notification.target,
                   notification.status, notification.min_priority_to_send,
                   notification.created_at
            FROM notifications AS notification
            JOIN alerts AS alert ON alert.id = notification.alert_id
            WHERE notification.status = 'active'
              AND alert.status = 'solved'
              AND alert.solved_at < NOW() - make_interval(secs => $1::double precision)
            ORDER BY notification.id ASC
            "#,
        )
        .bind(solved_age_seconds as f64)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
