use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Map, Value as JsonValue};
use sqlx::types::Json as SqlJson;
use sqlx::FromRow;

use crate::domain::rule::AlertRule;
use crate::domain::{
    parse_priority, AlertRow, EventName, EventSource, IssueRow, NewEvent, Priority, RuleIssue,
};

use super::{json_object, Store};

#[derive(Debug, FromRow)]
struct IssueToDrop {
    id: i64,
    model_id: String,
}

/// Acknowledgement levels that an increase to `new_priority` invalidates:
/// everything recorded at a strictly lower severity.
pub fn dismissed_levels(acknowledged: &JsonValue, new_priority: Priority) -> Vec<Priority> {
    let Some(map) = acknowledged.as_object() else {
        return Vec::new();
    };
    let mut dismissed: Vec<Priority> = map
        .iter()
        .filter(|(_, value)| value.as_bool().unwrap_or(false))
        .filter_map(|(key, _)| parse_priority(key))
        .filter(|level| new_priority.more_severe_than(*level))
        .collect();
    dismissed.sort();
    dismissed
}

fn acknowledged_without(acknowledged: &JsonValue, removed: &[Priority]) -> JsonValue {
    let mut map = acknowledged.as_object().cloned().unwrap_or_default();
    for level in removed {
        map.remove(level.as_str());
    }
    JsonValue::Object(map)
}

fn acknowledged_levels(acknowledged: &JsonValue) -> Vec<Priority> {
    let Some(map) = acknowledged.as_object() else {
        return Vec::new();
    };
    let mut levels: Vec<Priority> = map
        .iter()
        .filter(|(_, value)| value.as_bool().unwrap_or(false))
        .filter_map(|(key, _)| parse_priority(key))
        .collect();
    levels.sort();
    levels
}

impl Store {
    pub async fn alert_by_id(&self, alert_id: i64) -> Result<Option<AlertRow>> {
        let row = sqlx::query_as(
            r#"
            SELECT id, monitor_id, priority, status, locked, acknowledged, created_at, solved_at
            FROM alerts
            WHERE id = $1
            "#,
        )
        .bind(alert_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Recomputes the monitor's open alert from its active issues: links
    /// new issues, re-evaluates the rule, and walks the priority and
    /// solved transitions. Deterministic for a given store state.
    pub async fn recompute_alert(
        &self,
        monitor_id: i64,
        rule: &AlertRule,
        dismiss_acknowledge_on_new_issues: bool,
    ) -> Result<()> {
        let now = Utc::now();
        let mut events: Vec<NewEvent> = Vec::new();
        let mut tx = self.pool().begin().await?;

        // Active issues not held by a locked alert.
        let issues: Vec<IssueRow> = sqlx::query_as(
            r#"
            SELECT issue.id, issue.monitor_id, issue.model_id, issue.data,
                   issue.status, issue.alert_id, issue.created_at
            FROM issues AS issue
            LEFT JOIN alerts AS alert ON alert.id = issue.alert_id
            WHERE issue.monitor_id = $1
              AND issue.status = 'active'
              AND (issue.alert_id IS NULL OR alert.locked = FALSE)
            ORDER BY issue.id ASC
            "#,
        )
        .bind(monitor_id)
        .fetch_all(&mut *tx)
        .await?;

        let open: Option<AlertRow> = sqlx::query_as(
            r#"
            SELECT id, monitor_id, priority, status, locked, acknowledged, created_at, solved_at
            FROM alerts
            WHERE monitor_id = $1 AND status = 'active' AND locked = FALSE
            ORDER BY id ASC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(monitor_id)
        .fetch_optional(&mut *tx)
        .await?;

        let unlinked: Vec<&IssueRow> = issues
            .iter()
            .filter(|issue| issue.alert_id.is_none())
            .collect();

        let alert = match open {
            Some(alert) => alert,
            None => {
                if unlinked.is_empty() {
                    tx.commit().await?;
                    return Ok(());
                }
                let created: AlertRow = sqlx::query_as(
                    r#"
                    INSERT INTO alerts (
                        monitor_id, priority, status, locked, acknowledged, created_at
                    )
                    VALUES ($1, 'none', 'active', FALSE, '{}'::jsonb, NOW())
                    RETURNING id, monitor_id, priority, status, locked, acknowledged,
                              created_at, solved_at
                    "#,
                )
                .bind(monitor_id)
                .fetch_one(&mut *tx)
                .await?;
                events.push(NewEvent::new(
                    EventSource::Alert,
                    created.id,
                    monitor_id,
                    EventName::AlertCreated,
                    json!({}),
                ));
                created
            }
        };

        if !unlinked.is_empty() {
            let ids: Vec<i64> = unlinked.iter().map(|issue| issue.id).collect();
            sqlx::query("UPDATE issues SET alert_id = $2 WHERE id = ANY($1)")
                .bind(&ids)
                .bind(alert.id)
                .execute(&mut *tx)
                .await?;
            for issue in &unlinked {
                events.push(NewEvent::new(
                    EventSource::Issue,
                    issue.id,
                    monitor_id,
                    EventName::IssueLinked,
                    json!({ "alert_id": alert.id }),
                ));
            }
            events.push(NewEvent::new(
                EventSource::Alert,
                alert.id,
                monitor_id,
                EventName::AlertIssuesLinked,
                json!({ "issue_ids": ids }),
            ));
        }

        let rule_issues: Vec<RuleIssue> = issues.iter().map(IssueRow::as_rule_issue).collect();
        let old_priority = alert.priority();
        let new_priority = rule.evaluate(&rule_issues, now);

        let mut acknowledged = json_object(alert.acknowledged.0.clone());
        if new_priority != old_priority {
            if new_priority.more_severe_than(old_priority) {
                events.push(NewEvent::new(
                    EventSource::Alert,
                    alert.id,
                    monitor_id,
                    EventName::AlertPriorityIncreased,
                    json!({
                        "previous": old_priority.as_str(),
                        "priority": new_priority.as_str(),
                    }),
                ));
                let dismissed = dismissed_levels(&acknowledged, new_priority);
                if !dismissed.is_empty() {
                    acknowledged = acknowledged_without(&acknowledged, &dismissed);
                    for level in dismissed {
                        events.push(NewEvent::new(
                            EventSource::Alert,
                            alert.id,
                            monitor_id,
                            EventName::AlertAcknowledgeDismissed,
                            json!({ "priority": level.as_str() }),
                        ));
                    }
                }
            } else {
                events.push(NewEvent::new(
                    EventSource::Alert,
                    alert.id,
                    monitor_id,
                    EventName::AlertPriorityDecreased,
                    json!({
                        "previous": old_priority.as_str(),
                        "priority": new_priority.as_str(),
                    }),
                ));
            }
        }

        if dismiss_acknowledge_on_new_issues && !unlinked.is_empty() {
            let remaining = acknowledged_levels(&acknowledged);
            if !remaining.is_empty() {
                for level in &remaining {
                    events.push(NewEvent::new(
                        EventSource::Alert,
                        alert.id,
                        monitor_id,
                        EventName::AlertAcknowledgeDismissed,
                        json!({ "priority": level.as_str() }),
                    ));
                }
                acknowledged = JsonValue::Object(Map::new());
            }
        }

        if rule_issues.is_empty() {
            sqlx::query(
                r#"
                UPDATE alerts
                SET status = 'solved', solved_at = NOW(), priority = $2, acknowledged = $3
                WHERE id = $1
                "#,
            )
            .bind(alert.id)
            .bind(new_priority.as_str())
            .bind(SqlJson(acknowledged))
            .execute(&mut *tx)
            .await?;
            events.push(NewEvent::new(
                EventSource::Alert,
                alert.id,
                monitor_id,
                EventName::AlertSolved,
                json!({}),
            ));
        } else {
            sqlx::query(
                r#"
                UPDATE alerts
                SET priority = $2, acknowledged = $3
                WHERE id = $1
                "#,
            )
            .bind(alert.id)
            .bind(new_priority.as_str())
            .bind(SqlJson(acknowledged))
            .execute(&mut *tx)
            .await?;
            events.push(NewEvent::new(
                EventSource::Alert,
                alert.id,
                monitor_id,
                EventName::AlertUpdated,
                json!({ "priority": new_priority.as_str() }),
            ));
        }

        let queued = self.append_events(&mut tx, &events).await?;
        tx.commit().await?;
        self.after_commit(queued);
        Ok(())
    }

    /// Records an acknowledgement at `at_priority`, defaulting to the
    /// alert's current priority.
    pub async fn acknowledge_alert(
        &self,
        alert_id: i64,
        at_priority: Option<Priority>,
    ) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        let alert: Option<AlertRow> = sqlx::query_as(
            r#"
            SELECT id, monitor_id, priority, status, locked, acknowledged, created_at, solved_at
            FROM alerts
            WHERE id = $1 AND status = 'active'
            FOR UPDATE
            "#,
        )
        .bind(alert_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(alert) = alert else {
            tx.commit().await?;
            return Ok(false);
        };
        let priority = at_priority.unwrap_or_else(|| alert.priority());
        if priority == Priority::None {
            tx.commit().await?;
            return Ok(false);
        }

        let mut map = json_object(alert.acknowledged.0.clone())
            .as_object()
            .cloned()
            .unwrap_or_default();
        map.insert(priority.as_str().to_string(), JsonValue::Bool(true));
        sqlx::query("UPDATE alerts SET acknowledged = $2 WHERE id = $1")
            .bind(alert.id)
            .bind(SqlJson(JsonValue::Object(map)))
            .execute(&mut *tx)
            .await?;

        let queued = self
            .append_events(
                &mut tx,
                &[NewEvent::new(
                    EventSource::Alert,
                    alert.id,
                    alert.monitor_id,
                    EventName::AlertAcknowledged,
                    json!({ "priority": priority.as_str() }),
                )],
            )
            .await?;
        tx.commit().await?;
        self.after_commit(queued);
        Ok(true)
    }

    pub async fn lock_alert(&self, alert_id: i64) -> Result<bool> {
        self.set_alert_locked(alert_id, true).await
    }

    pub async fn unlock_alert(&self, alert_id: i64) -> Result<bool> {
        self.set_alert_locked(alert_id, false).await
    }

    async fn set_alert_locked(&self, alert_id: i64, locked: bool) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        let updated: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE alerts
            SET locked = $2
            WHERE id = $1 AND status = 'active' AND locked IS DISTINCT FROM $2
            RETURNING monitor_id
            "#,
        )
        .bind(alert_id)
        .bind(locked)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((monitor_id,)) = updated else {
            tx.commit().await?;
            return Ok(false);
        };
        let name = if locked {
            EventName::AlertLocked
        } else {
            EventName::AlertUnlocked
        };
        let queued = self
            .append_events(
                &mut tx,
                &[NewEvent::new(
                    EventSource::Alert,
                    alert_id,
                    monitor_id,
                    name,
                    json!({}),
                )],
            )
            .await?;
        tx.commit().await?;
        self.after_commit(queued);
        Ok(true)
    }

    /// Manual resolution: the alert's remaining active issues are dropped
    /// so the solved invariant holds.
    pub async fn solve_alert(&self, alert_id: i64) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        let alert: Option<AlertRow> = sqlx::query_as(
            r#"
            SELECT id, monitor_id, priority, status, locked, acknowledged, created_at, solved_at
            FROM alerts
            WHERE id = $1 AND status = 'active'
            FOR UPDATE
            "#,
        )
        .bind(alert_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(alert) = alert else {
            tx.commit().await?;
            return Ok(false);
        };

        let mut events: Vec<NewEvent> = Vec::new();
        let dropped: Vec<IssueToDrop> = sqlx::query_as(
            r#"
            UPDATE issues
            SET status = 'dropped', dropped_at = NOW()
            WHERE alert_id = $1 AND status = 'active'
            RETURNING id, model_id
            "#,
        )
        .bind(alert.id)
        .fetch_all(&mut *tx)
        .await?;
        for issue in &dropped {
            events.push(NewEvent::new(
                EventSource::Issue,
                issue.id,
                alert.monitor_id,
                EventName::IssueDropped,
                json!({ "model_id": issue.model_id }),
            ));
        }

        sqlx::query(
            r#"
            UPDATE alerts
            SET status = 'solved', solved_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(alert.id)
        .execute(&mut *tx)
        .await?;
        events.push(NewEvent::new(
            EventSource::Alert,
            alert.id,
            alert.monitor_id,
            EventName::AlertSolved,
            json!({ "manual": true }),
        ));

        let queued = self.append_events(&mut tx, &events).await?;
        tx.commit().await?;
        self.after_commit(queued);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dismisses_only_strictly_lower_severities() {
        let acknowledged = json!({ "moderate": true, "high": true });

        let dismissed = dismissed_levels(&acknowledged, Priority::High);
        assert_eq!(dismissed, vec![Priority::Moderate]);

        let dismissed = dismissed_levels(&acknowledged, Priority::Critical);
        assert_eq!(dismissed, vec![Priority::High, Priority::Moderate]);

        let dismissed = dismissed_levels(&acknowledged, Priority::Moderate);
        assert!(dismissed.is_empty());
    }

    #[test]
    fn ignores_unset_and_unknown_acknowledgements() {
        let acknowledged = json!({ "low": false, "p4": true, "moderate": true });
        let dismissed = dismissed_levels(&acknowledged, Priority::Critical);
        assert_eq!(dismissed, vec![Priority::Moderate]);

        assert!(dismissed_levels(&json!(null), Priority::Critical).is_empty());
    }

    #[test]
    fn removing_levels_leaves_the_rest() {
        let acknowledged = json!({ "moderate": true, "high": true });
        let remaining = acknowledged_without(&acknowledged, &[Priority::Moderate]);
        assert_eq!(remaining, json!({ "high": true }));
    }

    #[test]
    fn lists_acknowledged_levels_in_severity_order() {
        let acknowledged = json!({ "low": true, "critical": true, "moderate": false });
        assert_eq!(
            acknowledged_levels(&acknowledged),
            vec![Priority::Critical, Priority::Low]
        );
    }
}
