use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use sqlx::FromRow;

use crate::config::InternalMonitorsNotification;
use crate::registry::{MonitorContext, MonitorModule, MonitorOptionsDocument, APPLICATION_POOL};

/// Window over which execution failures accumulate.
const FAILURE_WINDOW: &str = "1 hour";

/// Watches the platform itself: monitors that keep failing their runs
/// become issues, so operators get alerted through the same pipeline as
/// everything else.
pub struct MonitorErrorsMonitor {
    notification: InternalMonitorsNotification,
}

#[derive(Debug, FromRow)]
struct FailureRow {
    monitor_name: String,
    failures: i64,
}

impl MonitorErrorsMonitor {
    pub const NAME: &'static str = "internal_monitor_errors";

    pub fn new(notification: InternalMonitorsNotification) -> Self {
        Self { notification }
    }

    async fn failure_counts(&self, ctx: &MonitorContext) -> Result<Vec<FailureRow>> {
        let pool = ctx
            .pool(APPLICATION_POOL)
            .context("application pool unavailable")?;
        let rows = sqlx::query_as(&format!(
            r#"
            SELECT monitor.name AS monitor_name, COUNT(*) AS failures
            FROM monitor_executions AS execution
            JOIN monitors AS monitor ON monitor.id = execution.monitor_id
            WHERE execution.status IN ('error', 'timeout')
              AND execution.finished_at > NOW() - INTERVAL '{FAILURE_WINDOW}'
              AND monitor.name <> $1
            GROUP BY monitor.name
            ORDER BY monitor.name
            "#
        ))
        .bind(Self::NAME)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl MonitorModule for MonitorErrorsMonitor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn options(&self) -> MonitorOptionsDocument {
        let mut document = json!({
            "monitor_options": {
                "search_cron": "*/5 * * * *",
                "update_cron": "*/2 * * * *"
            },
            "issue_options": {
                "model_id_key": "monitor_name",
                "solvable": true,
                "unique": false
            },
            "alert_options": {
                "rule": {
                    "type": "value",
                    "value_key": "failures",
                    "operation": "greater_than",
                    "priority_levels": { "moderate": 3, "high": 10 }
                },
                "dismiss_acknowledge_on_new_issues": false
            }
        });
        if self.notification.enabled {
            document["notification_options"] = json!([{
                "notification_class": self.notification.notification_class,
                "min_priority_to_send": "moderate",
                "params": self.notification.params,
            }]);
        }
        serde_json::from_value(document).expect("internal monitor options are well-formed")
    }

    fn source(&self) -> String {
        "builtin:internal_monitor_errors".to_string()
    }

    async fn search(&self, ctx: &MonitorContext) -> Result<Option<Vec<JsonValue>>> {
        let rows = self.failure_counts(ctx).await?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            rows.into_iter()
                .map(|row| {
                    json!({
                        "monitor_name": row.monitor_name,
                        "failures": row.failures,
                    })
                })
                .collect(),
        ))
    }

    async fn update(
        &self,
        ctx: &MonitorContext,
        active: Vec<JsonValue>,
    ) -> Result<Option<Vec<JsonValue>>> {
        let current = self.failure_counts(ctx).await?;
        let refreshed = active
            .iter()
            .filter_map(|data| data.get("monitor_name").and_then(|name| name.as_str()))
            .map(|name| {
                let failures = current
                    .iter()
                    .find(|row| row.monitor_name == name)
                    .map(|row| row.failures)
                    .unwrap_or(0);
                json!({ "monitor_name": name, "failures": failures })
            })
            .collect();
        Ok(Some(refreshed))
    }

    fn is_solved(&self, data: &JsonValue) -> Result<bool> {
        Ok(data
            .get("failures")
            .and_then(|value| value.as_i64())
            .unwrap_or(0)
            == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(enabled: bool) -> MonitorErrorsMonitor {
        MonitorErrorsMonitor::new(InternalMonitorsNotification {
            enabled,
            notification_class: "chat".to_string(),
            params: JsonValue::Null,
        })
    }

    #[test]
    fn options_validate_with_and_without_notifications() {
        let document = module(false).options();
        assert!(document.validate().is_ok());
        assert!(document.notification_options.is_empty());

        let document = module(true).options();
        assert!(document.validate().is_ok());
        assert_eq!(document.notification_options.len(), 1);
        assert_eq!(document.notification_options[0].notification_class, "chat");
    }

    #[test]
    fn solved_when_failures_drained() {
        let module = module(false);
        assert!(module.is_solved(&json!({ "failures": 0 })).unwrap());
        assert!(!module.is_solved(&json!({ "failures": 4 })).unwrap());
        assert!(module.is_solved(&json!({})).unwrap());
    }
}
