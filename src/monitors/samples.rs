use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::registry::{MonitorContext, MonitorModule, MonitorOptionsDocument, APPLICATION_POOL};

/// Backlog size above which an issue is raised.
const BACKLOG_THRESHOLD: i64 = 100;

/// Sample monitor demonstrating the module contract end to end: detects a
/// growing work-queue backlog, refreshes the measurement on update, and
/// solves itself once the backlog drains.
#[derive(Default)]
pub struct QueueBacklogMonitor;

impl QueueBacklogMonitor {
    pub const NAME: &'static str = "sample_queue_backlog";

    async fn pending_messages(&self, ctx: &MonitorContext) -> Result<i64> {
        let pool = ctx
            .pool(APPLICATION_POOL)
            .context("application pool unavailable")?;
        let (pending,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_messages")
            .fetch_one(pool)
            .await?;
        Ok(pending)
    }
}

#[async_trait]
impl MonitorModule for QueueBacklogMonitor {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn options(&self) -> MonitorOptionsDocument {
        serde_json::from_value(json!({
            "monitor_options": {
                "search_cron": "*/5 * * * *",
                "update_cron": "* * * * *"
            },
            "issue_options": {
                "model_id_key": "component",
                "solvable": true,
                "unique": false
            },
            "alert_options": {
                "rule": {
                    "type": "value",
                    "value_key": "pending",
                    "operation": "greater_than",
                    "priority_levels": { "moderate": 500, "high": 5000 }
                },
                "dismiss_acknowledge_on_new_issues": false
            }
        }))
        .expect("sample monitor options are well-formed")
    }

    fn source(&self) -> String {
        "builtin:sample_queue_backlog".to_string()
    }

    async fn search(&self, ctx: &MonitorContext) -> Result<Option<Vec<JsonValue>>> {
        let pending = self.pending_messages(ctx).await?;
        if pending <= BACKLOG_THRESHOLD {
            return Ok(None);
        }
        Ok(Some(vec![json!({
            "component": "work_queue",
            "pending": pending,
        })]))
    }

    async fn update(
        &self,
        ctx: &MonitorContext,
        active: Vec<JsonValue>,
    ) -> Result<Option<Vec<JsonValue>>> {
        if active.is_empty() {
            return Ok(None);
        }
        let pending = self.pending_messages(ctx).await?;
        Ok(Some(vec![json!({
            "component": "work_queue",
            "pending": pending,
        })]))
    }

    fn is_solved(&self, data: &JsonValue) -> Result<bool> {
        Ok(data
            .get("pending")
            .and_then(|value| value.as_i64())
            .unwrap_or(0)
            <= BACKLOG_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_validate() {
        assert!(QueueBacklogMonitor.options().validate().is_ok());
    }

    #[test]
    fn solved_once_backlog_drains() {
        let module = QueueBacklogMonitor;
        assert!(module.is_solved(&json!({ "pending": 20 })).unwrap());
        assert!(!module.is_solved(&json!({ "pending": 2000 })).unwrap());
    }
}
