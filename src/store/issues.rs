use anyhow::Result;
use serde_json::{json, Value as JsonValue};
use sqlx::types::Json as SqlJson;
use sqlx::FromRow;

use crate::domain::{EventName, EventSource, IssueRow, IssueStatus, NewEvent};

use super::{SolveSource, Store};

#[derive(Debug, FromRow)]
struct IssueRef {
    id: i64,
    monitor_id: i64,
    model_id: String,
}

impl Store {
    pub async fn active_issues(&self, monitor_id: i64) -> Result<Vec<IssueRow>> {
        let rows = sqlx::query_as(
            r#"
            SELECT id, monitor_id, model_id, data, status, alert_id, created_at
            FROM issues
            WHERE monitor_id = $1 AND status = 'active'
            ORDER BY id ASC
            "#,
        )
        .bind(monitor_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn issue_by_id(&self, issue_id: i64) -> Result<Option<IssueRow>> {
        let row = sqlx::query_as(
            r#"
            SELECT id, monitor_id, model_id, data, status, alert_id, created_at
            FROM issues
            WHERE id = $1
            "#,
        )
        .bind(issue_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Creates an issue unless the same model is already tracked. An
    /// active issue for the model always wins; with `unique` set, a
    /// terminal one also blocks re-creation. Returns `(issue_id,
    /// created)` or `None` when creation is blocked.
    pub async fn upsert_issue(
        &self,
        monitor_id: i64,
        model_id: &str,
        data: &JsonValue,
        unique: bool,
    ) -> Result<Option<(i64, bool)>> {
        let mut tx = self.pool().begin().await?;
        let existing: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, status
            FROM issues
            WHERE monitor_id = $1 AND model_id = $2
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(monitor_id)
        .bind(model_id)
        .fetch_optional(&mut *tx)
        .await?;

        match existing {
            Some((id, status)) if status == IssueStatus::Active.as_str() => {
                tx.commit().await?;
                return Ok(Some((id, false)));
            }
            Some(_) if unique => {
                tx.commit().await?;
                return Ok(None);
            }
            _ => {}
        }

        let inserted: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO issues (monitor_id, model_id, data, status, created_at)
            VALUES ($1, $2, $3, 'active', NOW())
            RETURNING id
            "#,
        )
        .bind(monitor_id)
        .bind(model_id)
        .bind(SqlJson(data.clone()))
        .fetch_one(&mut *tx)
        .await?;

        let queued = self
            .append_events(
                &mut tx,
                &[NewEvent::new(
                    EventSource::Issue,
                    inserted.0,
                    monitor_id,
                    EventName::IssueCreated,
                    json!({ "model_id": model_id, "data": data }),
                )],
            )
            .await?;
        tx.commit().await?;
        self.after_commit(queued);
        Ok(Some((inserted.0, true)))
    }

    /// Data refresh only; status never changes here.
    pub async fn update_issue_data(&self, issue_id: i64, data: &JsonValue) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE issues
            SET data = $2
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(issue_id)
        .bind(SqlJson(data.clone()))
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_issue_solved(&self, issue_id: i64, source: SolveSource) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        let solved: Option<IssueRef> = sqlx::query_as(
            r#"
            UPDATE issues
            SET status = 'solved', solved_at = NOW()
            WHERE id = $1 AND status = 'active'
            RETURNING id, monitor_id, model_id
            "#,
        )
        .bind(issue_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(issue) = solved else {
            tx.commit().await?;
            return Ok(false);
        };

        let name = match source {
            SolveSource::Direct => EventName::IssueSolved,
            SolveSource::Update => EventName::IssueUpdatedSolved,
        };
        let queued = self
            .append_events(
                &mut tx,
                &[NewEvent::new(
                    EventSource::Issue,
                    issue.id,
                    issue.monitor_id,
                    name,
                    json!({ "model_id": issue.model_id }),
                )],
            )
            .await?;
        tx.commit().await?;
        self.after_commit(queued);
        Ok(true)
    }

    /// The update flow touched this issue and it remains unsolved.
    pub async fn record_issue_not_solved(&self, issue_id: i64) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        let issue: Option<IssueRef> = sqlx::query_as(
            r#"
            SELECT id, monitor_id, model_id
            FROM issues
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(issue_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(issue) = issue else {
            tx.commit().await?;
            return Ok(());
        };
        let queued = self
            .append_events(
                &mut tx,
                &[NewEvent::new(
                    EventSource::Issue,
                    issue.id,
                    issue.monitor_id,
                    EventName::IssueUpdatedNotSolved,
                    json!({ "model_id": issue.model_id }),
                )],
            )
            .await?;
        tx.commit().await?;
        self.after_commit(queued);
        Ok(())
    }

    pub async fn mark_issue_dropped(&self, issue_id: i64) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        let dropped: Option<IssueRef> = sqlx::query_as(
            r#"
            UPDATE issues
            SET status = 'dropped', dropped_at = NOW()
            WHERE id = $1 AND status = 'active'
            RETURNING id, monitor_id, model_id
            "#,
        )
        .bind(issue_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(issue) = dropped else {
            tx.commit().await?;
            return Ok(false);
        };
        let queued = self
            .append_events(
                &mut tx,
                &[NewEvent::new(
                    EventSource::Issue,
                    issue.id,
                    issue.monitor_id,
                    EventName::IssueDropped,
                    json!({ "model_id": issue.model_id }),
                )],
            )
            .await?;
        tx.commit().await?;
        self.after_commit(queued);
        Ok(true)
    }
}
