use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::domain::{
    normalize_monitor_name, EventName, EventSource, MonitorRow, MonitorTask, NewEvent,
};

use super::{events, RunOutcome, RunToken, Store};

impl Store {
    /// Idempotent upsert by normalized name. The version bumps only when
    /// the code hash changes.
    pub async fn register_monitor(
        &self,
        name: &str,
        code: &str,
        code_hash: &str,
    ) -> Result<i64> {
        let normalized = normalize_monitor_name(name);
        if normalized.is_empty() {
            anyhow::bail!("monitor name {name:?} normalizes to an empty string");
        }
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO monitors (
                name, enabled, code, code_hash, version,
                queued, running, created_at
            )
            VALUES ($1, TRUE, $2, $3, 1, FALSE, FALSE, NOW())
            ON CONFLICT (name) DO UPDATE SET
                code = EXCLUDED.code,
                code_hash = EXCLUDED.code_hash,
                version = monitors.version
                    + CASE WHEN monitors.code_hash IS DISTINCT FROM EXCLUDED.code_hash
                      THEN 1 ELSE 0 END
            RETURNING id
            "#,
        )
        .bind(&normalized)
        .bind(code)
        .bind(code_hash)
        .fetch_one(self.pool())
        .await?;
        Ok(row.0)
    }

    pub async fn monitor_by_name(&self, name: &str) -> Result<Option<MonitorRow>> {
        let normalized = normalize_monitor_name(name);
        let row = sqlx::query_as(
            r#"
            SELECT id, name, enabled, queued, running, queued_at, running_at,
                   search_executed_at, update_executed_at, last_heartbeat,
                   last_successful_execution
            FROM monitors
            WHERE name = $1
            "#,
        )
        .bind(&normalized)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn enabled_monitors(&self) -> Result<Vec<MonitorRow>> {
        let rows = sqlx::query_as(
            r#"
            SELECT id, name, enabled, queued, running, queued_at, running_at,
                   search_executed_at, update_executed_at, last_heartbeat,
                   last_successful_execution
            FROM monitors
            WHERE enabled = TRUE
            ORDER BY id ASC
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn monitors_by_ids(&self, ids: &[i64]) -> Result<Vec<MonitorRow>> {
        let rows = sqlx::query_as(
            r#"
            SELECT id, name, enabled, queued, running, queued_at, running_at,
                   search_executed_at, update_executed_at, last_heartbeat,
                   last_successful_execution
            FROM monitors
            WHERE id = ANY($1)
            ORDER BY id ASC
            "#,
        )
        .bind(ids)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Controller-side lock: flips `queued` only when the monitor is idle.
    pub async fn claim_monitor_for_run(&self, monitor_id: i64, task: MonitorTask) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE monitors
            SET queued = TRUE, queued_at = NOW()
            WHERE id = $1 AND enabled = TRUE AND queued = FALSE
            "#,
        )
        .bind(monitor_id)
        .execute(self.pool())
        .await?;
        let claimed = result.rows_affected() == 1;
        if claimed {
            tracing::debug!(monitor_id, task = task.as_str(), "claimed monitor for run");
        }
        Ok(claimed)
    }

    /// Backs out a claim whose work message never made it to the queue.
    pub async fn release_monitor_claim(&self, monitor_id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE monitors
            SET queued = FALSE
            WHERE id = $1 AND queued = TRUE AND running = FALSE
            "#,
        )
        .bind(monitor_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Executor-side lock. `None` means another worker won the race.
    pub async fn begin_run(&self, monitor_id: i64, task: MonitorTask) -> Result<Option<RunToken>> {
        let mut tx = self.pool().begin().await?;
        let claimed = sqlx::query(
            r#"
            UPDATE monitors
            SET running = TRUE, running_at = NOW(), last_heartbeat = NOW()
            WHERE id = $1 AND queued = TRUE AND running = FALSE
            "#,
        )
        .bind(monitor_id)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() != 1 {
            tx.commit().await?;
            return Ok(None);
        }

        let execution_id = events::new_execution_id();
        sqlx::query(
            r#"
            INSERT INTO monitor_executions (id, monitor_id, task, status, started_at)
            VALUES ($1, $2, $3, 'running', NOW())
            "#,
        )
        .bind(execution_id)
        .bind(monitor_id)
        .bind(task.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Some(RunToken {
            execution_id,
            monitor_id,
            task,
        }))
    }

    /// Effective only while the run is alive; a reset monitor ignores it.
    pub async fn heartbeat(&self, token: &RunToken, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE monitors
            SET last_heartbeat = $2
            WHERE id = $1 AND running = TRUE
            "#,
        )
        .bind(token.monitor_id)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn end_run(&self, token: &RunToken, outcome: RunOutcome) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        // CAS on the execution row: a run the stuck procedure already
        // finalized must not clobber a successor's monitor flags.
        let finalized = sqlx::query(
            r#"
            UPDATE monitor_executions
            SET status = $2, message = $3, finished_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(token.execution_id)
        .bind(outcome.as_str())
        .bind(outcome.message())
        .execute(&mut *tx)
        .await?;
        if finalized.rows_affected() != 1 {
            tx.commit().await?;
            tracing::debug!(
                monitor_id = token.monitor_id,
                "run was already finalized; skipping"
            );
            return Ok(());
        }

        let executed_column = match token.task {
            MonitorTask::Search => "search_executed_at",
            MonitorTask::Update => "update_executed_at",
        };
        // Task timestamps advance on any real attempt; a registry miss
        // leaves them untouched so the next tick retries.
        let stamp_executed = !matches!(outcome, RunOutcome::NotRegistered);
        let success = matches!(outcome, RunOutcome::Success);
        let query = format!(
            r#"
            UPDATE monitors
            SET running = FALSE,
                queued = FALSE,
                {executed} = CASE WHEN $2 THEN NOW() ELSE {executed} END,
                last_successful_execution =
                    CASE WHEN $3 THEN NOW() ELSE last_successful_execution END
            WHERE id = $1
            "#,
            executed = executed_column,
        );
        sqlx::query(&query)
            .bind(token.monitor_id)
            .bind(stamp_executed)
            .bind(success)
            .execute(&mut *tx)
            .await?;

        let event = match &outcome {
            RunOutcome::Success => Some(NewEvent::new(
                EventSource::Monitor,
                token.monitor_id,
                token.monitor_id,
                EventName::MonitorExecutionSuccess,
                json!({ "task": token.task.as_str() }),
            )),
            RunOutcome::Error(message) => Some(NewEvent::new(
                EventSource::Monitor,
                token.monitor_id,
                token.monitor_id,
                EventName::MonitorExecutionError,
                json!({ "task": token.task.as_str(), "error": message }),
            )),
            RunOutcome::Timeout => Some(NewEvent::new(
                EventSource::Monitor,
                token.monitor_id,
                token.monitor_id,
                EventName::MonitorExecutionError,
                json!({ "task": token.task.as_str(), "error": "timeout" }),
            )),
            RunOutcome::NotRegistered => None,
        };
        let queued = match event {
            Some(event) => self.append_events(&mut tx, &[event]).await?,
            None => false,
        };
        tx.commit().await?;
        self.after_commit(queued);
        Ok(())
    }

    pub async fn set_monitor_enabled(&self, monitor_id: i64, enabled: bool) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE monitors
            SET enabled = $2
            WHERE id = $1 AND enabled IS DISTINCT FROM $2
            "#,
        )
        .bind(monitor_id)
        .bind(enabled)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() != 1 {
            tx.commit().await?;
            return Ok(false);
        }
        let queued = self
            .append_events(
                &mut tx,
                &[NewEvent::new(
                    EventSource::Monitor,
                    monitor_id,
                    monitor_id,
                    EventName::MonitorEnabledChanged,
                    json!({ "enabled": enabled }),
                )],
            )
            .await?;
        tx.commit().await?;
        self.after_commit(queued);
        Ok(true)
    }

    /// Running monitors whose liveness signal went stale. Heartbeat is the
    /// primary signal; enqueue time covers runs that died before the
    /// first beat.
    pub async fn stuck_monitors(&self, tolerance_seconds: i64) -> Result<Vec<MonitorRow>> {
        let rows = sqlx::query_as(
            r#"
            SELECT id, name, enabled, queued, running, queued_at, running_at,
                   search_executed_at, update_executed_at, last_heartbeat,
                   last_successful_execution
            FROM monitors
            WHERE running = TRUE
              AND COALESCE(last_heartbeat, queued_at)
                  < NOW() - make_interval(secs => $1::double precision)
            ORDER BY id ASC
            "#,
        )
        .bind(tolerance_seconds as f64)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn reset_stuck_monitor(&self, monitor_id: i64) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE monitors
            SET running = FALSE, queued = FALSE
            WHERE id = $1 AND running = TRUE
            "#,
        )
        .bind(monitor_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() != 1 {
            tx.commit().await?;
            return Ok(false);
        }
        sqlx::query(
            r#"
            UPDATE monitor_executions
            SET status = 'error', message = 'stuck', finished_at = NOW()
            WHERE monitor_id = $1 AND status = 'running'
            "#,
        )
        .bind(monitor_id)
        .execute(&mut *tx)
        .await?;
        let queued = self
            .append_events(
                &mut tx,
                &[NewEvent::new(
                    EventSource::Monitor,
                    monitor_id,
                    monitor_id,
                    EventName::MonitorStuck,
                    json!({}),
                )],
            )
            .await?;
        tx.commit().await?;
        self.after_commit(queued);
        Ok(true)
    }
}
