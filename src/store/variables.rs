use anyhow::Result;
use serde_json::Value as JsonValue;
use sqlx::types::Json as SqlJson;

use super::Store;

impl Store {
    /// Per-monitor key/value blob, reachable only from that monitor's
    /// callbacks through its context.
    pub async fn get_variable(&self, monitor_id: i64, name: &str) -> Result<Option<JsonValue>> {
        let row: Option<(SqlJson<JsonValue>,)> = sqlx::query_as(
            r#"
            SELECT value
            FROM variables
            WHERE monitor_id = $1 AND name = $2
            "#,
        )
        .bind(monitor_id)
        .bind(name)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(|(value,)| value.0))
    }

    pub async fn set_variable(
        &self,
        monitor_id: i64,
        name: &str,
        value: &JsonValue,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO variables (monitor_id, name, value, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (monitor_id, name)
            DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()
            "#,
        )
        .bind(monitor_id)
        .bind(name)
        .bind(SqlJson(value.clone()))
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
