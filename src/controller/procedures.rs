use chrono::Utc;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, ProcedureSettings};
use crate::store::Store;

const DEFAULT_TIME_TOLERANCE: i64 = 120;
const DEFAULT_SOLVED_AGE: i64 = 300;

/// Janitorial procedures, each on its own cron from
/// `controller_procedures`.
pub struct Procedures {
    store: Store,
    config: AppConfig,
}

impl Procedures {
    pub fn new(store: Store, config: AppConfig) -> Self {
        Self { store, config }
    }

    pub fn start(self, cancel: CancellationToken) {
        for (name, settings) in self.config.controller_procedures.clone() {
            match name.as_str() {
                "monitors_stuck" | "notifications_alert_solved" => {
                    spawn_procedure(
                        self.store.clone(),
                        self.config.clone(),
                        name,
                        settings,
                        cancel.clone(),
                    );
                }
                other => {
                    tracing::warn!(procedure = %other, "unknown controller procedure; skipping");
                }
            }
        }
    }
}

fn spawn_procedure(
    store: Store,
    config: AppConfig,
    name: String,
    settings: ProcedureSettings,
    cancel: CancellationToken,
) {
    let schedule = match crate::time::parse_schedule(&settings.schedule) {
        Ok(schedule) => schedule,
        Err(err) => {
            tracing::error!(procedure = %name, error = %err, "procedure schedule invalid");
            return;
        }
    };
    let tz = config.time_zone();

    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let pause = crate::time::next_fire(&schedule, now, tz)
                .map(|fire| (fire - now).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(Duration::from_secs(60));

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {
                    let result = match name.as_str() {
                        "monitors_stuck" => monitors_stuck(&store, &config, &settings.params).await,
                        "notifications_alert_solved" => {
                            notifications_alert_solved(&store, &settings.params).await
                        }
                        _ => Ok(()),
                    };
                    if let Err(err) = result {
                        tracing::warn!(procedure = %name, error = %err, "procedure run failed");
                    }
                }
            }
        }
    });
}

/// Resets monitors whose run lost its liveness signal, so the next
/// controller tick can reschedule them.
/// Configured tolerance, floored at twice the heartbeat interval so a
/// healthy run can never look stuck between beats.
fn effective_tolerance(params: &JsonValue, heartbeat_seconds: u64) -> i64 {
    let floor = (heartbeat_seconds as i64).saturating_mul(2);
    params
        .get("time_tolerance")
        .and_then(|value| value.as_i64())
        .unwrap_or(DEFAULT_TIME_TOLERANCE)
        .max(floor)
}

async fn monitors_stuck(
    store: &Store,
    config: &AppConfig,
    params: &JsonValue,
) -> anyhow::Result<()> {
    let tolerance = effective_tolerance(params, config.executor_monitor_heartbeat_time);

    for monitor in store.stuck_monitors(tolerance).await? {
        if store.reset_stuck_monitor(monitor.id).await? {
            crate::metrics::incr(crate::metrics::MONITORS_STUCK_RESET);
            tracing::warn!(
                monitor = %monitor.name,
                last_heartbeat = ?monitor.last_heartbeat,
                "reset stuck monitor"
            );
        }
    }
    Ok(())
}

/// Closes active notifications whose alert has been solved past the
/// grace window.
async fn notifications_alert_solved(store: &Store, params: &JsonValue) -> anyhow::Result<()> {
    let solved_age = params
        .get("solved_age")
        .and_then(|value| value.as_i64())
        .unwrap_or(DEFAULT_SOLVED_AGE);

    for notification in store.notifications_with_solved_alerts(solved_age).await? {
        if store.close_notification(notification.id).await? {
            tracing::info!(
                notification_id = notification.id,
                alert_id = notification.alert_id,
                "closed notification for solved alert"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tolerance_prefers_params_but_respects_the_heartbeat_floor() {
        let params = serde_json::json!({ "time_tolerance": 600 });
        assert_eq!(effective_tolerance(&params, 30), 600);

        // Configured below the floor: twice the heartbeat wins.
        let params = serde_json::json!({ "time_tolerance": 10 });
        assert_eq!(effective_tolerance(&params, 30), 60);

        assert_eq!(
            effective_tolerance(&serde_json::json!({}), 30),
            DEFAULT_TIME_TOLERANCE
        );
        assert_eq!(effective_tolerance(&serde_json::Value::Null, 90), 180);
    }
}
