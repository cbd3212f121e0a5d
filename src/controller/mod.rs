use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::domain::{MonitorRow, MonitorTask};
use crate::queue::{MessageKind, WorkQueue};
use crate::registry::{MonitorDefinition, Registry};
use crate::store::Store;

pub mod procedures;

/// Cron-driven scheduler: finds monitors whose search/update is due,
/// claims them, and enqueues the work. Safe under duplicates — every
/// claim is a store-side compare-and-set.
pub struct Controller {
    store: Store,
    registry: Arc<Registry>,
    queue: Arc<dyn WorkQueue>,
    config: AppConfig,
}

impl Controller {
    pub fn new(
        store: Store,
        registry: Arc<Registry>,
        queue: Arc<dyn WorkQueue>,
        config: AppConfig,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            config,
        }
    }

    pub fn start(self, cancel: CancellationToken) {
        let schedule = match crate::time::parse_schedule(&self.config.controller_process_schedule) {
            Ok(schedule) => schedule,
            Err(err) => {
                // validate() runs at startup, so this is unreachable in practice.
                tracing::error!(error = %err, "controller schedule invalid; not starting");
                return;
            }
        };
        let tz = self.config.time_zone();

        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let pause = crate::time::next_fire(&schedule, now, tz)
                    .map(|fire| (fire - now).to_std().unwrap_or(Duration::ZERO))
                    .unwrap_or(Duration::from_secs(60));

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {
                        if let Err(err) = self.tick().await {
                            tracing::warn!(error = %err, "controller tick failed");
                        }
                    }
                }
            }
        });
    }

    async fn tick(&self) -> anyhow::Result<()> {
        let definitions = self.registry.definitions();
        if definitions.is_empty() {
            return Ok(());
        }

        let ids: Vec<i64> = definitions
            .iter()
            .map(|definition| definition.monitor_id)
            .collect();
        let rows: HashMap<i64, MonitorRow> = self
            .store
            .monitors_by_ids(&ids)
            .await?
            .into_iter()
            .map(|row| (row.id, row))
            .collect();

        let now = Utc::now();
        let tz = self.config.time_zone();
        let mut due: Vec<(Arc<MonitorDefinition>, MonitorTask)> = Vec::new();
        for definition in definitions {
            let Some(row) = rows.get(&definition.monitor_id) else {
                continue;
            };
            if !row.enabled || row.queued {
                continue;
            }
            if let Some(schedule) = &definition.search_schedule {
                if crate::time::is_due(schedule, row.search_executed_at, now, tz) {
                    due.push((definition.clone(), MonitorTask::Search));
                    continue;
                }
            }
            if let Some(schedule) = &definition.update_schedule {
                if crate::time::is_due(schedule, row.update_executed_at, now, tz) {
                    due.push((definition, MonitorTask::Update));
                }
            }
        }
        if due.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = due.len(), "monitors due for execution");

        stream::iter(due)
            .for_each_concurrent(self.config.controller_concurrency, |(definition, task)| {
                let store = self.store.clone();
                let queue = self.queue.clone();
                async move {
                    match store.claim_monitor_for_run(definition.monitor_id, task).await {
                        Ok(true) => {
                            let payload = json!({
                                "monitor_id": definition.monitor_id,
                                "monitor_name": definition.name,
                                "task": task.as_str(),
                            });
                            if let Err(err) = queue.send(MessageKind::Monitor, payload).await {
                                tracing::warn!(
                                    monitor = %definition.name,
                                    error = %err,
                                    "failed to enqueue claimed monitor"
                                );
                                if let Err(err) =
                                    store.release_monitor_claim(definition.monitor_id).await
                                {
                                    tracing::warn!(
                                        monitor = %definition.name,
                                        error = %err,
                                        "failed to release orphaned claim"
                                    );
                                }
                            }
                        }
                        Ok(false) => {}
                        Err(err) => {
                            tracing::warn!(
                                monitor = %definition.name,
                                error = %err,
                                "monitor claim failed"
                            );
                        }
                    }
                }
            })
            .await;

        Ok(())
    }
}
