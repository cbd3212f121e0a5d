use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::domain::MonitorTask;
use crate::error::ExecutionError;
use crate::queue::{Message, MessageKind, WorkQueue};
use crate::registry::Registry;
use crate::store::{RunOutcome, RunToken, Store};

pub mod events;
pub mod monitor_run;
pub mod requests;

pub use requests::{ActionContext, ActionHandler, ActionRegistry};

/// A claimed monitor run traveling through the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorWorkMessage {
    pub monitor_id: i64,
    pub monitor_name: String,
    pub task: MonitorTask,
}

/// A committed lifecycle event en route to its reactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventQueueMessage {
    pub event_id: i64,
    pub event_source: String,
    pub event_source_id: i64,
    pub event_source_monitor_id: i64,
    pub event_name: String,
    pub event_data: JsonValue,
}

/// An externally submitted action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    pub action: String,
    #[serde(default)]
    pub params: JsonValue,
}

/// Worker pool consuming the queue. Each message runs under a heartbeat
/// task and a per-kind deadline; failures are logged, counted, and acked
/// — monitor work is rescheduled by the controller, reactions and
/// requests are best-effort.
pub struct Executor {
    pub(crate) store: Store,
    pub(crate) registry: Arc<Registry>,
    pub(crate) queue: Arc<dyn WorkQueue>,
    pub(crate) pools: Arc<BTreeMap<String, PgPool>>,
    pub(crate) actions: Arc<ActionRegistry>,
    pub(crate) config: AppConfig,
}

impl Executor {
    pub fn new(
        store: Store,
        registry: Arc<Registry>,
        queue: Arc<dyn WorkQueue>,
        pools: Arc<BTreeMap<String, PgPool>>,
        actions: Arc<ActionRegistry>,
        config: AppConfig,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            pools,
            actions,
            config,
        }
    }

    /// Spawns the workers; the handles drain on shutdown.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.executor_concurrency)
            .map(|worker| {
                let executor = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    executor.worker_loop(worker, cancel).await;
                })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize, cancel: CancellationToken) {
        let wait = Duration::from_secs(self.config.application_queue.queue_wait_message_time);
        let idle = Duration::from_secs(self.config.executor_sleep.max(1));
        tracing::debug!(worker, "executor worker started");

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.queue.receive(wait) => received,
            };
            match received {
                Ok(Some(message)) => {
                    self.process(message, &cancel).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
                Err(err) => {
                    tracing::warn!(worker, error = %err, "queue receive failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(idle) => {}
                    }
                }
            }
        }
        tracing::debug!(worker, "executor worker stopped");
    }

    async fn process(&self, message: Message, cancel: &CancellationToken) {
        crate::metrics::incr(crate::metrics::QUEUE_MESSAGES_PROCESSED);

        let token_slot: Arc<Mutex<Option<RunToken>>> = Arc::new(Mutex::new(None));
        let heartbeat_cancel = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.queue.clone(),
            self.store.clone(),
            message.clone(),
            Duration::from_secs(self.config.executor_monitor_heartbeat_time),
            Duration::from_secs(self.config.application_queue.queue_visibility_time),
            token_slot.clone(),
            heartbeat_cancel.clone(),
        ));

        let run_cancel = cancel.child_token();
        self.dispatch(&message, &token_slot, &run_cancel).await;

        if let Err(err) = self.queue.ack(&message).await {
            tracing::warn!(message_id = %message.id, error = %err, "failed to ack message");
        }
        heartbeat_cancel.cancel();
        let _ = heartbeat.await;
    }

    async fn dispatch(
        &self,
        message: &Message,
        token_slot: &Mutex<Option<RunToken>>,
        run_cancel: &CancellationToken,
    ) {
        let deadline = match self.handler_deadline(message) {
            Ok(deadline) => deadline,
            Err(err) => {
                crate::metrics::incr(crate::metrics::QUEUE_MESSAGES_INVALID);
                tracing::warn!(
                    message_id = %message.id,
                    kind = message.kind.as_str(),
                    error = %err,
                    "unparseable queue message"
                );
                return;
            }
        };

        let handled = tokio::time::timeout(
            deadline,
            self.dispatch_inner(message, token_slot, run_cancel),
        )
        .await;

        match handled {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                crate::metrics::incr(err.metric());
                tracing::warn!(
                    message_id = %message.id,
                    kind = message.kind.as_str(),
                    error = %err,
                    "message handler failed"
                );
            }
            Err(_elapsed) => {
                crate::metrics::incr(crate::metrics::EXECUTION_TIMEOUTS);
                run_cancel.cancel();
                tracing::warn!(
                    message_id = %message.id,
                    kind = message.kind.as_str(),
                    timeout_seconds = deadline.as_secs(),
                    "message handler timed out"
                );
                let token = token_slot.lock().expect("token slot poisoned").clone();
                if let Some(token) = token {
                    if let Err(err) = self.store.end_run(&token, RunOutcome::Timeout).await {
                        tracing::warn!(
                            monitor_id = token.monitor_id,
                            error = %err,
                            "failed to finalize timed out run"
                        );
                    }
                }
            }
        }
    }

    /// Monitor deadlines honor the definition's own `execution_timeout`.
    fn handler_deadline(&self, message: &Message) -> Result<Duration, serde_json::Error> {
        let default = self.config.executor_timeout(message.kind);
        if message.kind != MessageKind::Monitor {
            return Ok(default);
        }
        let work: MonitorWorkMessage = serde_json::from_value(message.payload.clone())?;
        Ok(self
            .registry
            .get_by_id(work.monitor_id)
            .map(|definition| definition.execution_timeout(default))
            .unwrap_or(default))
    }

    async fn dispatch_inner(
        &self,
        message: &Message,
        token_slot: &Mutex<Option<RunToken>>,
        run_cancel: &CancellationToken,
    ) -> Result<(), ExecutionError> {
        match message.kind {
            MessageKind::Monitor => {
                let work: MonitorWorkMessage = parse_payload(&message.payload)?;
                monitor_run::handle(self, &work, token_slot, run_cancel).await
            }
            MessageKind::Event => {
                let event: EventQueueMessage = parse_payload(&message.payload)?;
                events::handle(self, &event, &message.payload, run_cancel).await
            }
            MessageKind::Request => {
                let request: RequestMessage = parse_payload(&message.payload)?;
                requests::handle(self, &request).await
            }
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    payload: &JsonValue,
) -> Result<T, ExecutionError> {
    serde_json::from_value(payload.clone())
        .map_err(|err| ExecutionError::Validation(format!("invalid payload: {err}")))
}

/// Sibling task renewing the message lease and, once the run token
/// lands, the monitor's heartbeat.
async fn heartbeat_loop(
    queue: Arc<dyn WorkQueue>,
    store: Store,
    message: Message,
    every: Duration,
    visibility: Duration,
    token_slot: Arc<Mutex<Option<RunToken>>>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(err) = queue.extend_visibility(&message, visibility).await {
                    tracing::warn!(message_id = %message.id, error = %err, "visibility extension failed");
                }
                let token = token_slot.lock().expect("token slot poisoned").clone();
                if let Some(token) = token {
                    if let Err(err) = store.heartbeat(&token, Utc::now()).await {
                        tracing::warn!(
                            monitor_id = token.monitor_id,
                            error = %err,
                            "monitor heartbeat failed"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_work_messages_round_trip() {
        let message = MonitorWorkMessage {
            monitor_id: 42,
            monitor_name: "disk_space".to_string(),
            task: MonitorTask::Search,
        };
        let payload = serde_json::to_value(&message).unwrap();
        assert_eq!(payload["task"], "search");

        let parsed: MonitorWorkMessage = serde_json::from_value(payload).unwrap();
        assert_eq!(parsed.monitor_id, 42);
        assert_eq!(parsed.task, MonitorTask::Search);
    }

    #[test]
    fn request_params_default_to_null() {
        let parsed: RequestMessage =
            serde_json::from_value(serde_json::json!({ "action": "monitor_disable" })).unwrap();
        assert_eq!(parsed.action, "monitor_disable");
        assert!(parsed.params.is_null());
    }

    #[test]
    fn unknown_payload_shape_is_a_validation_error() {
        let err = parse_payload::<MonitorWorkMessage>(&serde_json::json!({"nope": 1}))
            .expect_err("must fail");
        assert!(matches!(err, ExecutionError::Validation(_)));
    }
}
