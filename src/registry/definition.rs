use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::domain::{EventName, Priority};
use crate::store::Store;

use super::options::{
    AlertOptions, IssueOptions, MonitorOptions, MonitorOptionsDocument, NotificationConfig,
};

/// Name of the engine's own pool inside the context pool map.
pub const APPLICATION_POOL: &str = "application";

/// Capabilities handed to monitor callbacks: the monitor's identity, its
/// variables, and the named query pools. Blocking work belongs in
/// `tokio::task::spawn_blocking`; the context never blocks the scheduler.
#[derive(Clone)]
pub struct MonitorContext {
    monitor_id: i64,
    monitor_name: String,
    store: Store,
    pools: Arc<BTreeMap<String, PgPool>>,
    cancel: CancellationToken,
}

impl MonitorContext {
    pub fn new(
        monitor_id: i64,
        monitor_name: String,
        store: Store,
        pools: Arc<BTreeMap<String, PgPool>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            monitor_id,
            monitor_name,
            store,
            pools,
            cancel,
        }
    }

    pub fn monitor_id(&self) -> i64 {
        self.monitor_id
    }

    pub fn monitor_name(&self) -> &str {
        &self.monitor_name
    }

    /// Named query pool (`DATABASE_<NAME>`), lowercased.
    pub fn pool(&self, name: &str) -> Option<&PgPool> {
        self.pools.get(&name.trim().to_lowercase())
    }

    /// Deadline signal; long callbacks should return promptly once set.
    pub fn cancelled(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn get_variable(&self, name: &str) -> Result<Option<JsonValue>> {
        self.store.get_variable(self.monitor_id, name).await
    }

    pub async fn set_variable(&self, name: &str, value: &JsonValue) -> Result<()> {
        self.store.set_variable(self.monitor_id, name, value).await
    }

    /// Ensures an active notification exists for the alert when its
    /// priority clears the configured threshold.
    pub async fn ensure_notification(
        &self,
        alert_id: i64,
        config: &NotificationConfig,
    ) -> Result<()> {
        let alert = self
            .store
            .alert_by_id(alert_id)
            .await?
            .with_context(|| format!("alert {alert_id} not found"))?;
        if alert.status != crate::domain::AlertStatus::Active.as_str() {
            return Ok(());
        }
        let priority = alert.priority();
        if priority == Priority::None || config.min_priority_to_send.more_severe_than(priority) {
            return Ok(());
        }
        let target = format!("{}:alert-{}", config.notification_class, alert_id);
        self.store
            .create_notification(
                alert_id,
                &config.notification_class,
                &target,
                config.min_priority_to_send,
                &config.mention,
            )
            .await?;
        Ok(())
    }
}

pub type ReactionFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type ReactionFn = dyn Fn(MonitorContext, JsonValue) -> ReactionFuture + Send + Sync;

pub struct ReactionBinding {
    pub event_name: EventName,
    pub callback: Arc<ReactionFn>,
}

/// A compiled monitor registered through the catalogue. Declares its
/// options document and implements the detection callbacks.
#[async_trait]
pub trait MonitorModule: Send + Sync {
    fn name(&self) -> &str;

    fn options(&self) -> MonitorOptionsDocument;

    /// Source revision recorded in the store; versioning only.
    fn source(&self) -> String {
        String::new()
    }

    /// Detect current problems. `None` means "nothing to report".
    async fn search(&self, ctx: &MonitorContext) -> Result<Option<Vec<JsonValue>>>;

    /// Refresh the payloads of active issues. `None` leaves them as-is.
    async fn update(
        &self,
        _ctx: &MonitorContext,
        _active: Vec<JsonValue>,
    ) -> Result<Option<Vec<JsonValue>>> {
        Ok(None)
    }

    fn is_solved(&self, data: &JsonValue) -> Result<bool>;

    fn reactions(&self) -> Vec<ReactionBinding> {
        Vec::new()
    }
}

/// A loaded monitor: validated options bound to runtime identity and the
/// module callbacks. Immutable; the registry swaps whole definitions.
pub struct MonitorDefinition {
    pub monitor_id: i64,
    pub name: String,
    pub options: MonitorOptions,
    pub issue_options: IssueOptions,
    pub alert_options: Option<AlertOptions>,
    pub notification_options: Vec<NotificationConfig>,
    pub module: Arc<dyn MonitorModule>,
    pub reactions: HashMap<EventName, Vec<Arc<ReactionFn>>>,
    pub search_schedule: Option<cron::Schedule>,
    pub update_schedule: Option<cron::Schedule>,
}

impl MonitorDefinition {
    pub fn build(
        monitor_id: i64,
        name: String,
        module: Arc<dyn MonitorModule>,
    ) -> Result<Self, String> {
        let document = module.options();
        document.validate()?;

        let search_schedule = document
            .monitor_options
            .search_cron
            .as_deref()
            .map(crate::time::parse_schedule)
            .transpose()
            .map_err(|err| err.to_string())?;
        let update_schedule = document
            .monitor_options
            .update_cron
            .as_deref()
            .map(crate::time::parse_schedule)
            .transpose()
            .map_err(|err| err.to_string())?;

        let mut reactions: HashMap<EventName, Vec<Arc<ReactionFn>>> = HashMap::new();
        for binding in module.reactions() {
            reactions
                .entry(binding.event_name)
                .or_default()
                .push(binding.callback);
        }
        for notification in &document.notification_options {
            for event_name in [EventName::AlertCreated, EventName::AlertUpdated] {
                reactions
                    .entry(event_name)
                    .or_default()
                    .push(notification_reaction(notification.clone()));
            }
        }

        Ok(Self {
            monitor_id,
            name,
            options: document.monitor_options,
            issue_options: document.issue_options,
            alert_options: document.alert_options,
            notification_options: document.notification_options,
            module,
            reactions,
            search_schedule,
            update_schedule,
        })
    }

    pub fn execution_timeout(&self, default: Duration) -> Duration {
        self.options
            .execution_timeout
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    pub fn max_issues_creation(&self, global: usize) -> usize {
        self.options.max_issues_creation.unwrap_or(global)
    }

    pub fn has_reaction(&self, event: EventName) -> bool {
        self.reactions.contains_key(&event)
    }
}

/// Built-in reaction keeping notification rows in step with alert
/// lifecycle events.
fn notification_reaction(config: NotificationConfig) -> Arc<ReactionFn> {
    Arc::new(move |ctx: MonitorContext, payload: JsonValue| {
        let config = config.clone();
        Box::pin(async move {
            let source = payload
                .get("event_source")
                .and_then(|value| value.as_str())
                .unwrap_or_default();
            if source != "alert" {
                return Ok(());
            }
            let alert_id = payload
                .get("event_source_id")
                .and_then(|value| value.as_i64())
                .context("alert event payload missing event_source_id")?;
            ctx.ensure_notification(alert_id, &config).await
        })
    })
}
