use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::domain::{EventName, MonitorTask, NewEvent};

pub mod alerts;
pub mod events;
pub mod issues;
pub mod monitors;
pub mod notifications;
pub mod variables;

/// Answers whether a reaction callback is registered for an event, so the
/// outbox knows which rows need publishing.
pub trait ReactionLookup: Send + Sync {
    fn has_reaction(&self, monitor_id: i64, event: EventName) -> bool;
}

#[derive(Clone)]
pub struct EventPolicy {
    pub log_all_events: bool,
    pub reactions: Arc<dyn ReactionLookup>,
}

impl EventPolicy {
    fn disposition(&self, event: &NewEvent) -> EventDisposition {
        if self.reactions.has_reaction(event.monitor_id, event.name) {
            EventDisposition::Publish
        } else if self.log_all_events {
            EventDisposition::PersistOnly
        } else {
            EventDisposition::Discard
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventDisposition {
    Publish,
    PersistOnly,
    Discard,
}

/// Transactional domain state machine. Every operation is one transaction
/// that appends its lifecycle events through the outbox before commit.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    policy: EventPolicy,
    outbox_nudge: Arc<Notify>,
}

impl Store {
    pub fn new(pool: PgPool, policy: EventPolicy) -> Self {
        Self {
            pool,
            policy,
            outbox_nudge: Arc::new(Notify::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Wakes the outbox flusher; fired after commits that queued events.
    pub fn outbox_nudge(&self) -> Arc<Notify> {
        self.outbox_nudge.clone()
    }

    pub(crate) async fn append_events(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        events: &[NewEvent],
    ) -> anyhow::Result<bool> {
        events::append(tx, &self.policy, events).await
    }

    pub(crate) fn after_commit(&self, queued_any: bool) {
        if queued_any {
            self.outbox_nudge.notify_one();
        }
    }
}

/// Outcome recorded by `end_run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Error(String),
    Timeout,
    NotRegistered,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error(_) => "error",
            Self::Timeout => "timeout",
            Self::NotRegistered => "not_registered",
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Error(message) => Some(message),
            _ => None,
        }
    }
}

/// Opaque handle tying heartbeats and `end_run` to one execution row.
#[derive(Debug, Clone)]
pub struct RunToken {
    pub execution_id: Uuid,
    pub monitor_id: i64,
    pub task: MonitorTask,
}

/// How an issue came to be solved; decides which lifecycle event fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveSource {
    Direct,
    Update,
}

pub(crate) fn json_object(value: JsonValue) -> JsonValue {
    if value.is_object() {
        value
    } else {
        serde_json::json!({})
    }
}
