use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{QueueKind, QueueSettings};

pub mod memory;
pub mod postgres;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Monitor,
    Event,
    Request,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monitor => "monitor",
            Self::Event => "event",
            Self::Request => "request",
        }
    }
}

pub fn parse_message_kind(value: &str) -> Option<MessageKind> {
    match value.trim().to_lowercase().as_str() {
        "monitor" => Some(MessageKind::Monitor),
        "event" => Some(MessageKind::Event),
        "request" => Some(MessageKind::Request),
        _ => None,
    }
}

/// A leased message. Invisible to other consumers until its visibility
/// window lapses; consumers must `ack` (done) or `nack` (retry now).
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub kind: MessageKind,
    pub payload: JsonValue,
    pub receive_count: i32,
}

/// FIFO transport with per-message visibility leases. Ordering is
/// best-effort; consumers must be idempotent.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn send(&self, kind: MessageKind, payload: JsonValue) -> Result<()>;
    async fn receive(&self, wait: Duration) -> Result<Option<Message>>;
    async fn extend_visibility(&self, message: &Message, extension: Duration) -> Result<()>;
    async fn ack(&self, message: &Message) -> Result<()>;
    async fn nack(&self, message: &Message) -> Result<()>;
}

pub fn build(settings: &QueueSettings, pool: &PgPool) -> Arc<dyn WorkQueue> {
    let visibility = Duration::from_secs(settings.queue_visibility_time);
    match settings.kind {
        QueueKind::Memory => Arc::new(memory::MemoryQueue::new(
            settings.max_pending_messages,
            visibility,
        )),
        QueueKind::Postgres => Arc::new(postgres::PostgresQueue::new(pool.clone(), visibility)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kinds_parse_their_wire_form() {
        for kind in [MessageKind::Monitor, MessageKind::Event, MessageKind::Request] {
            assert_eq!(parse_message_kind(kind.as_str()), Some(kind));
        }
        assert_eq!(parse_message_kind("telemetry"), None);
    }
}
