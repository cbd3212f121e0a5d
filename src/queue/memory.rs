use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

use super::{Message, MessageKind, WorkQueue};

/// Bounded in-process FIFO for single-container deployments. Expired
/// leases return to the front of the queue for redelivery.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    arrival: Notify,
    capacity: usize,
    visibility: Duration,
}

struct Inner {
    ready: VecDeque<Stored>,
    in_flight: HashMap<Uuid, Leased>,
}

#[derive(Debug, Clone)]
struct Stored {
    id: Uuid,
    kind: MessageKind,
    payload: JsonValue,
    receive_count: i32,
}

#[derive(Debug, Clone)]
struct Leased {
    message: Stored,
    visible_again_at: Instant,
}

impl MemoryQueue {
    pub fn new(capacity: usize, visibility: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                in_flight: HashMap::new(),
            }),
            arrival: Notify::new(),
            capacity: capacity.max(1),
            visibility,
        }
    }

    fn reclaim_expired(inner: &mut Inner, now: Instant) {
        let expired: Vec<Uuid> = inner
            .in_flight
            .iter()
            .filter(|(_, leased)| leased.visible_again_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(leased) = inner.in_flight.remove(&id) {
                inner.ready.push_front(leased.message);
            }
        }
    }

    fn try_pop(&self, now: Instant) -> Option<Message> {
        let mut inner = self.inner.lock().expect("memory queue poisoned");
        Self::reclaim_expired(&mut inner, now);
        let mut stored = inner.ready.pop_front()?;
        stored.receive_count += 1;
        let message = Message {
            id: stored.id,
            kind: stored.kind,
            payload: stored.payload.clone(),
            receive_count: stored.receive_count,
        };
        inner.in_flight.insert(
            stored.id,
            Leased {
                message: stored,
                visible_again_at: now + self.visibility,
            },
        );
        Some(message)
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn send(&self, kind: MessageKind, payload: JsonValue) -> Result<()> {
        {
            let mut inner = self.inner.lock().expect("memory queue poisoned");
            if inner.ready.len() + inner.in_flight.len() >= self.capacity {
                anyhow::bail!("queue is full ({} messages)", self.capacity);
            }
            inner.ready.push_back(Stored {
                id: Uuid::new_v4(),
                kind,
                payload,
                receive_count: 0,
            });
        }
        self.arrival.notify_one();
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + wait;
        loop {
            let now = Instant::now();
            if let Some(message) = self.try_pop(now) {
                return Ok(Some(message));
            }
            if now >= deadline {
                return Ok(None);
            }
            // A notify can race a concurrent pop; loop re-checks either way.
            let _ = tokio::time::timeout(deadline - now, self.arrival.notified()).await;
        }
    }

    async fn extend_visibility(&self, message: &Message, extension: Duration) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory queue poisoned");
        if let Some(leased) = inner.in_flight.get_mut(&message.id) {
            // A stale lease (message already redelivered) has no say.
            if leased.message.receive_count == message.receive_count {
                leased.visible_again_at = Instant::now() + extension;
            }
        }
        Ok(())
    }

    async fn ack(&self, message: &Message) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory queue poisoned");
        let current = inner
            .in_flight
            .get(&message.id)
            .map(|leased| leased.message.receive_count);
        if current == Some(message.receive_count) {
            inner.in_flight.remove(&message.id);
        }
        Ok(())
    }

    async fn nack(&self, message: &Message) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory queue poisoned");
        let current = inner
            .in_flight
            .get(&message.id)
            .map(|leased| leased.message.receive_count);
        if current == Some(message.receive_count) {
            if let Some(leased) = inner.in_flight.remove(&message.id) {
                inner.ready.push_front(leased.message);
            }
        }
        self.arrival.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(visibility_ms: u64) -> MemoryQueue {
        MemoryQueue::new(16, Duration::from_millis(visibility_ms))
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let queue = queue(10_000);
        for index in 0..3 {
            queue
                .send(MessageKind::Monitor, serde_json::json!({ "index": index }))
                .await
                .unwrap();
        }

        for expected in 0..3 {
            let message = queue
                .receive(Duration::from_millis(10))
                .await
                .unwrap()
                .expect("message");
            assert_eq!(message.payload["index"], expected);
            queue.ack(&message).await.unwrap();
        }
        assert!(queue.receive(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn leased_messages_are_invisible_until_expiry() {
        let queue = queue(50);
        queue
            .send(MessageKind::Event, serde_json::json!({"n": 1}))
            .await
            .unwrap();

        let first = queue
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .expect("first");
        assert_eq!(first.receive_count, 1);
        assert!(queue.receive(Duration::from_millis(10)).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let redelivered = queue
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .expect("redelivery");
        assert_eq!(redelivered.id, first.id);
        assert_eq!(redelivered.receive_count, 2);
    }

    #[tokio::test]
    async fn extend_visibility_defers_redelivery() {
        let queue = queue(40);
        queue
            .send(MessageKind::Monitor, serde_json::json!({}))
            .await
            .unwrap();
        let message = queue
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .expect("message");

        queue
            .extend_visibility(&message, Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(queue.receive(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn nack_redelivers_immediately() {
        let queue = queue(10_000);
        queue
            .send(MessageKind::Request, serde_json::json!({}))
            .await
            .unwrap();
        let message = queue
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .expect("message");
        queue.nack(&message).await.unwrap();

        let again = queue
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .expect("redelivery");
        assert_eq!(again.id, message.id);
        assert_eq!(again.receive_count, 2);
    }

    #[tokio::test]
    async fn send_fails_when_full() {
        let queue = MemoryQueue::new(2, Duration::from_secs(60));
        queue.send(MessageKind::Monitor, serde_json::json!({})).await.unwrap();
        queue.send(MessageKind::Monitor, serde_json::json!({})).await.unwrap();
        assert!(queue
            .send(MessageKind::Monitor, serde_json::json!({}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn ack_after_expiry_does_not_resurrect() {
        let queue = queue(30);
        queue.send(MessageKind::Monitor, serde_json::json!({})).await.unwrap();
        let message = queue
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .expect("message");

        tokio::time::sleep(Duration::from_millis(60)).await;
        let redelivered = queue
            .receive(Duration::from_millis(10))
            .await
            .unwrap()
            .expect("redelivery");
        // Late ack of the stale lease must not drop the active one.
        queue.ack(&message).await.unwrap();
        queue
            .extend_visibility(&redelivered, Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(queue.receive(Duration::from_millis(10)).await.unwrap().is_none());
        queue.ack(&redelivered).await.unwrap();
    }
}
