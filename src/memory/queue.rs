//! FIFO queue with in-flight tracking, the backing store of the memory backend.

use crate::ids;
use crate::message::{HeaderValue, Headers};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// A message at rest in a [`MemoryQueue`].
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub body: Value,
    pub key: Option<String>,
    pub headers: Headers,
    pub timestamp: DateTime<Utc>,
    /// Deliveries so far; incremented on every dequeue.
    pub delivery_attempt: u32,
}

/// Capacity and retention limits; both unbounded by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryQueueOptions {
    /// Drop the oldest ready message once this many are queued.
    pub max_messages: Option<usize>,
    /// Evict ready messages older than this, lazily on enqueue/dequeue.
    pub max_age: Option<Duration>,
}

#[derive(Debug, Default)]
struct QueueInner {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<String, StoredMessage>,
}

/// Process-local FIFO queue.
///
/// All mutations are serialized behind one mutex; the queue is shared by any
/// number of producers and consumers holding the same `Arc`.
#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    options: MemoryQueueOptions,
    inner: Mutex<QueueInner>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>, options: MemoryQueueOptions) -> Self {
        Self { name: name.into(), options, inner: Mutex::new(QueueInner::default()) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a message, enforcing capacity and age limits. Returns the
    /// synthesized message ID.
    pub fn enqueue(&self, body: Value, key: Option<String>, headers: Headers) -> String {
        self.enqueue_at(body, key, headers, Utc::now())
    }

    /// Like [`MemoryQueue::enqueue`] with an explicit publication timestamp,
    /// used when forwarding an existing message (dead-lettering).
    pub fn enqueue_at(
        &self,
        body: Value,
        key: Option<String>,
        headers: Headers,
        timestamp: DateTime<Utc>,
    ) -> String {
        let id = ids::message_id();
        let message = StoredMessage {
            id: id.clone(),
            body,
            key,
            headers,
            timestamp,
            delivery_attempt: 0,
        };

        let mut inner = self.lock();
        self.evict_expired(&mut inner);
        inner.ready.push_back(message);
        if let Some(max) = self.options.max_messages {
            while inner.ready.len() > max {
                if let Some(dropped) = inner.ready.pop_front() {
                    tracing::warn!(
                        queue = %self.name,
                        message_id = %dropped.id,
                        max_messages = max,
                        "queue over capacity, dropping oldest message"
                    );
                }
            }
        }
        id
    }

    /// Remove the head message, moving it to the in-flight map with its
    /// delivery attempt incremented.
    pub fn dequeue(&self) -> Option<StoredMessage> {
        let mut inner = self.lock();
        self.evict_expired(&mut inner);
        let mut message = inner.ready.pop_front()?;
        message.delivery_attempt += 1;
        inner.in_flight.insert(message.id.clone(), message.clone());
        Some(message)
    }

    /// Dequeue up to `n` messages, stopping early when the queue drains.
    pub fn dequeue_batch(&self, n: usize) -> Vec<StoredMessage> {
        let mut batch = Vec::with_capacity(n.min(16));
        for _ in 0..n {
            match self.dequeue() {
                Some(message) => batch.push(message),
                None => break,
            }
        }
        batch
    }

    /// Settle an in-flight message. Returns whether it was in flight.
    pub fn ack(&self, id: &str) -> bool {
        self.lock().in_flight.remove(id).is_some()
    }

    /// Negatively settle an in-flight message. With `requeue`, the message
    /// becomes the next one dequeued.
    pub fn nack(&self, id: &str, requeue: bool) -> bool {
        let mut inner = self.lock();
        match inner.in_flight.remove(id) {
            Some(message) if requeue => {
                inner.ready.push_front(message);
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Move an in-flight message onto `dlq`, recording the death context in
    /// the forwarded headers.
    pub fn dead_letter(&self, id: &str, dlq: &MemoryQueue, error: Option<&str>) -> bool {
        let message = match self.lock().in_flight.remove(id) {
            Some(m) => m,
            None => return false,
        };

        let mut headers = message.headers.clone();
        headers.insert("x-original-queue".into(), HeaderValue::Text(self.name.clone()));
        headers.insert(
            "x-death-reason".into(),
            HeaderValue::Text(error.unwrap_or("max retries exceeded").to_string()),
        );
        headers.insert("x-death-time".into(), HeaderValue::Text(Utc::now().to_rfc3339()));
        headers.insert(
            "x-delivery-attempts".into(),
            HeaderValue::Text(message.delivery_attempt.to_string()),
        );

        tracing::warn!(
            queue = %self.name,
            dlq = %dlq.name,
            message_id = %id,
            attempts = message.delivery_attempt,
            "dead-lettering message"
        );
        dlq.enqueue_at(message.body, message.key, headers, message.timestamp);
        true
    }

    /// Drop every ready and in-flight message.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.ready.clear();
        inner.in_flight.clear();
    }

    /// Ready (not in-flight) messages.
    pub fn size(&self) -> usize {
        self.lock().ready.len()
    }

    /// Dequeued but unsettled messages.
    pub fn processing_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.lock();
        inner.ready.is_empty() && inner.in_flight.is_empty()
    }

    fn evict_expired(&self, inner: &mut QueueInner) {
        let Some(max_age) = self.options.max_age else { return };
        let Ok(max_age) = chrono::Duration::from_std(max_age) else { return };
        let cutoff = Utc::now() - max_age;
        while let Some(front) = inner.ready.front() {
            if front.timestamp < cutoff {
                let expired = inner.ready.pop_front();
                if let Some(expired) = expired {
                    tracing::debug!(
                        queue = %self.name,
                        message_id = %expired.id,
                        "evicting expired message"
                    );
                }
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
