//! The universal message envelope handed to consumer handlers.

use crate::error::BusResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Header value: UTF-8 text or an opaque byte blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Text(String),
    Bytes(Vec<u8>),
}

impl HeaderValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s),
            HeaderValue::Bytes(_) => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::Text(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::Text(s)
    }
}

impl From<Vec<u8>> for HeaderValue {
    fn from(b: Vec<u8>) -> Self {
        HeaderValue::Bytes(b)
    }
}

/// Name → value header mapping; names are unique, order is irrelevant.
pub type Headers = HashMap<String, HeaderValue>;

/// Backend family an envelope or adapter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Memory,
    RedisStreams,
    Rabbitmq,
    Sqs,
    Sns,
    PubSub,
    Kafka,
    NatsJetstream,
    AzureServiceBus,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::RedisStreams => "redis-streams",
            BackendKind::Rabbitmq => "rabbitmq",
            BackendKind::Sqs => "sqs",
            BackendKind::Sns => "sns",
            BackendKind::PubSub => "pubsub",
            BackendKind::Kafka => "kafka",
            BackendKind::NatsJetstream => "nats-jetstream",
            BackendKind::AzureServiceBus => "azure-service-bus",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-specific delivery coordinates, tagged by provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum ProviderMetadata {
    Memory { queue: String },
    RedisStreams { stream: String, entry_id: String },
    Rabbitmq { queue: String, delivery_tag: u64, redelivered: bool },
    Sqs { queue_url: String, receipt_handle: String },
    Sns { topic_arn: String },
    PubSub { subscription: String, ack_id: String },
    Kafka { topic: String, partition: i32, offset: i64 },
    NatsJetstream { stream: String, stream_sequence: u64 },
    AzureServiceBus { entity: String, lock_token: String, sequence_number: i64 },
}

impl ProviderMetadata {
    pub fn provider(&self) -> BackendKind {
        match self {
            ProviderMetadata::Memory { .. } => BackendKind::Memory,
            ProviderMetadata::RedisStreams { .. } => BackendKind::RedisStreams,
            ProviderMetadata::Rabbitmq { .. } => BackendKind::Rabbitmq,
            ProviderMetadata::Sqs { .. } => BackendKind::Sqs,
            ProviderMetadata::Sns { .. } => BackendKind::Sns,
            ProviderMetadata::PubSub { .. } => BackendKind::PubSub,
            ProviderMetadata::Kafka { .. } => BackendKind::Kafka,
            ProviderMetadata::NatsJetstream { .. } => BackendKind::NatsJetstream,
            ProviderMetadata::AzureServiceBus { .. } => BackendKind::AzureServiceBus,
        }
    }
}

/// Settlement primitive an adapter binds to one delivery.
///
/// The envelope owns the handle exclusively; adapters implement it over the
/// backend acknowledgement concept (XACK, basic.ack, DeleteMessage, offset
/// commit, ...). Implementations do not need to defend against double calls —
/// the envelope serializes settlement and guarantees at most one.
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self) -> BusResult<()>;

    /// Negative acknowledgement. `requeue` asks the backend to make the
    /// message available again; `false` releases it per backend policy.
    async fn nack(&self, requeue: bool) -> BusResult<()>;

    /// Lengthen the lock/visibility window for this delivery. Backends
    /// without the concept return `NOT_IMPLEMENTED`.
    async fn extend_deadline(&self, seconds: u32) -> BusResult<()>;
}

/// Immutable delivery record handed to handlers.
pub struct Message {
    id: String,
    body: Value,
    key: Option<String>,
    headers: Headers,
    timestamp: DateTime<Utc>,
    delivery_attempt: u32,
    metadata: ProviderMetadata,
    raw: Option<Arc<dyn std::any::Any + Send + Sync>>,
    handle: Arc<dyn AckHandle>,
    settled: AtomicBool,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("delivery_attempt", &self.delivery_attempt)
            .field("metadata", &self.metadata)
            .field("settled", &self.settled.load(Ordering::Relaxed))
            .finish()
    }
}

impl Message {
    pub fn builder(
        id: impl Into<String>,
        body: Value,
        metadata: ProviderMetadata,
        handle: Arc<dyn AckHandle>,
    ) -> MessageBuilder {
        MessageBuilder {
            id: id.into(),
            body,
            key: None,
            headers: Headers::new(),
            timestamp: Utc::now(),
            delivery_attempt: 1,
            metadata,
            raw: None,
            handle,
        }
    }

    /// Unique per delivery.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Decode the body into a typed value.
    pub fn body_as<T: DeserializeOwned>(&self) -> BusResult<T> {
        serde_json::from_value(self.body.clone()).map_err(|e| {
            crate::error::BusError::serialization("message body does not match expected shape")
                .with_cause(e)
        })
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header_text(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(HeaderValue::as_text)
    }

    /// Original publication time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// 1-based count of deliveries of this message to the consumer group.
    pub fn delivery_attempt(&self) -> u32 {
        self.delivery_attempt
    }

    pub fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    pub fn provider(&self) -> BackendKind {
        self.metadata.provider()
    }

    /// Escape hatch to the underlying SDK delivery object, when the adapter
    /// chose to expose it.
    pub fn raw<T: 'static>(&self) -> Option<&T> {
        self.raw.as_deref().and_then(|r| r.downcast_ref::<T>())
    }

    /// Whether `ack` or `nack` already ran for this delivery.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Positively acknowledge this delivery. Idempotent: repeat settlement
    /// calls are no-ops.
    pub async fn ack(&self) -> BusResult<()> {
        if self.settle() {
            self.handle.ack().await
        } else {
            tracing::debug!(message_id = %self.id, "ignoring repeated settlement (ack)");
            Ok(())
        }
    }

    /// Negatively acknowledge this delivery. Idempotent like [`Message::ack`].
    pub async fn nack(&self, requeue: bool) -> BusResult<()> {
        if self.settle() {
            self.handle.nack(requeue).await
        } else {
            tracing::debug!(message_id = %self.id, "ignoring repeated settlement (nack)");
            Ok(())
        }
    }

    /// Extend the delivery deadline; a no-op once settled.
    pub async fn extend_deadline(&self, seconds: u32) -> BusResult<()> {
        if self.is_settled() {
            return Ok(());
        }
        self.handle.extend_deadline(seconds).await
    }

    fn settle(&self) -> bool {
        self.settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

pub struct MessageBuilder {
    id: String,
    body: Value,
    key: Option<String>,
    headers: Headers,
    timestamp: DateTime<Utc>,
    delivery_attempt: u32,
    metadata: ProviderMetadata,
    raw: Option<Arc<dyn std::any::Any + Send + Sync>>,
    handle: Arc<dyn AckHandle>,
}

impl MessageBuilder {
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn maybe_key(mut self, key: Option<String>) -> Self {
        self.key = key;
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn delivery_attempt(mut self, attempt: u32) -> Self {
        self.delivery_attempt = attempt.max(1);
        self
    }

    pub fn raw(mut self, raw: Arc<dyn std::any::Any + Send + Sync>) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn build(self) -> Message {
        Message {
            id: self.id,
            body: self.body,
            key: self.key,
            headers: self.headers,
            timestamp: self.timestamp,
            delivery_attempt: self.delivery_attempt,
            metadata: self.metadata,
            raw: self.raw,
            handle: self.handle,
            settled: AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records every settlement call for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingHandle {
        pub calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AckHandle for RecordingHandle {
        async fn ack(&self) -> BusResult<()> {
            self.calls.lock().unwrap().push("ack".into());
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> BusResult<()> {
            self.calls.lock().unwrap().push(format!("nack:{requeue}"));
            Ok(())
        }

        async fn extend_deadline(&self, seconds: u32) -> BusResult<()> {
            self.calls.lock().unwrap().push(format!("extend:{seconds}"));
            Ok(())
        }
    }
}
