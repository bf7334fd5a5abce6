//! Producer and consumer contracts every backend adapter implements.

use crate::error::{BusError, BusResult};
use crate::message::{BackendKind, Headers, Message};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Per-publish options. Backends ignore options they do not support.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Routing/partition key.
    pub key: Option<String>,
    pub headers: Headers,
    /// Explicit partition for partitioned backends.
    pub partition: Option<i32>,
    /// Delay before the message becomes visible.
    pub delay_seconds: Option<u32>,
    /// FIFO group (SQS/SNS MessageGroupId, Azure sessionId).
    pub group_id: Option<String>,
    pub deduplication_id: Option<String>,
    pub ordering_key: Option<String>,
    pub priority: Option<u8>,
    pub ttl_ms: Option<u64>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl PublishOptions {
    pub fn with_key(key: impl Into<String>) -> Self {
        Self { key: Some(key.into()), ..Default::default() }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<crate::message::HeaderValue>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// One entry of a batch publish.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub body: Value,
    pub options: PublishOptions,
}

impl OutgoingMessage {
    pub fn new(body: Value) -> Self {
        Self { body, options: PublishOptions::default() }
    }

    pub fn with_options(body: Value, options: PublishOptions) -> Self {
        Self { body, options }
    }
}

/// Subscription behavior knobs.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Replay from the earliest retained message where supported.
    pub from_beginning: bool,
    pub from_timestamp: Option<DateTime<Utc>>,
    /// Envelopes that may be in flight to handlers concurrently.
    pub concurrency: usize,
    /// Acknowledge automatically when the handler returns `Ok`.
    pub auto_ack: bool,
    /// Upper bound per fetch/batch dispatch.
    pub batch_size: usize,
    /// Dispatch a partial batch once this elapses after its first message.
    pub batch_timeout_ms: u64,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            from_beginning: false,
            from_timestamp: None,
            concurrency: 1,
            auto_ack: true,
            batch_size: 10,
            batch_timeout_ms: 1_000,
        }
    }
}

/// Offset repositioning target for backends that support `seek`.
#[derive(Debug, Clone, PartialEq)]
pub enum SeekPosition {
    Beginning,
    End,
    Offset(u64),
    Timestamp(DateTime<Utc>),
}

/// Result shape of `health_check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthStatus {
    pub fn healthy(latency_ms: u64) -> Self {
        Self { healthy: true, connected: true, latency_ms: Some(latency_ms), details: None, error: None }
    }

    pub fn unhealthy(connected: bool, error: impl Into<String>) -> Self {
        Self { healthy: false, connected, latency_ms: None, details: None, error: Some(error.into()) }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Out-of-band consumer notifications.
///
/// Errors travel as `Arc` so one event can fan out to every subscriber of the
/// broadcast channel.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    /// Handler or transport error tied to one delivery; the loop keeps going.
    Error { message_id: Option<String>, error: Arc<BusError> },
    /// In-flight deliveries crossed the concurrency high-watermark.
    Backpressure { in_flight: usize, limit: usize },
    /// Partition/stream assignment is being revoked.
    Rebalancing,
    /// Assignment settled again.
    Rebalanced,
    /// Connection-level failure; the subscription is no longer serviced.
    Crash { error: Arc<BusError> },
    /// A message was dispatched to the handler.
    Message { message_id: String },
}

/// Message handler invoked per delivery.
pub type MessageHandler = Arc<dyn Fn(Arc<Message>) -> BoxFuture<'static, BusResult<()>> + Send + Sync>;

/// Handler invoked with a framed batch; an error releases the whole batch.
pub type BatchHandler = Arc<dyn Fn(Vec<Arc<Message>>) -> BoxFuture<'static, BusResult<()>> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = BusResult<()>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// Wrap an async closure as a [`BatchHandler`].
pub fn batch_handler_fn<F, Fut>(f: F) -> BatchHandler
where
    F: Fn(Vec<Arc<Message>>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = BusResult<()>> + Send + 'static,
{
    Arc::new(move |batch| Box::pin(f(batch)))
}

/// Publishing side of the contract.
#[async_trait]
pub trait Producer: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Idempotent. Opens the transport and asserts declared topology.
    async fn connect(&self) -> BusResult<()>;

    /// Idempotent; flushes pending sends where supported. Never fails on a
    /// double disconnect.
    async fn disconnect(&self) -> BusResult<()>;

    fn is_connected(&self) -> bool;

    /// Serialize `body` and hand it to the backend. Returns the broker
    /// assigned (or synthesized) message ID.
    async fn publish(&self, body: Value, options: PublishOptions) -> BusResult<String>;

    /// Publish several messages, preserving input order in the returned IDs.
    async fn publish_batch(&self, messages: Vec<OutgoingMessage>) -> BusResult<Vec<String>>;

    /// Ensure buffered messages are on the wire. Default: no-op.
    async fn flush(&self) -> BusResult<()> {
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus;
}

/// Consuming side of the contract.
#[async_trait]
pub trait Consumer: Send + Sync {
    fn backend(&self) -> BackendKind;

    async fn connect(&self) -> BusResult<()>;

    /// Stops the delivery loop promptly; already-fetched messages are
    /// released back to the broker.
    async fn disconnect(&self) -> BusResult<()>;

    fn is_connected(&self) -> bool;

    /// Start the delivery loop, invoking `handler` per message.
    async fn subscribe(&self, handler: MessageHandler, options: SubscribeOptions) -> BusResult<()>;

    /// Deliver in groups bounded by `batch_size` and `batch_timeout_ms`,
    /// whichever triggers first.
    async fn subscribe_batch(
        &self,
        handler: BatchHandler,
        options: SubscribeOptions,
    ) -> BusResult<()>;

    /// Stop dispatching to the handler after the current call returns.
    /// Deliveries the transport already handed over are released to the
    /// broker, never buffered in process memory.
    async fn pause(&self);

    async fn resume(&self);

    fn is_paused(&self) -> bool;

    /// Reposition the consumer. Optional.
    async fn seek(&self, _position: SeekPosition) -> BusResult<()> {
        Err(BusError::not_implemented("seek", self.backend().as_str()))
    }

    /// Outstanding message count behind the tip. Optional.
    async fn lag(&self) -> BusResult<u64> {
        Err(BusError::not_implemented("lag", self.backend().as_str()))
    }

    /// Subscribe to out-of-band consumer events.
    fn events(&self) -> broadcast::Receiver<ConsumerEvent>;

    async fn health_check(&self) -> HealthStatus;
}
