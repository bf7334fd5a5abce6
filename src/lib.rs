#![forbid(unsafe_code)]

//! # anybus
//!
//! One producer/consumer contract over a heterogeneous set of message-queue
//! backends. Business code writes against the [`Producer`] and [`Consumer`]
//! traits and swaps brokers without rewriting.
//!
//! ## What's in the box
//!
//! - **Contract layer**: message envelope with one-shot settlement, publish
//!   and subscribe options, health checks, a typed consumer event stream
//! - **Resilience middleware**: bounded retry with pluggable backoff curves
//!   and a three-state circuit breaker, composed as `breaker(retry(op))`
//! - **JSON codec** with tagged encodings for integers beyond double
//!   precision and ISO-8601 timestamps
//! - **In-memory reference backend**: FIFO queue with in-flight tracking,
//!   requeue, dead-letter routing, and capacity/age limits — the contract's
//!   ground truth and the test target
//!
//! Remote backends (Kafka, NATS JetStream, ...) live in companion adapter
//! crates that map their SDK concepts onto this contract.
//!
//! ## Quick start
//!
//! ```rust
//! use anybus::memory::{MemoryConsumer, MemoryProducer};
//! use anybus::{handler_fn, BusConfig, Consumer, Producer, PublishOptions, SubscribeOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), anybus::BusError> {
//!     let producer = MemoryProducer::new("orders", BusConfig::default())?;
//!     producer.connect().await?;
//!     producer.publish(json!({ "orderId": "123" }), PublishOptions::default()).await?;
//!
//!     let consumer = MemoryConsumer::new("orders", BusConfig::default())?;
//!     consumer.connect().await?;
//!     consumer
//!         .subscribe(
//!             handler_fn(|message| async move {
//!                 println!("got {}", message.id());
//!                 Ok(())
//!             }),
//!             SubscribeOptions::default(),
//!         )
//!         .await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_millis(50)).await;
//!     consumer.disconnect().await?;
//!     producer.disconnect().await?;
//!     Ok(())
//! }
//! ```

mod backoff;
mod circuit_breaker;
mod clock;
mod config;
mod contract;
mod error;
mod ids;
pub mod memory;
mod message;
mod resilience;
mod retry;
mod serializer;
mod sleeper;

// Re-exports
pub use backoff::{Backoff, Jitter, DEFAULT_JITTER_FACTOR};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics, CircuitState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{
    BackoffStrategy, BusConfig, CircuitBreakerConfig, DeadLetterConfig, LogLevel, LoggingConfig,
    RetryConfig,
};
pub use contract::{
    batch_handler_fn, handler_fn, BatchHandler, Consumer, ConsumerEvent, HealthStatus,
    MessageHandler, OutgoingMessage, Producer, PublishOptions, SeekPosition, SubscribeOptions,
};
pub use error::{BusError, BusResult, ErrorKind};
pub use ids::{client_id, message_id};
pub use message::{
    AckHandle, BackendKind, HeaderValue, Headers, Message, MessageBuilder, ProviderMetadata,
};
pub use resilience::ResilienceExecutor;
pub use retry::{RetryAttempt, RetryExecutor, RetryObserver};
pub use serializer::{JsonCodec, JsonCodecOptions, Serializer, SerializerExt};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};

pub mod prelude;
