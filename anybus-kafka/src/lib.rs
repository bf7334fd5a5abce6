//! Kafka adapter for `anybus` (companion crate).
//!
//! Maps Kafka concepts onto the universal contract:
//!
//! - publish key → record key; `partition` pins the partition explicitly
//! - headers → record headers (text and binary values pass through)
//! - message IDs are synthesized as `topic-partition-offset`
//! - ack → offset commit; nack-with-requeue → seek back to the offset
//!   (Kafka has no native nack)
//! - `delivery_attempt` is always 1: the broker keeps no attempt counter
//! - DLQ routing stays app-level through the core's dead-letter config
//!
//! The mapping layer always compiles; enable the `client` feature to pull in
//! `rdkafka` and the concrete [`Producer`]/[`Consumer`] implementations.
//!
//! [`Producer`]: anybus::Producer
//! [`Consumer`]: anybus::Consumer

mod mapping;

pub use mapping::{
    delivery_attempt, record_headers, record_key, synthesize_message_id, KafkaConfigError,
    KafkaOptions,
};

#[cfg(feature = "client")]
mod client;

#[cfg(feature = "client")]
pub use client::{KafkaConsumer, KafkaProducer};
