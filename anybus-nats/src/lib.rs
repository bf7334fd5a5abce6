//! NATS JetStream adapter for `anybus` (companion crate).
//!
//! Maps JetStream concepts onto the universal contract:
//!
//! - publish key → subject suffix (`orders.events.<key>`), so keyed messages
//!   co-locate on a filtered subject
//! - headers, key and publication time travel in a JSON wire envelope
//!   alongside the body
//! - ack → `msg.ack()`; nack-with-requeue → NAK; reject-without-requeue →
//!   TERM (the stream's max-deliver policy then owns dead-lettering)
//! - extend deadline → progress ack (`working`)
//! - `delivery_attempt` comes from the server's delivery count
//! - streams and durable consumers are created on connect when missing
//!
//! The mapping layer always compiles; enable the `client` feature to pull in
//! `async-nats` and the concrete [`Producer`]/[`Consumer`] implementations.
//!
//! [`Producer`]: anybus::Producer
//! [`Consumer`]: anybus::Consumer

mod mapping;

pub use mapping::{
    attempt_from_delivered, sanitize_token, subject_for, NatsConfigError, NatsOptions,
    WireEnvelope,
};

#[cfg(feature = "client")]
mod client;

#[cfg(feature = "client")]
pub use client::{NatsConsumer, NatsProducer};
