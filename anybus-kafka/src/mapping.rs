//! Pure mapping between the universal contract and Kafka concepts.

use anybus::{HeaderValue, PublishOptions};
use thiserror::Error;

/// Connection and topology settings for one Kafka adapter.
#[derive(Debug, Clone)]
pub struct KafkaOptions {
    /// `bootstrap.servers` list.
    pub brokers: Vec<String>,
    pub topic: String,
    /// Consumer group; required for consumers.
    pub group_id: Option<String>,
    /// Enable producer idempotence (`enable.idempotence`). Off by default.
    pub idempotence: bool,
}

impl KafkaOptions {
    pub fn new(brokers: Vec<String>, topic: impl Into<String>) -> Self {
        Self { brokers, topic: topic.into(), group_id: None, idempotence: false }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_idempotence(mut self) -> Self {
        self.idempotence = true;
        self
    }

    pub fn validate(&self) -> Result<(), KafkaConfigError> {
        if self.brokers.is_empty() {
            return Err(KafkaConfigError::NoBrokers);
        }
        if self.topic.is_empty() {
            return Err(KafkaConfigError::EmptyTopic);
        }
        Ok(())
    }

    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KafkaConfigError {
    #[error("at least one bootstrap broker is required")]
    NoBrokers,
    #[error("topic must not be empty")]
    EmptyTopic,
}

/// Kafka assigns no message IDs; the coordinate triple is the identity.
pub fn synthesize_message_id(topic: &str, partition: i32, offset: i64) -> String {
    format!("{topic}-{partition}-{offset}")
}

/// The record key: explicit publish key first, ordering key as fallback so
/// ordering-keyed payloads still co-partition.
pub fn record_key(options: &PublishOptions) -> Option<&str> {
    options.key.as_deref().or(options.ordering_key.as_deref())
}

/// Flatten contract headers (plus correlation/reply-to conventions) into
/// Kafka record headers.
pub fn record_headers(options: &PublishOptions) -> Vec<(String, Vec<u8>)> {
    let mut headers: Vec<(String, Vec<u8>)> = options
        .headers
        .iter()
        .map(|(name, value)| {
            let bytes = match value {
                HeaderValue::Text(s) => s.clone().into_bytes(),
                HeaderValue::Bytes(b) => b.clone(),
            };
            (name.clone(), bytes)
        })
        .collect();
    headers.sort_by(|a, b| a.0.cmp(&b.0));

    if let Some(correlation_id) = &options.correlation_id {
        headers.push(("correlation-id".into(), correlation_id.clone().into_bytes()));
    }
    if let Some(reply_to) = &options.reply_to {
        headers.push(("reply-to".into(), reply_to.clone().into_bytes()));
    }
    headers
}

/// Kafka has no broker-side delivery counter; every delivery reports 1.
pub const fn delivery_attempt() -> u32 {
    1
}
