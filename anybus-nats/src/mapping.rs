//! Pure mapping between the universal contract and JetStream concepts.

use anybus::Headers;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Connection and topology settings for one JetStream adapter.
#[derive(Debug, Clone)]
pub struct NatsOptions {
    pub url: String,
    /// Stream name; also the root of the publish subject space.
    pub stream: String,
    /// Base subject messages publish to; keyed messages get a suffix token.
    pub subject: String,
    /// Durable consumer name.
    pub durable: Option<String>,
    /// Server-side delivery budget before the stream terminates a message.
    pub max_deliver: Option<i64>,
}

impl NatsOptions {
    pub fn new(url: impl Into<String>, stream: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: stream.into(),
            subject: subject.into(),
            durable: None,
            max_deliver: None,
        }
    }

    pub fn with_durable(mut self, durable: impl Into<String>) -> Self {
        self.durable = Some(durable.into());
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: i64) -> Self {
        self.max_deliver = Some(max_deliver);
        self
    }

    pub fn validate(&self) -> Result<(), NatsConfigError> {
        if self.url.is_empty() {
            return Err(NatsConfigError::EmptyUrl);
        }
        if self.stream.is_empty() {
            return Err(NatsConfigError::EmptyStream);
        }
        if self.subject.is_empty() || self.subject.contains(['*', '>']) {
            return Err(NatsConfigError::InvalidSubject(self.subject.clone()));
        }
        Ok(())
    }

    /// Wildcard covering the base subject and every keyed suffix.
    pub fn subject_filter(&self) -> String {
        format!("{}.>", self.subject)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NatsConfigError {
    #[error("server url must not be empty")]
    EmptyUrl,
    #[error("stream name must not be empty")]
    EmptyStream,
    #[error("publish subject {0:?} must be non-empty and wildcard-free")]
    InvalidSubject(String),
}

/// Replace characters that are meaningful in subject grammar.
pub fn sanitize_token(token: &str) -> String {
    token
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Subject for one publish: the base subject, suffixed by the sanitized key
/// when present so keyed traffic shares a filterable subject.
pub fn subject_for(base: &str, key: Option<&str>) -> String {
    match key {
        Some(key) if !key.is_empty() => format!("{base}.{}", sanitize_token(key)),
        _ => format!("{base}._"),
    }
}

/// JSON wire envelope carrying the contract fields core NATS payloads lack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Headers::is_empty")]
    pub headers: Headers,
    pub published_at: DateTime<Utc>,
}

impl WireEnvelope {
    pub fn new(body: Value, key: Option<String>, headers: Headers) -> Self {
        Self { body, key, headers, published_at: Utc::now() }
    }
}

/// The server reports how many times a message was delivered; that count is
/// the contract's 1-based delivery attempt.
pub fn attempt_from_delivered(delivered: i64) -> u32 {
    delivered.max(1).min(u32::MAX as i64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use anybus::HeaderValue;
    use serde_json::json;

    #[test]
    fn keyed_subjects_get_a_sanitized_suffix() {
        assert_eq!(subject_for("orders.events", Some("user-42")), "orders.events.user-42");
        assert_eq!(subject_for("orders.events", Some("a.b c")), "orders.events.a_b_c");
        assert_eq!(subject_for("orders.events", None), "orders.events._");
        assert_eq!(subject_for("orders.events", Some("")), "orders.events._");
    }

    #[test]
    fn subject_filter_covers_all_suffixes() {
        let options = NatsOptions::new("nats://127.0.0.1:4222", "ORDERS", "orders.events");
        assert_eq!(options.subject_filter(), "orders.events.>");
    }

    #[test]
    fn wire_envelope_round_trips() {
        let mut headers = Headers::new();
        headers.insert("x-tenant".into(), HeaderValue::Text("acme".into()));
        let envelope =
            WireEnvelope::new(json!({ "orderId": "123" }), Some("user-42".into()), headers);

        let bytes = serde_json::to_vec(&envelope).unwrap();
        let back: WireEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn wire_envelope_omits_empty_optionals() {
        let envelope = WireEnvelope::new(json!(1), None, Headers::new());
        let value = serde_json::to_value(&envelope).unwrap();
        assert!(value.get("key").is_none());
        assert!(value.get("headers").is_none());
    }

    #[test]
    fn delivery_attempt_is_one_based() {
        assert_eq!(attempt_from_delivered(1), 1);
        assert_eq!(attempt_from_delivered(4), 4);
        assert_eq!(attempt_from_delivered(0), 1);
        assert_eq!(attempt_from_delivered(-3), 1);
    }

    #[test]
    fn options_validation() {
        assert_eq!(
            NatsOptions::new("", "S", "s").validate(),
            Err(NatsConfigError::EmptyUrl)
        );
        assert_eq!(
            NatsOptions::new("nats://x", "", "s").validate(),
            Err(NatsConfigError::EmptyStream)
        );
        assert!(matches!(
            NatsOptions::new("nats://x", "S", "orders.>").validate(),
            Err(NatsConfigError::InvalidSubject(_))
        ));
        assert!(NatsOptions::new("nats://x", "S", "orders.events").validate().is_ok());
    }
}
