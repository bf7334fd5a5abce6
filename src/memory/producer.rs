//! Producer driver for the in-memory backend.

use super::queue::{MemoryQueue, MemoryQueueOptions};
use super::registry;
use crate::config::BusConfig;
use crate::contract::{HealthStatus, OutgoingMessage, Producer, PublishOptions};
use crate::error::{BusError, BusResult};
use crate::message::BackendKind;
use crate::resilience::ResilienceExecutor;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Publishes to a named in-memory queue.
///
/// Payloads are stored structurally; no codec runs on this backend.
#[derive(Debug)]
pub struct MemoryProducer {
    queue_name: String,
    queue_options: MemoryQueueOptions,
    resilience: ResilienceExecutor,
    queue: Mutex<Option<Arc<MemoryQueue>>>,
    connected: AtomicBool,
}

impl MemoryProducer {
    pub fn new(queue_name: impl Into<String>, config: BusConfig) -> BusResult<Self> {
        Self::with_queue_options(queue_name, config, MemoryQueueOptions::default())
    }

    /// Construct with explicit queue limits, applied if this producer is the
    /// one that first creates the shared queue.
    pub fn with_queue_options(
        queue_name: impl Into<String>,
        config: BusConfig,
        queue_options: MemoryQueueOptions,
    ) -> BusResult<Self> {
        config.validate()?;
        Ok(Self {
            queue_name: queue_name.into(),
            queue_options,
            resilience: ResilienceExecutor::from_config(&config),
            queue: Mutex::new(None),
            connected: AtomicBool::new(false),
        })
    }

    fn queue(&self) -> BusResult<Arc<MemoryQueue>> {
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| BusError::connection("producer is not connected"))
    }
}

#[async_trait]
impl Producer for MemoryProducer {
    fn backend(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn connect(&self) -> BusResult<()> {
        let mut slot = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(registry::shared_queue(&self.queue_name, self.queue_options));
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> BusResult<()> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn publish(&self, body: Value, options: PublishOptions) -> BusResult<String> {
        if !self.is_connected() {
            return Err(BusError::connection("producer is not connected"));
        }
        let queue = self.queue()?;
        let key = options.key.clone();
        let headers = options.headers.clone();
        self.resilience
            .execute(|| {
                let queue = queue.clone();
                let key = key.clone();
                let headers = headers.clone();
                let body = body.clone();
                async move { Ok(queue.enqueue(body, key, headers)) }
            })
            .await
    }

    async fn publish_batch(&self, messages: Vec<OutgoingMessage>) -> BusResult<Vec<String>> {
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            ids.push(self.publish(message.body, message.options).await?);
        }
        Ok(ids)
    }

    async fn health_check(&self) -> HealthStatus {
        if !self.is_connected() {
            return HealthStatus::unhealthy(false, "producer is not connected");
        }
        match self.queue() {
            Ok(queue) => {
                let started = Instant::now();
                let size = queue.size();
                let processing = queue.processing_count();
                HealthStatus::healthy(started.elapsed().as_millis() as u64).with_details(
                    serde_json::json!({
                        "queue": self.queue_name,
                        "size": size,
                        "processing_count": processing,
                    }),
                )
            }
            Err(e) => HealthStatus::unhealthy(false, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn producer(name: &str) -> MemoryProducer {
        MemoryProducer::new(name, BusConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn publish_requires_connect() {
        let p = producer("producer-connect-test");
        let err = p.publish(json!("x"), PublishOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), "CONNECTION_ERROR");
    }

    #[tokio::test]
    async fn publish_returns_unique_ids_in_order() {
        let p = producer("producer-publish-test");
        p.connect().await.unwrap();

        let ids = p
            .publish_batch(vec![
                OutgoingMessage::new(json!({ "n": 1 })),
                OutgoingMessage::new(json!({ "n": 2 })),
            ])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);

        let queue = registry::shared_queue("producer-publish-test", Default::default());
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.dequeue().unwrap().body["n"], 1);
        queue.clear();
    }

    #[tokio::test]
    async fn connect_and_disconnect_are_idempotent() {
        let p = producer("producer-idempotent-test");
        p.connect().await.unwrap();
        p.connect().await.unwrap();
        assert!(p.is_connected());
        p.disconnect().await.unwrap();
        p.disconnect().await.unwrap();
        assert!(!p.is_connected());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_at_construction() {
        let mut config = BusConfig::default();
        config.retry.multiplier = -1.0;
        let err = MemoryProducer::new("producer-bad-config", config).unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
    }

    #[tokio::test]
    async fn health_check_reports_queue_details() {
        let p = producer("producer-health-test");
        p.connect().await.unwrap();
        p.publish(json!("x"), PublishOptions::default()).await.unwrap();

        let health = p.health_check().await;
        assert!(health.healthy);
        assert!(health.connected);
        let details = health.details.unwrap();
        assert_eq!(details["queue"], "producer-health-test");
        assert_eq!(details["size"], 1);

        registry::shared_queue("producer-health-test", Default::default()).clear();
    }
}
