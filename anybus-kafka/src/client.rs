//! rdkafka-backed implementations of the universal contracts.
//!
//! Only compiled with the `client` feature. Failure bookkeeping is seek-based:
//! Kafka has no native nack, so a failed handler seeks the partition back to
//! the message offset and the record redelivers. Dead-letter routing stays
//! app-level (publish to your DLQ topic from the handler) since the broker has
//! no attempt counter to gate on.

use crate::mapping::{self, KafkaOptions};
use anybus::{
    AckHandle, BackendKind, BusConfig, BusError, BusResult, Consumer, ConsumerEvent, HeaderValue,
    Headers, HealthStatus, JsonCodec, Message, MessageHandler, OutgoingMessage, Producer,
    ProviderMetadata, PublishOptions, ResilienceExecutor, Serializer, SubscribeOptions,
};
use async_trait::async_trait;
use chrono::TimeZone;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer as _, StreamConsumer};
use rdkafka::message::{Header, Headers as _, Message as _, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer as _};
use rdkafka::{Offset, TopicPartitionList};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);
const PAUSE_TICK: Duration = Duration::from_millis(100);

/// Kafka producer over `rdkafka::FutureProducer`.
pub struct KafkaProducer {
    options: KafkaOptions,
    resilience: ResilienceExecutor,
    codec: JsonCodec,
    producer: Mutex<Option<FutureProducer>>,
    connected: AtomicBool,
}

impl KafkaProducer {
    pub fn new(options: KafkaOptions, config: BusConfig) -> BusResult<Self> {
        config.validate()?;
        options
            .validate()
            .map_err(|e| BusError::configuration(e.to_string()))?;
        Ok(Self {
            options,
            resilience: ResilienceExecutor::from_config(&config),
            codec: JsonCodec::default(),
            producer: Mutex::new(None),
            connected: AtomicBool::new(false),
        })
    }

    fn producer(&self) -> BusResult<FutureProducer> {
        self.producer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| BusError::connection("kafka producer is not connected"))
    }

    async fn send_once(
        &self,
        producer: &FutureProducer,
        payload: &[u8],
        options: &PublishOptions,
    ) -> BusResult<String> {
        let mut headers = OwnedHeaders::new();
        for (name, value) in mapping::record_headers(options) {
            headers = headers.insert(Header { key: &name, value: Some(&value) });
        }

        let mut record =
            FutureRecord::<str, [u8]>::to(&self.options.topic).payload(payload).headers(headers);
        if let Some(key) = mapping::record_key(options) {
            record = record.key(key);
        }
        if let Some(partition) = options.partition {
            record = record.partition(partition);
        }

        match producer.send(record, SEND_TIMEOUT).await {
            Ok((partition, offset)) => {
                Ok(mapping::synthesize_message_id(&self.options.topic, partition, offset))
            }
            Err((e, _)) => Err(BusError::publish("kafka rejected the record").with_cause(e)),
        }
    }
}

#[async_trait]
impl Producer for KafkaProducer {
    fn backend(&self) -> BackendKind {
        BackendKind::Kafka
    }

    async fn connect(&self) -> BusResult<()> {
        let mut slot = self.producer.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            let mut config = ClientConfig::new();
            config
                .set("bootstrap.servers", self.options.bootstrap_servers())
                .set("message.timeout.ms", SEND_TIMEOUT.as_millis().to_string());
            if self.options.idempotence {
                config.set("enable.idempotence", "true");
            }
            let producer: FutureProducer = config
                .create()
                .map_err(|e| BusError::connection("failed to create kafka producer").with_cause(e))?;
            *slot = Some(producer);
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> BusResult<()> {
        if let Some(producer) = self.producer.lock().unwrap_or_else(|p| p.into_inner()).take() {
            let _ = producer.flush(METADATA_TIMEOUT);
        }
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn publish(&self, body: Value, options: PublishOptions) -> BusResult<String> {
        let producer = self.producer()?;
        let payload = self.codec.serialize(&body)?;
        self.resilience
            .execute(|| self.send_once(&producer, &payload, &options))
            .await
    }

    async fn publish_batch(&self, messages: Vec<OutgoingMessage>) -> BusResult<Vec<String>> {
        let producer = self.producer()?;
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            let payload = self.codec.serialize(&message.body)?;
            match self.send_once(&producer, &payload, &message.options).await {
                Ok(id) => ids.push(id),
                Err(e) => {
                    // Per-entry results: log failures, keep successes in order.
                    tracing::warn!(error = %e, "kafka batch entry failed");
                }
            }
        }
        Ok(ids)
    }

    async fn flush(&self) -> BusResult<()> {
        let producer = self.producer()?;
        producer
            .flush(SEND_TIMEOUT)
            .map_err(|e| BusError::publish("kafka flush failed").with_cause(e))
    }

    async fn health_check(&self) -> HealthStatus {
        let producer = match self.producer() {
            Ok(p) => p,
            Err(e) => return HealthStatus::unhealthy(false, e.to_string()),
        };
        let started = Instant::now();
        match producer.client().fetch_metadata(Some(&self.options.topic), METADATA_TIMEOUT) {
            Ok(_) => HealthStatus::healthy(started.elapsed().as_millis() as u64)
                .with_details(serde_json::json!({ "topic": self.options.topic })),
            Err(e) => HealthStatus::unhealthy(self.is_connected(), e.to_string()),
        }
    }
}

/// Settlement over consumer coordinates: commit to ack, seek back to requeue.
struct KafkaAckHandle {
    consumer: Arc<StreamConsumer>,
    topic: String,
    partition: i32,
    offset: i64,
}

#[async_trait]
impl AckHandle for KafkaAckHandle {
    async fn ack(&self) -> BusResult<()> {
        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(&self.topic, self.partition, Offset::Offset(self.offset + 1))
            .map_err(|e| BusError::consume("invalid commit offset").with_cause(e))?;
        self.consumer
            .commit(&assignment, CommitMode::Async)
            .map_err(|e| BusError::consume("kafka offset commit failed").with_cause(e))
    }

    async fn nack(&self, requeue: bool) -> BusResult<()> {
        if requeue {
            self.consumer
                .seek(&self.topic, self.partition, Offset::Offset(self.offset), METADATA_TIMEOUT)
                .map_err(|e| BusError::consume("kafka seek failed").with_cause(e))
        } else {
            // No broker-side reject; advancing the offset drops the record.
            tracing::warn!(
                topic = %self.topic,
                partition = self.partition,
                offset = self.offset,
                "nack without requeue on kafka advances past the record"
            );
            self.ack().await
        }
    }

    async fn extend_deadline(&self, _seconds: u32) -> BusResult<()> {
        Err(BusError::not_implemented("extend_deadline", "kafka"))
    }
}

/// Kafka consumer over `rdkafka::StreamConsumer`.
pub struct KafkaConsumer {
    options: KafkaOptions,
    codec: JsonCodec,
    consumer: Mutex<Option<Arc<StreamConsumer>>>,
    connected: AtomicBool,
    paused: Arc<AtomicBool>,
    subscription: Mutex<Option<CancellationToken>>,
    events: broadcast::Sender<ConsumerEvent>,
}

impl KafkaConsumer {
    pub fn new(options: KafkaOptions, config: BusConfig) -> BusResult<Self> {
        config.validate()?;
        options
            .validate()
            .map_err(|e| BusError::configuration(e.to_string()))?;
        if options.group_id.is_none() {
            return Err(BusError::configuration("kafka consumers require a group_id"));
        }
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            options,
            codec: JsonCodec::default(),
            consumer: Mutex::new(None),
            connected: AtomicBool::new(false),
            paused: Arc::new(AtomicBool::new(false)),
            subscription: Mutex::new(None),
            events,
        })
    }

    fn build_consumer(&self, options: &SubscribeOptions) -> BusResult<Arc<StreamConsumer>> {
        let group = self.options.group_id.as_deref().unwrap_or_default();
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", self.options.bootstrap_servers())
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", if options.from_beginning { "earliest" } else { "latest" })
            .create()
            .map_err(|e| BusError::connection("failed to create kafka consumer").with_cause(e))?;
        consumer
            .subscribe(&[self.options.topic.as_str()])
            .map_err(|e| BusError::connection("kafka subscribe failed").with_cause(e))?;
        Ok(Arc::new(consumer))
    }

}

#[async_trait]
impl Consumer for KafkaConsumer {
    fn backend(&self) -> BackendKind {
        BackendKind::Kafka
    }

    async fn connect(&self) -> BusResult<()> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> BusResult<()> {
        if let Some(cancel) = self.subscription.lock().unwrap_or_else(|p| p.into_inner()).take() {
            cancel.cancel();
        }
        self.consumer.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn subscribe(&self, handler: MessageHandler, options: SubscribeOptions) -> BusResult<()> {
        if !self.is_connected() {
            return Err(BusError::connection("kafka consumer is not connected"));
        }
        let consumer = self.build_consumer(&options)?;
        {
            let mut slot = self.subscription.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_some() {
                return Err(BusError::configuration(
                    "kafka consumer already has an active subscription",
                ));
            }
            let cancel = CancellationToken::new();
            *slot = Some(cancel.clone());

            *self.consumer.lock().unwrap_or_else(|p| p.into_inner()) = Some(consumer.clone());

            tokio::spawn(run_loop(
                consumer,
                self.codec,
                self.options.topic.clone(),
                handler,
                self.paused.clone(),
                self.events.clone(),
                cancel,
            ));
        }
        Ok(())
    }

    async fn subscribe_batch(
        &self,
        _handler: anybus::BatchHandler,
        _options: SubscribeOptions,
    ) -> BusResult<()> {
        Err(BusError::not_implemented("subscribe_batch", "kafka"))
    }

    async fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    async fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn events(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.events.subscribe()
    }

    async fn health_check(&self) -> HealthStatus {
        let connected = self.is_connected();
        if !connected {
            return HealthStatus::unhealthy(false, "kafka consumer is not connected");
        }
        HealthStatus {
            healthy: true,
            connected,
            latency_ms: None,
            details: Some(serde_json::json!({
                "topic": self.options.topic,
                "paused": self.is_paused(),
            })),
            error: None,
        }
    }
}

async fn run_loop(
    consumer: Arc<StreamConsumer>,
    codec: JsonCodec,
    topic: String,
    handler: MessageHandler,
    paused: Arc<AtomicBool>,
    events: broadcast::Sender<ConsumerEvent>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        if paused.load(Ordering::Acquire) {
            tokio::time::sleep(PAUSE_TICK).await;
            continue;
        }

        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = consumer.recv() => received,
        };

        let owned = match received {
            Ok(borrowed) => borrowed.detach(),
            Err(e) => {
                let error = Arc::new(BusError::consume("kafka fetch failed").with_cause(e));
                tracing::warn!(error = %error, "kafka fetch error, backing off");
                let _ = events.send(ConsumerEvent::Error { message_id: None, error });
                tokio::time::sleep(FETCH_ERROR_BACKOFF).await;
                continue;
            }
        };

        // A pause that raced the fetch releases the record via seek.
        if paused.load(Ordering::Acquire) || cancel.is_cancelled() {
            let _ = consumer.seek(
                owned.topic(),
                owned.partition(),
                Offset::Offset(owned.offset()),
                METADATA_TIMEOUT,
            );
            if cancel.is_cancelled() {
                break;
            }
            continue;
        }

        let message = match build_envelope(&codec, &owned, &consumer) {
            Ok(message) => message,
            Err(e) => {
                let error = Arc::new(e);
                let _ = events.send(ConsumerEvent::Error { message_id: None, error });
                // Poison payload: skip past it rather than loop forever.
                let mut assignment = TopicPartitionList::new();
                if assignment
                    .add_partition_offset(
                        owned.topic(),
                        owned.partition(),
                        Offset::Offset(owned.offset() + 1),
                    )
                    .is_ok()
                {
                    let _ = consumer.commit(&assignment, CommitMode::Async);
                }
                continue;
            }
        };

        let _ = events.send(ConsumerEvent::Message { message_id: message.id().to_string() });
        match handler(message.clone()).await {
            Ok(()) => {
                if !message.is_settled() {
                    if let Err(e) = message.ack().await {
                        tracing::warn!(error = %e, "kafka auto-ack failed");
                    }
                }
            }
            Err(e) => {
                let error = Arc::new(e);
                let _ = events.send(ConsumerEvent::Error {
                    message_id: Some(message.id().to_string()),
                    error,
                });
                if !message.is_settled() {
                    let _ = message.nack(true).await;
                    // Seek-based redelivery: brief backoff avoids a hot loop
                    // on a permanently failing record.
                    tokio::time::sleep(FETCH_ERROR_BACKOFF).await;
                }
            }
        }
    }
    tracing::debug!(topic = %topic, "kafka delivery loop stopped");
}

fn build_envelope(
    codec: &JsonCodec,
    owned: &OwnedMessage,
    consumer: &Arc<StreamConsumer>,
) -> BusResult<Arc<Message>> {
    let body = match owned.payload() {
        Some(bytes) => codec.deserialize(bytes)?,
        None => Value::Null,
    };
    let mut headers = Headers::new();
    if let Some(borrowed) = owned.headers() {
        for header in borrowed.iter() {
            let value = header.value.unwrap_or_default();
            let value = match std::str::from_utf8(value) {
                Ok(text) => HeaderValue::Text(text.to_string()),
                Err(_) => HeaderValue::Bytes(value.to_vec()),
            };
            headers.insert(header.key.to_string(), value);
        }
    }
    let key = owned.key().and_then(|k| std::str::from_utf8(k).ok()).map(str::to_string);
    let timestamp = owned
        .timestamp()
        .to_millis()
        .and_then(|ms| chrono::Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(chrono::Utc::now);

    let handle = Arc::new(KafkaAckHandle {
        consumer: consumer.clone(),
        topic: owned.topic().to_string(),
        partition: owned.partition(),
        offset: owned.offset(),
    });
    let id = mapping::synthesize_message_id(owned.topic(), owned.partition(), owned.offset());
    Ok(Arc::new(
        Message::builder(
            id,
            body,
            ProviderMetadata::Kafka {
                topic: owned.topic().to_string(),
                partition: owned.partition(),
                offset: owned.offset(),
            },
            handle,
        )
        .maybe_key(key)
        .headers(headers)
        .timestamp(timestamp)
        .delivery_attempt(mapping::delivery_attempt())
        .build(),
    ))
}
