//! async-nats JetStream implementations of the universal contracts.
//!
//! Only compiled with the `client` feature. Settlement maps onto JetStream
//! ack kinds (ACK / NAK / TERM / progress); redelivery budgets are enforced
//! server-side through the consumer's max-deliver setting.

use crate::mapping::{self, NatsOptions, WireEnvelope};
use anybus::{
    AckHandle, BackendKind, BusConfig, BusError, BusResult, Consumer, ConsumerEvent, HealthStatus,
    Message, MessageHandler, OutgoingMessage, Producer, ProviderMetadata, PublishOptions,
    ResilienceExecutor, SubscribeOptions,
};
use async_nats::jetstream;
use async_nats::jetstream::consumer::{pull, DeliverPolicy, PullConsumer};
use async_nats::jetstream::AckKind;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const PAUSE_TICK: Duration = Duration::from_millis(100);
const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);

struct NatsConnection {
    client: async_nats::Client,
    context: jetstream::Context,
    stream: jetstream::stream::Stream,
}

async fn establish(
    options: &NatsOptions,
    connection_timeout: Option<Duration>,
) -> BusResult<NatsConnection> {
    let connecting = async_nats::connect(options.url.as_str());
    let client = match connection_timeout {
        Some(limit) => tokio::time::timeout(limit, connecting).await.map_err(|_| {
            BusError::timeout(format!(
                "nats connection not established within {}ms",
                limit.as_millis()
            ))
        })?,
        None => connecting.await,
    }
    .map_err(|e| BusError::connection("failed to connect to nats server").with_cause(e))?;
    let context = jetstream::new(client.clone());
    // Stream autocreate: idempotent on an existing stream with the same
    // configuration.
    let stream = context
        .get_or_create_stream(jetstream::stream::Config {
            name: options.stream.clone(),
            subjects: vec![options.subject_filter()],
            ..Default::default()
        })
        .await
        .map_err(|e| BusError::connection("failed to create jetstream stream").with_cause(e))?;
    Ok(NatsConnection { client, context, stream })
}

/// JetStream producer publishing JSON wire envelopes.
pub struct NatsProducer {
    options: NatsOptions,
    resilience: ResilienceExecutor,
    connection_timeout: Option<Duration>,
    connection: Mutex<Option<Arc<NatsConnection>>>,
    connected: AtomicBool,
}

impl NatsProducer {
    pub fn new(options: NatsOptions, config: BusConfig) -> BusResult<Self> {
        config.validate()?;
        options
            .validate()
            .map_err(|e| BusError::configuration(e.to_string()))?;
        Ok(Self {
            options,
            resilience: ResilienceExecutor::from_config(&config),
            connection_timeout: config.connection_timeout(),
            connection: Mutex::new(None),
            connected: AtomicBool::new(false),
        })
    }

    fn connection(&self) -> BusResult<Arc<NatsConnection>> {
        self.connection
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| BusError::connection("nats producer is not connected"))
    }

    async fn publish_once(
        &self,
        connection: &NatsConnection,
        subject: &str,
        payload: &[u8],
    ) -> BusResult<String> {
        let ack = connection
            .context
            .publish(subject.to_string(), payload.to_vec().into())
            .await
            .map_err(|e| BusError::publish("jetstream publish failed").with_cause(e))?
            .await
            .map_err(|e| BusError::publish("jetstream publish was not acknowledged").with_cause(e))?;
        Ok(format!("{}-{}", ack.stream, ack.sequence))
    }
}

#[async_trait]
impl Producer for NatsProducer {
    fn backend(&self) -> BackendKind {
        BackendKind::NatsJetstream
    }

    async fn connect(&self) -> BusResult<()> {
        if self.connection.lock().unwrap_or_else(|p| p.into_inner()).is_none() {
            let connection = establish(&self.options, self.connection_timeout).await?;
            *self.connection.lock().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(connection));
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> BusResult<()> {
        let taken = self.connection.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(connection) = taken {
            let _ = connection.client.flush().await;
        }
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn publish(&self, body: Value, options: PublishOptions) -> BusResult<String> {
        let connection = self.connection()?;
        let key = options.key.clone().or(options.ordering_key.clone());
        let subject = mapping::subject_for(&self.options.subject, key.as_deref());
        let envelope = WireEnvelope::new(body, key, options.headers.clone());
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| BusError::serialization("failed to encode wire envelope").with_cause(e))?;

        self.resilience
            .execute(|| self.publish_once(&connection, &subject, &payload))
            .await
    }

    async fn publish_batch(&self, messages: Vec<OutgoingMessage>) -> BusResult<Vec<String>> {
        let mut ids = Vec::with_capacity(messages.len());
        let total = messages.len();
        for (index, message) in messages.into_iter().enumerate() {
            match self.publish(message.body, message.options).await {
                Ok(id) => ids.push(id),
                Err(e) => {
                    return Err(BusError::publish(format!(
                        "batch publish failed at entry {index} of {total}"
                    ))
                    .with_cause(e))
                }
            }
        }
        Ok(ids)
    }

    async fn flush(&self) -> BusResult<()> {
        let connection = self.connection()?;
        connection
            .client
            .flush()
            .await
            .map_err(|e| BusError::publish("nats flush failed").with_cause(e))
    }

    async fn health_check(&self) -> HealthStatus {
        let connection = match self.connection() {
            Ok(c) => c,
            Err(e) => return HealthStatus::unhealthy(false, e.to_string()),
        };
        let started = Instant::now();
        match connection.client.flush().await {
            Ok(()) => HealthStatus::healthy(started.elapsed().as_millis() as u64).with_details(
                serde_json::json!({
                    "stream": self.options.stream,
                    "subject": self.options.subject,
                }),
            ),
            Err(e) => HealthStatus::unhealthy(self.is_connected(), e.to_string()),
        }
    }
}

/// Settlement over one JetStream delivery.
struct NatsAckHandle {
    message: jetstream::Message,
}

#[async_trait]
impl AckHandle for NatsAckHandle {
    async fn ack(&self) -> BusResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::consume("jetstream ack failed").with_cause(e))
    }

    async fn nack(&self, requeue: bool) -> BusResult<()> {
        let kind = if requeue { AckKind::Nak(None) } else { AckKind::Term };
        self.message
            .ack_with(kind)
            .await
            .map_err(|e| BusError::consume("jetstream nak failed").with_cause(e))
    }

    async fn extend_deadline(&self, _seconds: u32) -> BusResult<()> {
        // Progress acks reset the ack-wait window; the extension length is
        // server-configured.
        self.message
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| BusError::consume("jetstream progress ack failed").with_cause(e))
    }
}

/// JetStream pull consumer.
pub struct NatsConsumer {
    options: NatsOptions,
    dead_letter_budget: Option<i64>,
    connection_timeout: Option<Duration>,
    connection: Mutex<Option<Arc<NatsConnection>>>,
    connected: AtomicBool,
    paused: Arc<AtomicBool>,
    subscription: Mutex<Option<CancellationToken>>,
    events: broadcast::Sender<ConsumerEvent>,
}

impl NatsConsumer {
    pub fn new(options: NatsOptions, config: BusConfig) -> BusResult<Self> {
        config.validate()?;
        options
            .validate()
            .map_err(|e| BusError::configuration(e.to_string()))?;
        // The core attempt budget becomes the server's max-deliver: once
        // exhausted the server stops redelivering (terminal), its DLQ
        // equivalent.
        let dead_letter_budget = config
            .dead_letter
            .enabled
            .then_some(config.dead_letter.max_delivery_attempts as i64)
            .or(options.max_deliver);
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            options,
            dead_letter_budget,
            connection_timeout: config.connection_timeout(),
            connection: Mutex::new(None),
            connected: AtomicBool::new(false),
            paused: Arc::new(AtomicBool::new(false)),
            subscription: Mutex::new(None),
            events,
        })
    }

    fn connection(&self) -> BusResult<Arc<NatsConnection>> {
        self.connection
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| BusError::connection("nats consumer is not connected"))
    }
}

#[async_trait]
impl Consumer for NatsConsumer {
    fn backend(&self) -> BackendKind {
        BackendKind::NatsJetstream
    }

    async fn connect(&self) -> BusResult<()> {
        if self.connection.lock().unwrap_or_else(|p| p.into_inner()).is_none() {
            let connection = establish(&self.options, self.connection_timeout).await?;
            *self.connection.lock().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(connection));
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> BusResult<()> {
        if let Some(cancel) = self.subscription.lock().unwrap_or_else(|p| p.into_inner()).take() {
            cancel.cancel();
        }
        self.connection.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn subscribe(&self, handler: MessageHandler, options: SubscribeOptions) -> BusResult<()> {
        let connection = self.connection()?;
        if self.subscription.lock().unwrap_or_else(|p| p.into_inner()).is_some() {
            return Err(BusError::configuration(
                "nats consumer already has an active subscription",
            ));
        }

        let durable = self
            .options
            .durable
            .clone()
            .unwrap_or_else(|| format!("{}-workers", mapping::sanitize_token(&self.options.stream)));
        let consumer = connection
            .stream
            .get_or_create_consumer(
                &durable,
                pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: self.options.subject_filter(),
                    max_deliver: self.dead_letter_budget.unwrap_or(-1),
                    deliver_policy: if options.from_beginning {
                        DeliverPolicy::All
                    } else {
                        DeliverPolicy::New
                    },
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                BusError::connection("failed to create jetstream consumer").with_cause(e)
            })?;

        let cancel = {
            let mut slot = self.subscription.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_some() {
                return Err(BusError::configuration(
                    "nats consumer already has an active subscription",
                ));
            }
            let cancel = CancellationToken::new();
            *slot = Some(cancel.clone());
            cancel
        };

        let stream_name = self.options.stream.clone();
        let paused = self.paused.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            run_loop(consumer, stream_name, handler, paused, events, cancel).await;
        });
        Ok(())
    }

    async fn subscribe_batch(
        &self,
        _handler: anybus::BatchHandler,
        _options: SubscribeOptions,
    ) -> BusResult<()> {
        Err(BusError::not_implemented("subscribe_batch", "nats-jetstream"))
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
        let connection = match self.connection() {
            Ok(c) => c,
            Err(e) => return HealthStatus::unhealthy(false, e.to_string()),
        };
        let started = Instant::now();
        match connection.client.flush().await {
            Ok(()) => HealthStatus::healthy(started.elapsed().as_millis() as u64).with_details(
                serde_json::json!({
                    "stream": self.options.stream,
                    "paused": self.is_paused(),
                }),
            ),
            Err(e) => HealthStatus::unhealthy(self.is_connected(), e.to_string()),
        }
    }
}

async fn run_loop(
    consumer: PullConsumer,
    stream_name: String,
    handler: MessageHandler,
    paused: Arc<AtomicBool>,
    events: broadcast::Sender<ConsumerEvent>,
    cancel: CancellationToken,
) {
    let mut messages = match consumer.messages().await {
        Ok(messages) => messages,
        Err(e) => {
            let error = Arc::new(BusError::consume("failed to open message stream").with_cause(e));
            let _ = events.send(ConsumerEvent::Crash { error });
            return;
        }
    };

    loop {
        if cancel.is_cancelled() {
            break;
        }
        if paused.load(Ordering::Acquire) {
            tokio::time::sleep(PAUSE_TICK).await;
            continue;
        }

        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = messages.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                let error = Arc::new(BusError::consume("jetstream fetch failed").with_cause(e));
                tracing::warn!(error = %error, "jetstream fetch error, backing off");
                let _ = events.send(ConsumerEvent::Error { message_id: None, error });
                tokio::time::sleep(FETCH_ERROR_BACKOFF).await;
                continue;
            }
            None => {
                let error = Arc::new(BusError::connection("jetstream message stream closed"));
                let _ = events.send(ConsumerEvent::Crash { error });
                break;
            }
        };

        // A pause or disconnect that raced the fetch releases the message.
        if paused.load(Ordering::Acquire) || cancel.is_cancelled() {
            let _ = message.ack_with(AckKind::Nak(None)).await;
            if cancel.is_cancelled() {
                break;
            }
            continue;
        }

        let envelope = match build_envelope(&stream_name, message) {
            Ok(envelope) => envelope,
            Err(e) => {
                let _ = events.send(ConsumerEvent::Error { message_id: None, error: Arc::new(e) });
                continue;
            }
        };

        let _ = events.send(ConsumerEvent::Message { message_id: envelope.id().to_string() });
        match handler(envelope.clone()).await {
            Ok(()) => {
                if !envelope.is_settled() {
                    if let Err(e) = envelope.ack().await {
                        tracing::warn!(error = %e, "jetstream auto-ack failed");
                    }
                }
            }
            Err(e) => {
                let error = Arc::new(e);
                let _ = events.send(ConsumerEvent::Error {
                    message_id: Some(envelope.id().to_string()),
                    error,
                });
                if !envelope.is_settled() {
                    let _ = envelope.nack(true).await;
                }
            }
        }
    }
    tracing::debug!(stream = %stream_name, "jetstream delivery loop stopped");
}

fn build_envelope(stream_name: &str, message: jetstream::Message) -> BusResult<Arc<Message>> {
    let info = message
        .info()
        .map_err(|e| BusError::consume("jetstream delivery info unavailable").with_cause(e))?;
    let stream_sequence = info.stream_sequence;
    let delivery_attempt = mapping::attempt_from_delivered(info.delivered);

    let wire: WireEnvelope = match serde_json::from_slice(&message.payload) {
        Ok(wire) => wire,
        // Foreign publisher: surface the raw payload without envelope fields.
        Err(_) => WireEnvelope::new(
            serde_json::from_slice(&message.payload).unwrap_or(Value::Null),
            None,
            Default::default(),
        ),
    };

    let handle = Arc::new(NatsAckHandle { message });
    Ok(Arc::new(
        Message::builder(
            format!("{stream_name}-{stream_sequence}"),
            wire.body,
            ProviderMetadata::NatsJetstream {
                stream: stream_name.to_string(),
                stream_sequence,
            },
            handle,
        )
        .maybe_key(wire.key)
        .headers(wire.headers)
        .timestamp(wire.published_at)
        .delivery_attempt(delivery_attempt)
        .build(),
    ))
}
