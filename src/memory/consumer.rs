//! Consumer driver for the in-memory backend: a short-tick pull loop with
//! pause/resume, auto-ack policy, failure bookkeeping, and DLQ routing.

use super::queue::{MemoryQueue, MemoryQueueOptions, StoredMessage};
use super::registry;
use crate::config::{BusConfig, DeadLetterConfig};
use crate::contract::{
    BatchHandler, Consumer, ConsumerEvent, HealthStatus, MessageHandler, SubscribeOptions,
};
use crate::error::{BusError, BusResult};
use crate::message::{AckHandle, BackendKind, Message, ProviderMetadata};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;

/// Poll interval of the pull loop.
const TICK: Duration = Duration::from_millis(10);

/// Settlement handle bound to one in-memory delivery.
struct MemoryAckHandle {
    queue: Arc<MemoryQueue>,
    dlq: Option<Arc<MemoryQueue>>,
    message_id: String,
    delivery_attempt: u32,
    max_delivery_attempts: u32,
}

#[async_trait]
impl AckHandle for MemoryAckHandle {
    async fn ack(&self) -> BusResult<()> {
        self.queue.ack(&self.message_id);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> BusResult<()> {
        if requeue {
            // An explicit requeue is still bounded by the delivery budget:
            // once this delivery meets it, the message dead-letters instead
            // of looping forever.
            if let Some(dlq) = &self.dlq {
                if self.delivery_attempt >= self.max_delivery_attempts {
                    self.queue.dead_letter(&self.message_id, dlq, None);
                    return Ok(());
                }
            }
            self.queue.nack(&self.message_id, true);
        } else if let Some(dlq) = &self.dlq {
            // Reject-without-requeue routes to the DLQ rather than silently
            // deleting.
            self.queue.dead_letter(&self.message_id, dlq, Some("rejected without requeue"));
        } else {
            tracing::warn!(
                queue = %self.queue.name(),
                message_id = %self.message_id,
                "rejected without requeue and no DLQ configured, dropping"
            );
            self.queue.nack(&self.message_id, false);
        }
        Ok(())
    }

    async fn extend_deadline(&self, _seconds: u32) -> BusResult<()> {
        // In-flight entries never expire here, so the extension is already
        // satisfied.
        Ok(())
    }
}

/// State shared between the consumer surface and its spawned loop.
struct Shared {
    queue_name: String,
    paused: AtomicBool,
    events: broadcast::Sender<ConsumerEvent>,
    dead_letter: DeadLetterConfig,
    auto_ack: AtomicBool,
}

/// Pull-based consumer over a named in-memory queue.
pub struct MemoryConsumer {
    queue_options: MemoryQueueOptions,
    queue: Mutex<Option<Arc<MemoryQueue>>>,
    connected: AtomicBool,
    subscription: Mutex<Option<CancellationToken>>,
    shared: Arc<Shared>,
}

impl MemoryConsumer {
    pub fn new(queue_name: impl Into<String>, config: BusConfig) -> BusResult<Self> {
        Self::with_queue_options(queue_name, config, MemoryQueueOptions::default())
    }

    pub fn with_queue_options(
        queue_name: impl Into<String>,
        config: BusConfig,
        queue_options: MemoryQueueOptions,
    ) -> BusResult<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            shared: Arc::new(Shared {
                queue_name: queue_name.into(),
                paused: AtomicBool::new(false),
                events,
                dead_letter: config.dead_letter,
                auto_ack: AtomicBool::new(true),
            }),
            queue_options,
            queue: Mutex::new(None),
            connected: AtomicBool::new(false),
            subscription: Mutex::new(None),
        })
    }

    fn queue(&self) -> BusResult<Arc<MemoryQueue>> {
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| BusError::connection("consumer is not connected"))
    }

    fn start_subscription(&self) -> BusResult<(Arc<MemoryQueue>, CancellationToken)> {
        if !self.is_connected() {
            return Err(BusError::connection("consumer is not connected"));
        }
        let queue = self.queue()?;
        let mut slot = self.subscription.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return Err(BusError::configuration("consumer already has an active subscription"));
        }
        let cancel = CancellationToken::new();
        *slot = Some(cancel.clone());
        Ok((queue, cancel))
    }

    fn dead_letter_queue(&self) -> Option<Arc<MemoryQueue>> {
        let dlq = &self.shared.dead_letter;
        if !dlq.enabled {
            return None;
        }
        dlq.destination
            .as_deref()
            .map(|name| registry::shared_queue(name, MemoryQueueOptions::default()))
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    fn backend(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn connect(&self) -> BusResult<()> {
        let mut slot = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(registry::shared_queue(&self.shared.queue_name, self.queue_options));
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) -> BusResult<()> {
        if let Some(cancel) = self.subscription.lock().unwrap_or_else(|p| p.into_inner()).take() {
            cancel.cancel();
        }
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn subscribe(&self, handler: MessageHandler, options: SubscribeOptions) -> BusResult<()> {
        let (queue, cancel) = self.start_subscription()?;
        self.shared.auto_ack.store(options.auto_ack, Ordering::Release);
        let dlq = self.dead_letter_queue();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            run_single_loop(shared, queue, dlq, handler, options, cancel).await;
        });
        Ok(())
    }

    async fn subscribe_batch(
        &self,
        handler: BatchHandler,
        options: SubscribeOptions,
    ) -> BusResult<()> {
        let (queue, cancel) = self.start_subscription()?;
        self.shared.auto_ack.store(options.auto_ack, Ordering::Release);
        let dlq = self.dead_letter_queue();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            run_batch_loop(shared, queue, dlq, handler, options, cancel).await;
        });
        Ok(())
    }

    async fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
        tracing::debug!(queue = %self.shared.queue_name, "consumer paused");
    }

    async fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
        tracing::debug!(queue = %self.shared.queue_name, "consumer resumed");
    }

    fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    async fn lag(&self) -> BusResult<u64> {
        Ok(self.queue()?.size() as u64)
    }

    fn events(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.shared.events.subscribe()
    }

    async fn health_check(&self) -> HealthStatus {
        if !self.is_connected() {
            return HealthStatus::unhealthy(false, "consumer is not connected");
        }
        match self.queue() {
            Ok(queue) => {
                let started = Instant::now();
                let size = queue.size();
                HealthStatus::healthy(started.elapsed().as_millis() as u64).with_details(
                    serde_json::json!({
                        "queue": self.shared.queue_name,
                        "size": size,
                        "processing_count": queue.processing_count(),
                        "paused": self.is_paused(),
                    }),
                )
            }
            Err(e) => HealthStatus::unhealthy(false, e.to_string()),
        }
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if let Some(cancel) = self.subscription.lock().unwrap_or_else(|p| p.into_inner()).take() {
            cancel.cancel();
        }
    }
}

fn build_message(
    shared: &Shared,
    stored: &StoredMessage,
    queue: &Arc<MemoryQueue>,
    dlq: &Option<Arc<MemoryQueue>>,
) -> Arc<Message> {
    let handle = Arc::new(MemoryAckHandle {
        queue: queue.clone(),
        dlq: dlq.clone(),
        message_id: stored.id.clone(),
        delivery_attempt: stored.delivery_attempt,
        max_delivery_attempts: shared.dead_letter.max_delivery_attempts,
    });
    Arc::new(
        Message::builder(
            stored.id.clone(),
            stored.body.clone(),
            ProviderMetadata::Memory { queue: queue.name().to_string() },
            handle,
        )
        .maybe_key(stored.key.clone())
        .headers(stored.headers.clone())
        .timestamp(stored.timestamp)
        .delivery_attempt(stored.delivery_attempt)
        .build(),
    )
}

/// Apply the failure policy for one unsettled delivery: dead-letter once the
/// attempt budget is met, requeue otherwise.
fn handle_failure(
    shared: &Shared,
    queue: &Arc<MemoryQueue>,
    dlq: &Option<Arc<MemoryQueue>>,
    stored: &StoredMessage,
    error: &BusError,
) {
    let policy = &shared.dead_letter;
    if policy.enabled && stored.delivery_attempt >= policy.max_delivery_attempts {
        if let Some(dlq) = dlq {
            let reason = policy.include_error.then(|| error.message());
            queue.dead_letter(&stored.id, dlq, reason);
            return;
        }
    }
    queue.nack(&stored.id, true);
}

async fn invoke_handler(
    shared: &Shared,
    message_id: Option<&str>,
    invocation: impl std::future::Future<Output = BusResult<()>>,
) -> Result<(), Arc<BusError>> {
    let error = match AssertUnwindSafe(invocation).catch_unwind().await {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => e,
        Err(panic) => BusError::from_panic(panic),
    };
    let error = Arc::new(error);
    let _ = shared.events.send(ConsumerEvent::Error {
        message_id: message_id.map(str::to_string),
        error: error.clone(),
    });
    tracing::error!(
        queue = %shared.queue_name,
        message_id = message_id.unwrap_or("<batch>"),
        error = %error,
        "handler failed"
    );
    Err(error)
}

async fn dispatch_one(
    shared: &Shared,
    queue: &Arc<MemoryQueue>,
    dlq: &Option<Arc<MemoryQueue>>,
    handler: &MessageHandler,
    stored: StoredMessage,
) {
    let message = build_message(shared, &stored, queue, dlq);
    let _ = shared.events.send(ConsumerEvent::Message { message_id: stored.id.clone() });

    match invoke_handler(shared, Some(message.id()), handler(message.clone())).await {
        Ok(()) => {
            if shared.auto_ack.load(Ordering::Acquire) && !message.is_settled() {
                let _ = message.ack().await;
            }
            // Without auto-ack an unsettled message stays in flight until the
            // handler (or someone holding the envelope) settles it.
        }
        Err(error) => {
            if !message.is_settled() {
                handle_failure(shared, queue, dlq, &stored, &error);
            }
        }
    }
}

async fn run_single_loop(
    shared: Arc<Shared>,
    queue: Arc<MemoryQueue>,
    dlq: Option<Arc<MemoryQueue>>,
    handler: MessageHandler,
    options: SubscribeOptions,
    cancel: CancellationToken,
) {
    let concurrency = options.concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    tracing::debug!(queue = %shared.queue_name, concurrency, "starting delivery loop");

    loop {
        if cancel.is_cancelled() {
            break;
        }
        if shared.paused.load(Ordering::Acquire) {
            tokio::time::sleep(TICK).await;
            continue;
        }

        let Some(stored) = queue.dequeue() else {
            tokio::time::sleep(TICK).await;
            continue;
        };

        // A pause or disconnect that raced the dequeue releases the message
        // instead of holding it in memory.
        if cancel.is_cancelled() || shared.paused.load(Ordering::Acquire) {
            queue.nack(&stored.id, true);
            if cancel.is_cancelled() {
                break;
            }
            continue;
        }

        if concurrency == 1 {
            dispatch_one(&shared, &queue, &dlq, &handler, stored).await;
        } else {
            if semaphore.available_permits() == 0 {
                let _ = shared.events.send(ConsumerEvent::Backpressure {
                    in_flight: concurrency,
                    limit: concurrency,
                });
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let shared = shared.clone();
            let queue = queue.clone();
            let dlq = dlq.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                dispatch_one(&shared, &queue, &dlq, &handler, stored).await;
                drop(permit);
            });
        }
    }
    tracing::debug!(queue = %shared.queue_name, "delivery loop stopped");
}

/// Requeue in reverse so the released messages keep their original order at
/// the head of the queue.
fn release_all(queue: &MemoryQueue, pending: &mut Vec<StoredMessage>) {
    for stored in pending.drain(..).rev() {
        queue.nack(&stored.id, true);
    }
}

async fn dispatch_batch(
    shared: &Shared,
    queue: &Arc<MemoryQueue>,
    dlq: &Option<Arc<MemoryQueue>>,
    handler: &BatchHandler,
    batch: Vec<StoredMessage>,
) {
    let messages: Vec<Arc<Message>> =
        batch.iter().map(|stored| build_message(shared, stored, queue, dlq)).collect();
    for message in &messages {
        let _ = shared.events.send(ConsumerEvent::Message { message_id: message.id().to_string() });
    }

    match invoke_handler(shared, None, handler(messages.clone())).await {
        Ok(()) => {
            if shared.auto_ack.load(Ordering::Acquire) {
                for message in &messages {
                    if !message.is_settled() {
                        let _ = message.ack().await;
                    }
                }
            }
        }
        Err(error) => {
            // A failed batch releases every message; individual acks are not
            // attempted. Iterate in reverse to keep head order on requeue.
            for (stored, message) in batch.iter().zip(&messages).rev() {
                if !message.is_settled() {
                    handle_failure(shared, queue, dlq, stored, &error);
                }
            }
        }
    }
}

async fn run_batch_loop(
    shared: Arc<Shared>,
    queue: Arc<MemoryQueue>,
    dlq: Option<Arc<MemoryQueue>>,
    handler: BatchHandler,
    options: SubscribeOptions,
    cancel: CancellationToken,
) {
    let batch_size = options.batch_size.max(1);
    let batch_timeout = Duration::from_millis(options.batch_timeout_ms.max(1));
    let mut pending: Vec<StoredMessage> = Vec::new();
    let mut first_at: Option<Instant> = None;
    tracing::debug!(queue = %shared.queue_name, batch_size, "starting batch delivery loop");

    loop {
        if cancel.is_cancelled() || shared.paused.load(Ordering::Acquire) {
            release_all(&queue, &mut pending);
            first_at = None;
            if cancel.is_cancelled() {
                break;
            }
            tokio::time::sleep(TICK).await;
            continue;
        }

        if pending.len() < batch_size {
            let fetched = queue.dequeue_batch(batch_size - pending.len());
            if !fetched.is_empty() && first_at.is_none() {
                first_at = Some(Instant::now());
            }
            pending.extend(fetched);
        }

        let timed_out = first_at.is_some_and(|t| t.elapsed() >= batch_timeout);
        if pending.len() >= batch_size || (timed_out && !pending.is_empty()) {
            let batch = std::mem::take(&mut pending);
            first_at = None;
            dispatch_batch(&shared, &queue, &dlq, &handler, batch).await;
        } else {
            tokio::time::sleep(TICK).await;
        }
    }
    tracing::debug!(queue = %shared.queue_name, "batch delivery loop stopped");
}
