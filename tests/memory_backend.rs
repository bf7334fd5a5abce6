//! End-to-end scenarios against the in-memory reference backend.

use anybus::memory::{shared_queue, MemoryConsumer, MemoryProducer, MemoryQueueOptions};
use anybus::{
    batch_handler_fn, handler_fn, BusConfig, BusError, Consumer, ConsumerEvent, OutgoingMessage,
    Producer, PublishOptions, SubscribeOptions,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn unique(name: &str) -> String {
    format!("{name}-{}", uuid::Uuid::new_v4().simple())
}

async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

async fn connected_pair(queue: &str) -> (MemoryProducer, MemoryConsumer) {
    let producer = MemoryProducer::new(queue, BusConfig::default()).unwrap();
    producer.connect().await.unwrap();
    let consumer = MemoryConsumer::new(queue, BusConfig::default()).unwrap();
    consumer.connect().await.unwrap();
    (producer, consumer)
}

#[tokio::test]
async fn basic_round_trip_preserves_order() {
    let queue = unique("rt");
    let (producer, consumer) = connected_pair(&queue).await;

    producer.publish(json!({ "orderId": "123" }), PublishOptions::default()).await.unwrap();
    producer.publish(json!({ "orderId": "456" }), PublishOptions::default()).await.unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    consumer
        .subscribe(
            handler_fn(move |message| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(message.body().clone());
                    Ok(())
                }
            }),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    assert!(wait_until(|| received.lock().unwrap().len() == 2, Duration::from_secs(2)).await);
    assert_eq!(
        *received.lock().unwrap(),
        vec![json!({ "orderId": "123" }), json!({ "orderId": "456" })]
    );

    let backing = shared_queue(&queue, MemoryQueueOptions::default());
    assert!(
        wait_until(|| backing.processing_count() == 0, Duration::from_secs(1)).await,
        "both deliveries settled"
    );
    consumer.disconnect().await.unwrap();
}

#[tokio::test]
async fn nack_with_requeue_redelivers_at_head() {
    let queue = unique("nack");
    let (producer, consumer) = connected_pair(&queue).await;

    producer.publish(json!({ "orderId": "X" }), PublishOptions::default()).await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let attempts_seen = Arc::new(Mutex::new(Vec::new()));
    let calls_clone = calls.clone();
    let attempts_clone = attempts_seen.clone();
    consumer
        .subscribe(
            handler_fn(move |message| {
                let calls = calls_clone.clone();
                let attempts = attempts_clone.clone();
                async move {
                    let call = calls.fetch_add(1, Ordering::SeqCst);
                    attempts.lock().unwrap().push(message.delivery_attempt());
                    if call == 0 {
                        message.nack(true).await?;
                    } else {
                        message.ack().await?;
                    }
                    Ok(())
                }
            }),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    assert!(wait_until(|| calls.load(Ordering::SeqCst) >= 2, Duration::from_secs(2)).await);
    let backing = shared_queue(&queue, MemoryQueueOptions::default());
    assert!(wait_until(
        || backing.size() == 0 && backing.processing_count() == 0,
        Duration::from_secs(1)
    )
    .await);

    let attempts = attempts_seen.lock().unwrap();
    assert_eq!(attempts[0], 1);
    assert!(attempts[1] >= 2, "redelivery reports a higher attempt");
    consumer.disconnect().await.unwrap();
}

#[tokio::test]
async fn failing_handler_dead_letters_after_attempt_budget() {
    let queue = unique("dlq-src");
    let dlq_name = unique("q-dlq");

    let mut config = BusConfig::default();
    config.dead_letter.enabled = true;
    config.dead_letter.destination = Some(dlq_name.clone());
    config.dead_letter.max_delivery_attempts = 2;

    let producer = MemoryProducer::new(&queue, BusConfig::default()).unwrap();
    producer.connect().await.unwrap();
    let consumer = MemoryConsumer::new(&queue, config).unwrap();
    consumer.connect().await.unwrap();

    producer.publish(json!({ "orderId": "fail-me" }), PublishOptions::default()).await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();
    consumer
        .subscribe(
            handler_fn(move |_message| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(BusError::consume("order validation exploded"))
                }
            }),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    let dlq = shared_queue(&dlq_name, MemoryQueueOptions::default());
    assert!(wait_until(|| dlq.size() == 1, Duration::from_secs(2)).await);

    // Exactly the budget: never fewer, never more dispatches.
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let dead = dlq.dequeue().unwrap();
    assert_eq!(dead.body, json!({ "orderId": "fail-me" }));
    assert_eq!(dead.headers["x-original-queue"].as_text(), Some(queue.as_str()));
    assert_eq!(dead.headers["x-delivery-attempts"].as_text(), Some("2"));
    assert!(dead.headers["x-death-reason"]
        .as_text()
        .unwrap()
        .contains("order validation exploded"));

    let backing = shared_queue(&queue, MemoryQueueOptions::default());
    assert_eq!(backing.size(), 0);
    assert_eq!(backing.processing_count(), 0);
    consumer.disconnect().await.unwrap();
}

#[tokio::test]
async fn endless_nack_requeue_hits_the_dead_letter_budget() {
    let queue = unique("nack-loop");
    let dlq_name = unique("nack-loop-dlq");

    let mut config = BusConfig::default();
    config.dead_letter.enabled = true;
    config.dead_letter.destination = Some(dlq_name.clone());
    config.dead_letter.max_delivery_attempts = 3;

    let producer = MemoryProducer::new(&queue, BusConfig::default()).unwrap();
    producer.connect().await.unwrap();
    let consumer = MemoryConsumer::new(&queue, config).unwrap();
    consumer.connect().await.unwrap();

    producer.publish(json!({ "orderId": "stubborn" }), PublishOptions::default()).await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let calls_clone = calls.clone();
    consumer
        .subscribe(
            handler_fn(move |message| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    message.nack(true).await
                }
            }),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    // The third explicit requeue meets the budget and dead-letters instead
    // of looping forever.
    let dlq = shared_queue(&dlq_name, MemoryQueueOptions::default());
    assert!(wait_until(|| dlq.size() == 1, Duration::from_secs(2)).await);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let dead = dlq.dequeue().unwrap();
    assert_eq!(dead.body, json!({ "orderId": "stubborn" }));
    assert_eq!(dead.headers["x-delivery-attempts"].as_text(), Some("3"));
    assert_eq!(dead.headers["x-death-reason"].as_text(), Some("max retries exceeded"));

    let backing = shared_queue(&queue, MemoryQueueOptions::default());
    assert_eq!(backing.size(), 0);
    assert_eq!(backing.processing_count(), 0);
    consumer.disconnect().await.unwrap();
}

#[tokio::test]
async fn overflow_evicts_oldest() {
    let queue = unique("overflow");
    let producer = MemoryProducer::with_queue_options(
        &queue,
        BusConfig::default(),
        MemoryQueueOptions { max_messages: Some(3), max_age: None },
    )
    .unwrap();
    producer.connect().await.unwrap();

    let bodies: Vec<OutgoingMessage> =
        (0..5).map(|n| OutgoingMessage::new(json!({ "n": n }))).collect();
    producer.publish_batch(bodies).await.unwrap();

    let backing = shared_queue(&queue, MemoryQueueOptions::default());
    assert_eq!(backing.size(), 3);
    assert_eq!(backing.dequeue().unwrap().body["n"], 2);
}

#[tokio::test]
async fn pause_stops_dispatch_until_resume() {
    let queue = unique("pause");
    let (producer, consumer) = connected_pair(&queue).await;

    let received = Arc::new(AtomicU32::new(0));
    let sink = received.clone();
    consumer
        .subscribe(
            handler_fn(move |_message| {
                let sink = sink.clone();
                async move {
                    sink.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    consumer.pause().await;
    assert!(consumer.is_paused());

    for n in 0..3 {
        producer.publish(json!({ "n": n }), PublishOptions::default()).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(received.load(Ordering::SeqCst), 0, "paused consumer dispatches nothing");

    consumer.resume().await;
    assert!(!consumer.is_paused());
    assert!(wait_until(|| received.load(Ordering::SeqCst) == 3, Duration::from_secs(2)).await);
    consumer.disconnect().await.unwrap();
}

#[tokio::test]
async fn batch_subscribe_frames_by_size() {
    let queue = unique("batch");
    let (producer, consumer) = connected_pair(&queue).await;

    for n in 0..5 {
        producer.publish(json!({ "n": n }), PublishOptions::default()).await.unwrap();
    }

    let batches = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    consumer
        .subscribe_batch(
            batch_handler_fn(move |batch| {
                let sink = sink.clone();
                async move {
                    let ns: Vec<i64> =
                        batch.iter().map(|m| m.body()["n"].as_i64().unwrap()).collect();
                    for message in &batch {
                        message.ack().await?;
                    }
                    sink.lock().unwrap().push(ns);
                    Ok(())
                }
            }),
            SubscribeOptions { batch_size: 2, batch_timeout_ms: 50, ..Default::default() },
        )
        .await
        .unwrap();

    assert!(wait_until(
        || batches.lock().unwrap().iter().map(|b: &Vec<i64>| b.len()).sum::<usize>() == 5,
        Duration::from_secs(2)
    )
    .await);

    let batches = batches.lock().unwrap();
    assert!(batches.iter().all(|b| b.len() <= 2));
    let flattened: Vec<i64> = batches.iter().flatten().copied().collect();
    assert_eq!(flattened, vec![0, 1, 2, 3, 4], "order preserved across batches");
    consumer.disconnect().await.unwrap();
}

#[tokio::test]
async fn partial_batch_flushes_on_timeout() {
    let queue = unique("batch-timeout");
    let (producer, consumer) = connected_pair(&queue).await;

    producer.publish(json!({ "n": 0 }), PublishOptions::default()).await.unwrap();

    let batches = Arc::new(Mutex::new(Vec::new()));
    let sink = batches.clone();
    consumer
        .subscribe_batch(
            batch_handler_fn(move |batch| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(batch.len());
                    Ok(())
                }
            }),
            SubscribeOptions { batch_size: 10, batch_timeout_ms: 50, ..Default::default() },
        )
        .await
        .unwrap();

    assert!(wait_until(|| !batches.lock().unwrap().is_empty(), Duration::from_secs(2)).await);
    assert_eq!(*batches.lock().unwrap(), vec![1], "partial batch dispatched after timeout");
    consumer.disconnect().await.unwrap();
}

#[tokio::test]
async fn failed_batch_is_released_whole() {
    let queue = unique("batch-fail");
    let dlq_name = unique("batch-fail-dlq");

    let mut config = BusConfig::default();
    config.dead_letter.enabled = true;
    config.dead_letter.destination = Some(dlq_name.clone());
    config.dead_letter.max_delivery_attempts = 2;

    let producer = MemoryProducer::new(&queue, BusConfig::default()).unwrap();
    producer.connect().await.unwrap();
    let consumer = MemoryConsumer::new(&queue, config).unwrap();
    consumer.connect().await.unwrap();

    producer.publish(json!({ "n": 0 }), PublishOptions::default()).await.unwrap();
    producer.publish(json!({ "n": 1 }), PublishOptions::default()).await.unwrap();

    consumer
        .subscribe_batch(
            batch_handler_fn(move |_batch| async move {
                Err(BusError::consume("batch handler exploded"))
            }),
            SubscribeOptions { batch_size: 2, batch_timeout_ms: 20, ..Default::default() },
        )
        .await
        .unwrap();

    // Both messages exhaust their budget and land on the DLQ.
    let dlq = shared_queue(&dlq_name, MemoryQueueOptions::default());
    assert!(wait_until(|| dlq.size() == 2, Duration::from_secs(2)).await);

    let backing = shared_queue(&queue, MemoryQueueOptions::default());
    assert_eq!(backing.size(), 0);
    assert_eq!(backing.processing_count(), 0);
    consumer.disconnect().await.unwrap();
}

#[tokio::test]
async fn double_settlement_is_harmless() {
    let queue = unique("double-settle");
    let (producer, consumer) = connected_pair(&queue).await;

    producer.publish(json!("x"), PublishOptions::default()).await.unwrap();

    let done = Arc::new(AtomicU32::new(0));
    let done_clone = done.clone();
    consumer
        .subscribe(
            handler_fn(move |message| {
                let done = done_clone.clone();
                async move {
                    message.ack().await?;
                    message.ack().await?;
                    message.nack(true).await?;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    assert!(wait_until(|| done.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(done.load(Ordering::SeqCst), 1, "no redelivery after ack");

    let backing = shared_queue(&queue, MemoryQueueOptions::default());
    assert_eq!(backing.size(), 0);
    assert_eq!(backing.processing_count(), 0);
    consumer.disconnect().await.unwrap();
}

#[tokio::test]
async fn without_auto_ack_unsettled_messages_stay_in_flight() {
    let queue = unique("manual-ack");
    let (producer, consumer) = connected_pair(&queue).await;

    producer.publish(json!("x"), PublishOptions::default()).await.unwrap();

    let seen = Arc::new(AtomicU32::new(0));
    let seen_clone = seen.clone();
    consumer
        .subscribe(
            handler_fn(move |_message| {
                let seen = seen_clone.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            SubscribeOptions { auto_ack: false, ..Default::default() },
        )
        .await
        .unwrap();

    assert!(wait_until(|| seen.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let backing = shared_queue(&queue, MemoryQueueOptions::default());
    assert_eq!(backing.processing_count(), 1, "unacked message stays in flight");
    assert_eq!(seen.load(Ordering::SeqCst), 1, "and is not redelivered");
    consumer.disconnect().await.unwrap();
}

#[tokio::test]
async fn disconnect_stops_the_loop_promptly() {
    let queue = unique("disconnect");
    let (producer, consumer) = connected_pair(&queue).await;

    let received = Arc::new(AtomicU32::new(0));
    let sink = received.clone();
    consumer
        .subscribe(
            handler_fn(move |_message| {
                let sink = sink.clone();
                async move {
                    sink.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    producer.publish(json!(1), PublishOptions::default()).await.unwrap();
    assert!(wait_until(|| received.load(Ordering::SeqCst) == 1, Duration::from_secs(2)).await);

    consumer.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    producer.publish(json!(2), PublishOptions::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(received.load(Ordering::SeqCst), 1, "no dispatch after disconnect");
}

#[tokio::test]
async fn handler_failures_emit_error_events() {
    let queue = unique("events");
    let (producer, consumer) = connected_pair(&queue).await;
    let mut events = consumer.events();

    consumer
        .subscribe(
            handler_fn(|_message| async move { Err(BusError::consume("nope")) }),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    producer.publish(json!("x"), PublishOptions::default()).await.unwrap();

    let mut saw_message = false;
    let mut saw_error = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !(saw_message && saw_error) && tokio::time::Instant::now() < deadline {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(ConsumerEvent::Message { .. })) => saw_message = true,
            Ok(Ok(ConsumerEvent::Error { error, .. })) => {
                assert_eq!(error.code(), "CONSUME_ERROR");
                saw_error = true;
            }
            Ok(Ok(_)) => {}
            // A lagged receiver keeps draining; only the deadline stops us.
            Ok(Err(_)) => {}
            Err(_) => break,
        }
    }
    assert!(saw_message && saw_error);
    consumer.disconnect().await.unwrap();
}

#[tokio::test]
async fn panicking_handler_is_contained() {
    let queue = unique("panic");
    let dlq_name = unique("panic-dlq");

    let mut config = BusConfig::default();
    config.dead_letter.enabled = true;
    config.dead_letter.destination = Some(dlq_name.clone());
    config.dead_letter.max_delivery_attempts = 1;

    let producer = MemoryProducer::new(&queue, BusConfig::default()).unwrap();
    producer.connect().await.unwrap();
    let consumer = MemoryConsumer::new(&queue, config).unwrap();
    consumer.connect().await.unwrap();

    producer.publish(json!("x"), PublishOptions::default()).await.unwrap();

    consumer
        .subscribe(
            handler_fn(|_message| async move { panic!("handler blew up") }),
            SubscribeOptions::default(),
        )
        .await
        .unwrap();

    let dlq = shared_queue(&dlq_name, MemoryQueueOptions::default());
    assert!(wait_until(|| dlq.size() == 1, Duration::from_secs(2)).await);
    let dead = dlq.dequeue().unwrap();
    assert!(dead.headers["x-death-reason"].as_text().unwrap().contains("handler blew up"));
    consumer.disconnect().await.unwrap();
}

#[tokio::test]
async fn concurrent_dispatch_reports_backpressure() {
    let queue = unique("backpressure");
    let (producer, consumer) = connected_pair(&queue).await;
    let mut events = consumer.events();

    for n in 0..6 {
        producer.publish(json!({ "n": n }), PublishOptions::default()).await.unwrap();
    }

    let received = Arc::new(AtomicU32::new(0));
    let sink = received.clone();
    consumer
        .subscribe(
            handler_fn(move |_message| {
                let sink = sink.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    sink.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            SubscribeOptions { concurrency: 2, ..Default::default() },
        )
        .await
        .unwrap();

    assert!(wait_until(|| received.load(Ordering::SeqCst) == 6, Duration::from_secs(5)).await);

    let mut saw_backpressure = false;
    while let Ok(event) = events.try_recv() {
        if let ConsumerEvent::Backpressure { limit, .. } = event {
            assert_eq!(limit, 2);
            saw_backpressure = true;
        }
    }
    assert!(saw_backpressure, "saturated concurrency emits backpressure");
    consumer.disconnect().await.unwrap();
}

#[tokio::test]
async fn health_check_reports_paused_state() {
    let queue = unique("health");
    let (_producer, consumer) = connected_pair(&queue).await;

    consumer.pause().await;
    let health = consumer.health_check().await;
    assert!(health.healthy);
    assert_eq!(health.details.unwrap()["paused"], true);

    let lag = consumer.lag().await.unwrap();
    assert_eq!(lag, 0);
}
