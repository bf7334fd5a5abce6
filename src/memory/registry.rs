//! Process-wide queue registry.
//!
//! Producers and consumers constructed against the same queue name share one
//! queue instance. Queues persist for the process lifetime unless explicitly
//! cleared.

use super::queue::{MemoryQueue, MemoryQueueOptions};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

static REGISTRY: Lazy<Mutex<HashMap<String, Arc<MemoryQueue>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Fetch the queue registered under `name`, creating it with `options` on
/// first use. Options only apply at creation; later callers share the
/// existing instance as-is.
pub fn shared_queue(name: &str, options: MemoryQueueOptions) -> Arc<MemoryQueue> {
    let mut registry = lock();
    registry
        .entry(name.to_string())
        .or_insert_with(|| {
            tracing::debug!(queue = name, "creating in-memory queue");
            Arc::new(MemoryQueue::new(name, options))
        })
        .clone()
}

/// Per-queue counters for admin tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub size: usize,
    pub processing_count: usize,
}

pub fn queue_stats() -> HashMap<String, QueueStats> {
    lock()
        .iter()
        .map(|(name, queue)| {
            (
                name.clone(),
                QueueStats { size: queue.size(), processing_count: queue.processing_count() },
            )
        })
        .collect()
}

/// Empty and unregister every queue. Intended for tests and admin tooling;
/// queues held through existing `Arc`s keep working but are no longer shared
/// with new producers/consumers.
pub fn clear_all_queues() {
    let mut registry = lock();
    for queue in registry.values() {
        queue.clear();
    }
    registry.clear();
}

fn lock() -> std::sync::MutexGuard<'static, HashMap<String, Arc<MemoryQueue>>> {
    REGISTRY.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
