//! In-memory reference backend.
//!
//! Ground truth for the contract: a process-local FIFO queue with in-flight
//! tracking, requeue, dead-letter forwarding, and capacity/age limits.
//! Producers and consumers created against the same queue name share one
//! queue instance through a process-wide registry.

mod consumer;
mod producer;
mod queue;
mod registry;

pub use consumer::MemoryConsumer;
pub use producer::MemoryProducer;
pub use queue::{MemoryQueue, MemoryQueueOptions, StoredMessage};
pub use registry::{clear_all_queues, queue_stats, shared_queue, QueueStats};
