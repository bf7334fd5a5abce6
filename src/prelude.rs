//! Convenient re-exports for common anybus types.
pub use crate::{
    backoff::{Backoff, Jitter},
    circuit_breaker::{CircuitBreaker, CircuitState},
    config::{BusConfig, CircuitBreakerConfig, DeadLetterConfig, RetryConfig},
    contract::{
        batch_handler_fn, handler_fn, Consumer, ConsumerEvent, HealthStatus, Producer,
        PublishOptions, SubscribeOptions,
    },
    error::{BusError, BusResult, ErrorKind},
    memory::{MemoryConsumer, MemoryProducer},
    message::{BackendKind, HeaderValue, Headers, Message, ProviderMetadata},
    resilience::ResilienceExecutor,
    retry::RetryExecutor,
    serializer::{JsonCodec, Serializer, SerializerExt},
};
