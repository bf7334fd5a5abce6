//! Error taxonomy shared by every backend.

use std::fmt;

/// Stable machine-readable error kinds.
///
/// Every error carries one of these; the kind decides the wire `code` and the
/// default retryability the resilience middleware consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport failure during connect, publish, or receive.
    Connection,
    /// Encode/decode failure.
    Serialization,
    /// Broker rejected or timed out a send.
    Publish,
    /// Broker returned an error during receive.
    Consume,
    /// Circuit breaker refused the call without invoking the backend.
    CircuitOpen,
    /// Invalid configuration.
    Configuration,
    /// Operation exceeded its deadline.
    Timeout,
    /// A schema-typed serializer rejected the payload.
    SchemaValidation,
    /// Optional operation invoked on a backend that lacks it.
    NotImplemented,
    /// Operation aborted through a cancellation signal.
    Cancelled,
    /// Wrapped foreign failure with no more specific kind.
    Other,
}

impl ErrorKind {
    /// Stable code string, part of the public contract.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "CONNECTION_ERROR",
            ErrorKind::Serialization => "SERIALIZATION_ERROR",
            ErrorKind::Publish => "PUBLISH_ERROR",
            ErrorKind::Consume => "CONSUME_ERROR",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::Configuration => "CONFIGURATION_ERROR",
            ErrorKind::Timeout => "TIMEOUT_ERROR",
            ErrorKind::SchemaValidation => "SCHEMA_VALIDATION_ERROR",
            ErrorKind::NotImplemented => "NOT_IMPLEMENTED",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Other => "MESSAGING_ERROR",
        }
    }

    fn default_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Connection | ErrorKind::Publish | ErrorKind::Consume | ErrorKind::Timeout
        )
    }
}

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for all messaging operations.
///
/// Modeled as kind + message + optional cause so the root SDK error stays
/// reachable through `source()` no matter how many layers wrapped it.
#[derive(Debug)]
pub struct BusError {
    kind: ErrorKind,
    message: String,
    retryable: bool,
    cause: Option<Cause>,
    details: Option<serde_json::Value>,
}

impl BusError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
            cause: None,
            details: None,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn publish(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Publish, message)
    }

    pub fn consume(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Consume, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitOpen, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn schema_validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SchemaValidation, message)
    }

    pub fn not_implemented(operation: &str, backend: &str) -> Self {
        Self::new(
            ErrorKind::NotImplemented,
            format!("{operation} is not supported by the {backend} backend"),
        )
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    /// Attach the underlying failure; it becomes this error's `source()`.
    pub fn with_cause(mut self, cause: impl Into<Cause>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Override the kind's default retryability.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Attach structured context (queue name, broker response, ...).
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Wrap any error value, preserving it as the cause.
    ///
    /// Never fails: callers catching foreign errors always get a `BusError`.
    pub fn wrap(kind: ErrorKind, cause: impl Into<Cause>) -> Self {
        let cause = cause.into();
        Self::new(kind, cause.to_string()).with_cause(cause)
    }

    /// Wrap a panic payload recovered from `catch_unwind`.
    pub fn from_panic(panic: Box<dyn std::any::Any + Send>) -> Self {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_string());
        Self::new(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the resilience middleware may retry the failed operation.
    pub fn retryable(&self) -> bool {
        self.retryable
    }

    pub fn details(&self) -> Option<&serde_json::Value> {
        self.details.as_ref()
    }

    pub fn is_circuit_open(&self) -> bool {
        self.kind == ErrorKind::CircuitOpen
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for BusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<serde_json::Error> for BusError {
    fn from(e: serde_json::Error) -> Self {
        BusError::wrap(ErrorKind::Serialization, e)
    }
}

/// Convenience alias used across the crate.
pub type BusResult<T> = Result<T, BusError>;
