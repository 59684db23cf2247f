//! Domain error types for the message relay.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.

use thiserror::Error;

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// At least one bootstrap server is required.
    #[error("broker.bootstrap_servers must not be empty")]
    NoBootstrapServers,

    /// Invalid address format.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),

    /// A topic or group name was empty.
    #[error("{field} must not be empty")]
    EmptyName { field: &'static str },

    /// The backpressure window must admit at least one send.
    #[error("producer.max_in_flight must be at least 1 when set, got {0}")]
    InvalidWindow(usize),

    /// The dedup window must hold at least one sequence.
    #[error("consumer.dedup_window must be at least 1, got {0}")]
    InvalidDedupWindow(usize),

    /// Retry policy needs at least one attempt.
    #[error("retry.max_attempts must be at least 1, got {0}")]
    InvalidRetryAttempts(u32),

    /// Initial backoff must not exceed the backoff cap.
    #[error("retry.initial_backoff_ms ({initial}) must be <= retry.max_backoff_ms ({max})")]
    InvalidBackoff { initial: u64, max: u64 },
}

/// Errors produced while decoding a wire payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The payload does not follow the relay message format or was rejected
    /// by a registered validator.
    #[error("malformed message: {reason}")]
    MalformedMessage { reason: String },
}

impl CodecError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            reason: reason.into(),
        }
    }
}

/// Errors reported by a delivery tracker when applying an outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    /// The outcome refers to a sequence that is not pending in this batch.
    #[error("unknown sequence {0}: not pending in this batch")]
    UnknownSequence(u64),
}

/// Errors that occur during relay operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Broker could not be reached or the connection failed.
    #[error("broker unavailable: {message}")]
    BrokerUnavailable { message: String },

    /// The operation was cancelled by shutdown.
    #[error("operation cancelled")]
    Cancelled,

    /// Sequences were skipped after the gap hold timeout.
    #[error("sequence gap: {first}..={last} skipped")]
    SequenceGap { first: u64, last: u64 },

    /// The coordinator or component is not running.
    #[error("relay is not running")]
    NotRunning,

    /// The broker rejected or closed a subscription.
    #[error("subscription to {topic}:{partition} failed: {message}")]
    Subscription {
        topic: String,
        partition: i32,
        message: String,
    },

    /// Message could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The relay was built from an invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<ConfigError> for RelayError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl RelayError {
    /// Build a [`RelayError::BrokerUnavailable`] from any displayable cause.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::BrokerUnavailable {
            message: message.into(),
        }
    }

    /// Whether the coordinator should retry the operation with backoff.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::BrokerUnavailable { .. })
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for codec operations.
pub type CodecResult<T> = std::result::Result<T, CodecError>;
