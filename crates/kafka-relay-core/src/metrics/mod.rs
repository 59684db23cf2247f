//! Metrics collection for the message relay.
//!
//! Provides Prometheus-compatible metrics for monitoring delivery, consumer
//! progress and broker health, plus the read-only [`RelayStats`] snapshot.

pub mod prometheus;

pub use self::prometheus::{RelayMetrics, RelayStats};
