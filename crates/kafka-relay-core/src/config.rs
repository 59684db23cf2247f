//! Configuration types for the message relay.
//!
//! Configuration is loaded from YAML files and validated before use.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Root configuration for the relay.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Broker connection configuration.
    pub broker: BrokerConfig,

    /// Producer side of the relay.
    #[serde(default)]
    pub producer: ProducerConfig,

    /// Consumer side of the relay.
    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Retry policy for broker-unavailable failures.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Shutdown behaviour.
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Prometheus metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which broker client the relay runs against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process broker; bootstrap servers and client id are not used.
    #[default]
    Memory,
    /// Kafka cluster reached through `bootstrap_servers`.
    Kafka,
}

/// Broker connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// Broker client to use.
    #[serde(default)]
    pub kind: BrokerKind,

    /// Bootstrap server addresses.
    /// Supports environment variable expansion: "${KAFKA_BOOTSTRAP}"
    pub bootstrap_servers: Vec<String>,

    /// Client identifier reported to the broker.
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

impl BrokerConfig {
    /// Bootstrap servers with environment variables expanded.
    #[must_use]
    pub fn bootstrap_servers(&self) -> Vec<String> {
        self.bootstrap_servers
            .iter()
            .map(|s| expand_env_vars(s))
            .collect()
    }

    /// Client id with environment variables expanded.
    #[must_use]
    pub fn client_id(&self) -> String {
        expand_env_vars(&self.client_id)
    }
}

/// Producer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    /// Topic that batches are sent to.
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Number of messages in a batch when none is requested explicitly.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum number of unacknowledged sends. Unbounded when not set.
    #[serde(default)]
    pub max_in_flight: Option<usize>,

    /// Overall deadline for one batch in milliseconds. Unbounded when not set.
    #[serde(default)]
    pub batch_deadline_ms: Option<u64>,

    /// Log progress every N acknowledged messages (0 disables).
    #[serde(default = "default_progress_log_interval")]
    pub progress_log_interval: u64,

    /// Source name rendered into every message.
    #[serde(default = "default_source")]
    pub source: String,
}

impl ProducerConfig {
    #[must_use]
    pub fn batch_deadline(&self) -> Option<Duration> {
        self.batch_deadline_ms.map(Duration::from_millis)
    }
}

/// Consumer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    /// Whether the coordinator starts a consumer session.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Topic to subscribe to.
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Partition to subscribe to.
    #[serde(default)]
    pub partition: i32,

    /// Consumer group used for offset commits.
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Number of recent sequences remembered for deduplication.
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,

    /// How long a sequence gap holds the commit point before it is skipped.
    #[serde(default = "default_gap_hold_timeout_ms")]
    pub gap_hold_timeout_ms: u64,

    /// How often an idle session re-evaluates held gaps.
    #[serde(default = "default_gap_check_interval_ms")]
    pub gap_check_interval_ms: u64,
}

impl ConsumerConfig {
    #[must_use]
    pub fn gap_hold_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_hold_timeout_ms)
    }

    #[must_use]
    pub fn gap_check_interval(&self) -> Duration {
        Duration::from_millis(self.gap_check_interval_ms.max(1))
    }
}

/// Exponential backoff policy for broker-unavailable failures.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound for a single backoff delay in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Random jitter applied to each delay, as a fraction (0.2 = +/-20%).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl RetryConfig {
    /// Backoff before retry number `retry` (0-based), without jitter.
    #[must_use]
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.min(63)).unwrap_or(u64::MAX);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShutdownConfig {
    /// Time in milliseconds to wait for in-flight work before force-closing.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

impl ShutdownConfig {
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether to enable the metrics endpoint.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address for the metrics HTTP server.
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
fn expand_env_vars(s: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

// Default value functions

fn default_client_id() -> String {
    "pmtv-test-client".to_string()
}

fn default_topic() -> String {
    "pmtv-test-topic".to_string()
}

fn default_batch_size() -> usize {
    500
}

fn default_progress_log_interval() -> u64 {
    100
}

fn default_source() -> String {
    "PaymeTv".to_string()
}

fn default_true() -> bool {
    true
}

fn default_group_id() -> String {
    "pmtv-test-group".to_string()
}

fn default_dedup_window() -> usize {
    1024
}

fn default_gap_hold_timeout_ms() -> u64 {
    5_000
}

fn default_gap_check_interval_ms() -> u64 {
    500
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    8
}

fn default_jitter() -> f64 {
    0.2
}

fn default_grace_period_ms() -> u64 {
    5_000
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::default(),
            bootstrap_servers: vec!["localhost:9092".to_string()],
            client_id: default_client_id(),
        }
    }
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            batch_size: default_batch_size(),
            max_in_flight: None,
            batch_deadline_ms: None,
            progress_log_interval: default_progress_log_interval(),
            source: default_source(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: default_topic(),
            partition: 0,
            group_id: default_group_id(),
            dedup_window: default_dedup_window(),
            gap_hold_timeout_ms: default_gap_hold_timeout_ms(),
            gap_check_interval_ms: default_gap_check_interval_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: default_max_attempts(),
            jitter: default_jitter(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            retry: RetryConfig::default(),
            shutdown: ShutdownConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// Configuration loading and validation

impl RelayConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation check fails.
    pub fn validate(&self) -> ConfigResult<()> {
        self.broker.validate()?;

        if self.producer.topic.trim().is_empty() {
            return Err(ConfigError::EmptyName {
                field: "producer.topic",
            });
        }
        if let Some(window) = self.producer.max_in_flight {
            if window == 0 {
                return Err(ConfigError::InvalidWindow(window));
            }
        }

        if self.consumer.topic.trim().is_empty() {
            return Err(ConfigError::EmptyName {
                field: "consumer.topic",
            });
        }
        if self.consumer.group_id.trim().is_empty() {
            return Err(ConfigError::EmptyName {
                field: "consumer.group_id",
            });
        }
        if self.consumer.dedup_window == 0 {
            return Err(ConfigError::InvalidDedupWindow(self.consumer.dedup_window));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidRetryAttempts(self.retry.max_attempts));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff {
                initial: self.retry.initial_backoff_ms,
                max: self.retry.max_backoff_ms,
            });
        }

        Ok(())
    }
}

impl BrokerConfig {
    /// Validate the broker configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no servers are configured or an address is not
    /// of the form `host:port`.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.bootstrap_servers.is_empty() {
            return Err(ConfigError::NoBootstrapServers);
        }

        for server in self.bootstrap_servers() {
            parse_address(&server)?;
        }

        Ok(())
    }
}

/// Parse an address into host and port.
///
/// # Errors
///
/// Returns an error if the address cannot be parsed.
pub fn parse_address(addr: &str) -> ConfigResult<(String, u16)> {
    let parts: Vec<&str> = addr.rsplitn(2, ':').collect();
    if parts.len() != 2 || parts[1].is_empty() {
        return Err(ConfigError::InvalidAddress(addr.to_string()));
    }
    let port: u16 = parts[0]
        .parse()
        .map_err(|_| ConfigError::InvalidAddress(addr.to_string()))?;
    Ok((parts[1].to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn valid_config() -> RelayConfig {
        RelayConfig {
            broker: BrokerConfig {
                bootstrap_servers: vec!["localhost:9092".to_string()],
                ..BrokerConfig::default()
            },
            ..RelayConfig::default()
        }
    }

    #[test]
    fn test_valid_config_passes_validation() {
        let config = valid_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_bootstrap_servers() {
        let mut config = valid_config();
        config.broker.bootstrap_servers.clear();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::NoBootstrapServers)
        ));
    }

    #[test]
    fn test_invalid_bootstrap_address() {
        let mut config = valid_config();
        config.broker.bootstrap_servers = vec!["localhost".to_string()];

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = valid_config();
        config.producer.max_in_flight = Some(0);

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidWindow(0))
        ));
    }

    #[test]
    fn test_zero_dedup_window_rejected() {
        let mut config = valid_config();
        config.consumer.dedup_window = 0;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDedupWindow(0))
        ));
    }

    #[test]
    fn test_empty_group_rejected() {
        let mut config = valid_config();
        config.consumer.group_id = " ".to_string();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyName {
                field: "consumer.group_id"
            })
        ));
    }

    #[test]
    fn test_backoff_bounds_rejected() {
        let mut config = valid_config();
        config.retry.initial_backoff_ms = 1_000;
        config.retry.max_backoff_ms = 10;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBackoff { .. })
        ));

        config.retry = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRetryAttempts(0))
        ));
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let retry = RetryConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            max_attempts: 8,
            jitter: 0.0,
        };

        assert_eq!(retry.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(retry.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(retry.backoff_delay(3), Duration::from_millis(800));
        assert_eq!(retry.backoff_delay(4), Duration::from_millis(1_000));
        assert_eq!(retry.backoff_delay(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_from_yaml_string() {
        let yaml = r"
broker:
  bootstrap_servers:
    - '192.168.0.165:9093'
producer:
  topic: 'hello-world'
  batch_size: 10
  max_in_flight: 4
  batch_deadline_ms: 2000
consumer:
  topic: 'hello-world'
  group_id: 'paymetv-group'
";
        let config = RelayConfig::from_str(yaml).unwrap();
        assert_eq!(config.producer.topic, "hello-world");
        assert_eq!(config.producer.batch_size, 10);
        assert_eq!(config.producer.max_in_flight, Some(4));
        assert_eq!(
            config.producer.batch_deadline(),
            Some(Duration::from_millis(2000))
        );
        assert_eq!(config.consumer.group_id, "paymetv-group");
    }

    #[test]
    fn test_default_values_applied() {
        let yaml = r"
broker:
  bootstrap_servers:
    - 'localhost:9092'
";
        let config = RelayConfig::from_str(yaml).unwrap();
        assert_eq!(config.broker.kind, BrokerKind::Memory);
        assert_eq!(config.broker.client_id, "pmtv-test-client");
        assert_eq!(config.producer.topic, "pmtv-test-topic");
        assert_eq!(config.producer.batch_size, 500);
        assert_eq!(config.producer.max_in_flight, None);
        assert_eq!(config.producer.batch_deadline(), None);
        assert_eq!(config.producer.progress_log_interval, 100);
        assert_eq!(config.producer.source, "PaymeTv");
        assert!(config.consumer.enabled);
        assert_eq!(config.consumer.group_id, "pmtv-test-group");
        assert_eq!(config.consumer.partition, 0);
        assert_eq!(config.consumer.dedup_window, 1024);
        assert_eq!(config.retry.initial_backoff_ms, 100);
        assert_eq!(config.retry.max_attempts, 8);
        assert_eq!(config.shutdown.grace_period(), Duration::from_secs(5));
        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.address, "0.0.0.0:9090");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_broker_kind() {
        let yaml = r"
broker:
  kind: kafka
  bootstrap_servers:
    - 'kafka-1:9092'
    - 'kafka-2:9092'
  client_id: relay-a
";
        let config = RelayConfig::from_str(yaml).unwrap();
        assert_eq!(config.broker.kind, BrokerKind::Kafka);
        assert_eq!(config.broker.bootstrap_servers().len(), 2);

        let yaml = r"
broker:
  kind: zookeeper
  bootstrap_servers: ['localhost:9092']
";
        assert!(matches!(
            RelayConfig::from_str(yaml),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_missing_broker_section_fails() {
        let yaml = r"
producer:
  topic: 'x'
";
        assert!(matches!(
            RelayConfig::from_str(yaml),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("TEST_RELAY_BOOTSTRAP", "kafka.internal:9093");
        std::env::set_var("TEST_RELAY_CLIENT", "relay-7");

        let config = BrokerConfig {
            bootstrap_servers: vec!["${TEST_RELAY_BOOTSTRAP}".to_string()],
            client_id: "${TEST_RELAY_CLIENT}".to_string(),
            ..BrokerConfig::default()
        };

        assert_eq!(config.bootstrap_servers(), vec!["kafka.internal:9093"]);
        assert_eq!(config.client_id(), "relay-7");
        assert!(config.validate().is_ok());

        std::env::remove_var("TEST_RELAY_BOOTSTRAP");
        std::env::remove_var("TEST_RELAY_CLIENT");
    }

    #[test]
    fn test_env_var_expansion_missing_var() {
        let config = BrokerConfig {
            bootstrap_servers: vec!["${NONEXISTENT_RELAY_VAR}".to_string()],
            ..BrokerConfig::default()
        };

        assert_eq!(config.bootstrap_servers(), vec![String::new()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "broker:\n  bootstrap_servers: ['localhost:9092']\nproducer:\n  topic: from-file\n  max_in_flight: 16"
        )
        .unwrap();

        let config = RelayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.producer.topic, "from-file");
        assert_eq!(config.producer.max_in_flight, Some(16));
        assert_eq!(config.consumer.group_id, "pmtv-test-group");
    }

    #[test]
    fn test_from_missing_file() {
        assert!(matches!(
            RelayConfig::from_file("/nonexistent/relay.yaml"),
            Err(ConfigError::IoError { .. })
        ));
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("broker-1:9092").unwrap(),
            ("broker-1".to_string(), 9092)
        );
        assert!(parse_address(":9092").is_err());
        assert!(parse_address("broker:port").is_err());
    }
}
