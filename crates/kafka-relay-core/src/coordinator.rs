//! Relay lifecycle facade.
//!
//! [`RelayCoordinator`] owns the broker client handle and wires the producer
//! and consumer to it. Broker-unavailable failures during start and sends are
//! retried with exponential backoff; exhausting the retries leaves the
//! affected component `Degraded` until the next successful attempt.
//!
//! A consumer whose subscription ends on its own is marked `Degraded` with
//! the reason as the last error. Calling [`RelayCoordinator::start`] again
//! resubscribes it.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::BrokerClient;
use crate::config::{RelayConfig, RetryConfig};
use crate::consumer::{MessageHandler, RelayConsumer};
use crate::error::{RelayError, Result};
use crate::message::MessageCodec;
use crate::metrics::{RelayMetrics, RelayStats};
use crate::producer::RelayProducer;
use crate::tracker::BatchResult;

/// Lifecycle state of the producer or consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ComponentState {
    #[default]
    Stopped,
    Starting,
    Running,
    /// The broker was unavailable after all retries, or the consumer's
    /// subscription ended.
    Degraded,
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStatus {
    pub producer_state: ComponentState,
    pub consumer_state: ComponentState,
    pub last_error: Option<RelayError>,
    pub stats: RelayStats,
}

#[derive(Debug, Clone, Default)]
struct Lifecycle {
    producer_state: ComponentState,
    consumer_state: ComponentState,
    last_error: Option<RelayError>,
}

#[derive(Default)]
struct Components {
    producer: Option<Arc<RelayProducer>>,
    consumer: Option<Arc<RelayConsumer>>,
}

/// Wires producer and consumer lifecycle around one broker client.
pub struct RelayCoordinator {
    config: RelayConfig,
    client: Arc<dyn BrokerClient>,
    codec: MessageCodec,
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<RelayMetrics>,
    /// Cancelled by `stop`; replaced by the next `start`.
    cancel: std::sync::Mutex<CancellationToken>,
    components: Mutex<Components>,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
}

impl RelayCoordinator {
    /// Create a coordinator. Nothing connects until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] if the configuration is invalid.
    pub fn new(
        config: RelayConfig,
        client: Arc<dyn BrokerClient>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        Self::with_metrics(config, client, handler, Arc::new(RelayMetrics::new()))
    }

    /// Create a coordinator reporting into an existing metrics registry.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] if the configuration is invalid.
    pub fn with_metrics(
        config: RelayConfig,
        client: Arc<dyn BrokerClient>,
        handler: Arc<dyn MessageHandler>,
        metrics: Arc<RelayMetrics>,
    ) -> Result<Self> {
        config.validate()?;

        let codec = MessageCodec::new(config.producer.source.clone());
        let (lifecycle, _) = watch::channel(Lifecycle::default());

        Ok(Self {
            config,
            client,
            codec,
            handler,
            metrics,
            cancel: std::sync::Mutex::new(CancellationToken::new()),
            components: Mutex::new(Components::default()),
            lifecycle: Arc::new(lifecycle),
        })
    }

    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<RelayMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Connect to the broker and start the producer and, if enabled, the
    /// consumer. Starting a running coordinator returns its status, after
    /// resubscribing the consumer if its subscription was lost.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::BrokerUnavailable`] once retries are exhausted,
    /// leaving the coordinator `Degraded`, or [`RelayError::Cancelled`] if
    /// [`stop`](Self::stop) interrupts the retries.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<RelayStatus> {
        let mut components = self.components.lock().await;
        if components.producer.is_some() {
            if let Some(consumer) = &components.consumer {
                if self.lifecycle.borrow().consumer_state == ComponentState::Degraded {
                    self.resume_consumer(consumer).await?;
                    return Ok(self.status());
                }
            }
            debug!("relay already running");
            return Ok(self.status());
        }

        let cancel = self.fresh_token();
        let consumer_enabled = self.config.consumer.enabled;

        self.lifecycle.send_modify(|l| {
            l.producer_state = ComponentState::Starting;
            if consumer_enabled {
                l.consumer_state = ComponentState::Starting;
            }
        });

        info!(
            bootstrap_servers = ?self.config.broker.bootstrap_servers(),
            client_id = %self.config.broker.client_id(),
            "starting relay"
        );

        if let Err(e) = self
            .with_retry("connect", &cancel, || self.client.connect())
            .await
        {
            self.mark_failed(true, consumer_enabled, &e);
            return Err(e);
        }

        let producer = Arc::new(RelayProducer::new(
            Arc::clone(&self.client),
            self.codec.clone(),
            self.config.producer.clone(),
            Arc::clone(&self.metrics),
            cancel.child_token(),
        ));

        let consumer = if consumer_enabled {
            let consumer = Arc::new(RelayConsumer::new(
                Arc::clone(&self.client),
                self.codec.clone(),
                self.config.consumer.clone(),
                Arc::clone(&self.metrics),
                cancel.child_token(),
            ));
            if let Err(e) = self.subscribe(&consumer, &cancel).await {
                producer.shutdown(Duration::ZERO).await;
                self.mark_failed(true, true, &e);
                return Err(e);
            }
            self.supervise(&consumer, &cancel);
            Some(consumer)
        } else {
            None
        };

        components.producer = Some(producer);
        components.consumer = consumer;

        self.lifecycle.send_modify(|l| {
            l.producer_state = ComponentState::Running;
            l.consumer_state = if consumer_enabled {
                ComponentState::Running
            } else {
                ComponentState::Stopped
            };
        });

        info!(
            topic = %self.config.producer.topic,
            consumer_enabled,
            "relay started"
        );
        Ok(self.status())
    }

    async fn subscribe(&self, consumer: &RelayConsumer, cancel: &CancellationToken) -> Result<()> {
        let settings = &self.config.consumer;
        self.with_retry("subscribe", cancel, || {
            consumer.subscribe(
                &settings.topic,
                settings.partition,
                &settings.group_id,
                Arc::clone(&self.handler),
            )
        })
        .await
    }

    /// Resubscribe a consumer whose receive loop ended on its own.
    async fn resume_consumer(&self, consumer: &RelayConsumer) -> Result<()> {
        let cancel = self.current_token();
        info!("resubscribing degraded consumer");

        self.lifecycle
            .send_modify(|l| l.consumer_state = ComponentState::Starting);

        if let Err(e) = self.subscribe(consumer, &cancel).await {
            self.mark_failed(false, true, &e);
            return Err(e);
        }
        self.supervise(consumer, &cancel);

        self.lifecycle
            .send_modify(|l| l.consumer_state = ComponentState::Running);
        info!("consumer recovered");
        Ok(())
    }

    /// Mark the consumer `Degraded` if its receive loop ends before `cancel`.
    fn supervise(&self, consumer: &RelayConsumer, cancel: &CancellationToken) {
        let lifecycle = Arc::clone(&self.lifecycle);
        let mut failures = consumer.watch_failure();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let failure = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                failure = next_failure(&mut failures) => failure,
            };
            let Some(err) = failure else {
                return;
            };

            error!(error = %err, "consumer stopped receiving");
            lifecycle.send_modify(|l| {
                l.consumer_state = ComponentState::Degraded;
                l.last_error = Some(err);
            });
        });
    }

    /// Send `count` default messages to the configured producer topic.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NotRunning`] before `start` or after `stop`, and
    /// [`RelayError::BrokerUnavailable`] once retries are exhausted.
    #[instrument(skip(self))]
    pub async fn send_batch(&self, count: usize) -> Result<BatchResult> {
        let producer = self.producer().await?;
        let topic = &self.config.producer.topic;
        self.send_with_retry(|| producer.send_batch(count, topic))
            .await
    }

    /// Send one message per entry of `texts` to the configured producer topic.
    ///
    /// # Errors
    ///
    /// Same as [`send_batch`](Self::send_batch).
    #[instrument(skip(self, texts), fields(count = texts.len()))]
    pub async fn send_payloads(&self, texts: Vec<String>) -> Result<BatchResult> {
        let producer = self.producer().await?;
        let topic = &self.config.producer.topic;
        self.send_with_retry(|| producer.send_payloads(topic, texts.clone()))
            .await
    }

    /// Cancel in-flight operations, drain for up to the configured grace
    /// period and release the broker client.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.current_token().cancel();

        let (producer, consumer) = {
            let mut components = self.components.lock().await;
            (components.producer.take(), components.consumer.take())
        };

        let grace = self.config.shutdown.grace_period();
        info!(grace_ms = self.config.shutdown.grace_period_ms, "stopping relay");

        tokio::join!(
            async {
                if let Some(producer) = &producer {
                    producer.shutdown(grace).await;
                }
            },
            async {
                if let Some(consumer) = &consumer {
                    consumer.stop(grace).await;
                }
            },
        );

        self.client.close().await;

        self.lifecycle.send_modify(|l| {
            l.producer_state = ComponentState::Stopped;
            l.consumer_state = ComponentState::Stopped;
        });

        let stats = self.metrics.stats();
        info!(
            total_sent = stats.total_sent,
            total_acked = stats.total_acked,
            total_failed = stats.total_failed,
            last_committed = stats.last_committed,
            "relay stopped"
        );
    }

    /// Current lifecycle state and delivery statistics.
    #[must_use]
    pub fn status(&self) -> RelayStatus {
        let lifecycle = self.lifecycle.borrow().clone();
        RelayStatus {
            producer_state: lifecycle.producer_state,
            consumer_state: lifecycle.consumer_state,
            last_error: lifecycle.last_error,
            stats: self.metrics.stats(),
        }
    }

    /// The running consumer, if any.
    pub async fn consumer(&self) -> Option<Arc<RelayConsumer>> {
        self.components.lock().await.consumer.clone()
    }

    async fn producer(&self) -> Result<Arc<RelayProducer>> {
        self.components
            .lock()
            .await
            .producer
            .clone()
            .ok_or(RelayError::NotRunning)
    }

    async fn send_with_retry<F, Fut>(&self, send: F) -> Result<BatchResult>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<BatchResult>>,
    {
        let cancel = self.current_token();
        match self.with_retry("send_batch", &cancel, send).await {
            Ok(result) => {
                self.lifecycle.send_if_modified(|l| {
                    if l.producer_state == ComponentState::Degraded {
                        info!("producer recovered");
                        l.producer_state = ComponentState::Running;
                        true
                    } else {
                        false
                    }
                });
                Ok(result)
            }
            Err(e) => {
                if e.is_retriable() {
                    self.mark_failed(true, false, &e);
                }
                Err(e)
            }
        }
    }

    /// Run `operation`, retrying broker-unavailable failures with backoff.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        mut attempt_fn: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = &self.config.retry;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !err.is_retriable() || attempt >= policy.max_attempts {
                if err.is_retriable() {
                    error!(
                        operation,
                        attempts = attempt,
                        error = %err,
                        "broker unavailable, giving up"
                    );
                }
                return Err(err);
            }

            let delay = jittered_backoff(policy, attempt - 1);
            self.metrics.record_retry(operation);
            warn!(
                operation,
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "broker unavailable, retrying"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(RelayError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn mark_failed(&self, producer: bool, consumer: bool, err: &RelayError) {
        self.lifecycle.send_modify(|l| {
            if producer {
                l.producer_state = ComponentState::Degraded;
            }
            if consumer {
                l.consumer_state = ComponentState::Degraded;
            }
            l.last_error = Some(err.clone());
        });
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The live cancellation token, replacing it first if a previous `stop`
    /// cancelled it.
    fn fresh_token(&self) -> CancellationToken {
        let mut cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
        }
        cancel.clone()
    }
}

/// The next failure reported by a consumer, or `None` once it is dropped.
async fn next_failure(failures: &mut watch::Receiver<Option<RelayError>>) -> Option<RelayError> {
    failures
        .wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|failure| failure.clone())
}

/// Backoff for retry number `retry`, scaled by a random factor in
/// `[1 - jitter, 1 + jitter]`.
fn jittered_backoff(policy: &RetryConfig, retry: u32) -> Duration {
    let base = policy.backoff_delay(retry);
    let jitter = policy.jitter.clamp(0.0, 1.0);
    if jitter == 0.0 || base.is_zero() {
        return base;
    }
    let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
    base.mul_f64(factor)
}
