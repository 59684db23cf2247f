//! Kafka Relay CLI
//!
//! Runs the at-least-once relay against the broker named by `broker.kind`:
//! publishes sequenced batches, consumes them back with deduplication and
//! contiguous commits, and exposes Prometheus metrics while running. The
//! Kafka client needs the `kafka` feature.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kafka_relay_core::config::{BrokerConfig, LoggingConfig};
use kafka_relay_core::{
    BrokerClient, BrokerKind, Disposition, MemoryBroker, Message, MessageHandler, RelayConfig,
    RelayCoordinator, RelayMetrics,
};

/// At-least-once message relay.
#[derive(Parser)]
#[command(name = "kafka-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file. Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the number of messages per batch.
    #[arg(long)]
    count: Option<usize>,

    /// Number of batches to send.
    #[arg(long, default_value_t = 1)]
    batches: u32,

    /// Override the producer and consumer topic.
    #[arg(long)]
    topic: Option<String>,

    /// Stop once the batches are sent and consumed instead of waiting for a
    /// shutdown signal.
    #[arg(long)]
    exit_after_send: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::default(),
    };

    // Apply CLI overrides
    if let Some(count) = args.count {
        config.producer.batch_size = count;
    }
    if let Some(topic) = &args.topic {
        config.producer.topic = topic.clone();
        config.consumer.topic = topic.clone();
    }
    config.validate()?;

    // Override log level from verbosity flag
    let log_config = match args.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };

    setup_tracing(&log_config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = ?config.broker.kind,
        topic = %config.producer.topic,
        batch_size = config.producer.batch_size,
        batches = args.batches,
        consumer_enabled = config.consumer.enabled,
        "starting kafka relay"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move { run_relay(config, args.batches, args.exit_after_send).await })
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

async fn run_relay(config: RelayConfig, batches: u32, exit_after_send: bool) -> anyhow::Result<()> {
    let metrics = Arc::new(RelayMetrics::new());
    let broker = build_broker(&config.broker)?;
    let handler: Arc<dyn MessageHandler> = Arc::new(|message: &Message| {
        debug!(
            sequence = message.sequence(),
            produced_at = %message.produced_at(),
            "received message"
        );
        Disposition::Ack
    });

    // Start metrics server if enabled
    if config.metrics.enabled {
        let metrics_clone = Arc::clone(&metrics);
        let metrics_addr = config.metrics.address.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&metrics_addr, metrics_clone).await {
                tracing::error!(error = %e, "metrics server error");
            }
        });
    }

    let batch_size = config.producer.batch_size;
    let grace = config.shutdown.grace_period();
    let consumer_enabled = config.consumer.enabled;
    let relay = RelayCoordinator::with_metrics(config, broker, handler, Arc::clone(&metrics))?;

    relay.start().await?;

    let mut last_sequence = 0u64;
    for batch in 1..=batches {
        match relay.send_batch(batch_size).await {
            Ok(result) => {
                last_sequence += result.total as u64;
                info!(
                    batch,
                    batch_id = %result.batch_id,
                    total = result.total,
                    acked = result.acked_count,
                    failed = result.failed_sequences.len(),
                    timed_out = result.timed_out,
                    "batch sent"
                );
                if result.cancelled {
                    break;
                }
            }
            Err(e) => {
                warn!(batch, error = %e, "batch not sent");
                break;
            }
        }
    }

    if exit_after_send {
        if consumer_enabled {
            wait_for_consumer(&relay, last_sequence, grace).await;
        }
    } else {
        shutdown_signal().await;
        info!("shutdown signal received, stopping relay");
    }

    relay.stop().await;

    let status = relay.status();
    info!(
        total_sent = status.stats.total_sent,
        total_acked = status.stats.total_acked,
        total_failed = status.stats.total_failed,
        last_committed = status.stats.last_committed,
        "relay shutdown complete"
    );
    Ok(())
}

fn build_broker(config: &BrokerConfig) -> anyhow::Result<Arc<dyn BrokerClient>> {
    match config.kind {
        BrokerKind::Memory => Ok(Arc::new(MemoryBroker::new())),
        #[cfg(feature = "kafka")]
        BrokerKind::Kafka => Ok(Arc::new(kafka_relay_core::KafkaBroker::new(config)?)),
        #[cfg(not(feature = "kafka"))]
        BrokerKind::Kafka => {
            anyhow::bail!("broker.kind is kafka but kafka-relay was built without the `kafka` feature")
        }
    }
}

/// Wait up to `timeout` for the consumer to commit through `sequence`.
async fn wait_for_consumer(relay: &RelayCoordinator, sequence: u64, timeout: Duration) {
    let Some(consumer) = relay.consumer().await else {
        return;
    };
    let mut session = consumer.watch_session();

    let caught_up = tokio::time::timeout(timeout, session.wait_for(|s| s.last_committed >= sequence))
        .await
        .is_ok_and(|reached| reached.is_ok());

    if caught_up {
        info!(last_committed = sequence, "consumer caught up");
    } else {
        warn!(
            expected = sequence,
            last_committed = consumer.session().last_committed,
            "consumer did not catch up before shutdown"
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn start_metrics_server(
    addr: &str,
    metrics: Arc<RelayMetrics>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!(address = %addr, "metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                let metrics = Arc::clone(&metrics);
                async move {
                    let body = metrics.encode().unwrap_or_default();
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(error = %e, "metrics connection error");
            }
        });
    }
}
