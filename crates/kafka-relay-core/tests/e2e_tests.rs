//! End-to-end tests over the in-process broker: produce, consume, commit and
//! resume.

use std::sync::Arc;
use std::time::Duration;

use kafka_relay_core::testing::RecordingHandler;
use kafka_relay_core::{ComponentState, MemoryBroker, MessageCodec, RelayConfig, RelayCoordinator};

fn config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.producer.topic = "e2e".to_string();
    config.consumer.topic = "e2e".to_string();
    config.consumer.group_id = "e2e-group".to_string();
    config.producer.max_in_flight = Some(64);
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 10;
    config.shutdown.grace_period_ms = 1_000;
    config.metrics.enabled = false;
    config
}

async fn wait_for_commit(coordinator: &RelayCoordinator, sequence: u64) {
    let consumer = coordinator.consumer().await.expect("consumer running");
    let mut rx = consumer.watch_session();
    tokio::time::timeout(
        Duration::from_secs(30),
        rx.wait_for(|s| s.last_committed >= sequence),
    )
    .await
    .expect("commit point should advance")
    .expect("session channel open");
}

#[tokio::test]
async fn test_produce_consume_commit_500() {
    let broker = Arc::new(MemoryBroker::new());
    let handler = Arc::new(RecordingHandler::new());
    let coordinator = RelayCoordinator::new(config(), broker.clone(), handler.clone()).unwrap();

    coordinator.start().await.unwrap();
    let result = coordinator.send_batch(500).await.unwrap();
    assert_eq!(result.acked_count, 500);

    wait_for_commit(&coordinator, 500).await;

    assert_eq!(handler.sequences(), (1..=500).collect::<Vec<_>>());
    assert_eq!(broker.committed_offset("e2e-group", "e2e", 0), Some(500));

    let status = coordinator.status();
    assert_eq!(status.producer_state, ComponentState::Running);
    assert_eq!(status.consumer_state, ComponentState::Running);
    assert_eq!(status.stats.total_sent, 500);
    assert_eq!(status.stats.total_acked, 500);
    assert_eq!(status.stats.last_committed, 500);

    coordinator.stop().await;
}

#[tokio::test]
async fn test_wire_format_on_broker() {
    let broker = Arc::new(MemoryBroker::new());
    let mut config = config();
    config.consumer.enabled = false;
    let coordinator =
        RelayCoordinator::new(config, broker.clone(), Arc::new(RecordingHandler::new())).unwrap();

    coordinator.start().await.unwrap();
    coordinator.send_batch(3).await.unwrap();
    coordinator.stop().await;

    let records = broker.records("e2e", 0);
    assert_eq!(records.len(), 3);

    let text = std::str::from_utf8(&records[0]).unwrap();
    assert!(text.starts_with("Message #1 from PaymeTv at "));

    let codec = MessageCodec::default();
    let sequences: Vec<u64> = records
        .iter()
        .map(|r| codec.decode(r).unwrap().sequence())
        .collect();
    assert_eq!(sequences, vec![1, 2, 3]);
}

/// A restarted consumer resumes from the committed offset. The new producer
/// session numbers its messages from 1 again.
#[tokio::test]
async fn test_restart_resumes_from_committed_offset() {
    let broker = Arc::new(MemoryBroker::new());
    let handler = Arc::new(RecordingHandler::new());
    let coordinator = RelayCoordinator::new(config(), broker.clone(), handler.clone()).unwrap();

    coordinator.start().await.unwrap();
    coordinator.send_batch(10).await.unwrap();
    wait_for_commit(&coordinator, 10).await;
    coordinator.stop().await;
    assert_eq!(broker.committed_offset("e2e-group", "e2e", 0), Some(10));

    coordinator.start().await.unwrap();
    coordinator.send_batch(5).await.unwrap();
    wait_for_commit(&coordinator, 5).await;

    // Records 0..10 are not redelivered; only the five new ones arrive.
    assert_eq!(handler.sequences().len(), 15);
    assert_eq!(broker.records("e2e", 0).len(), 15);
    assert_eq!(broker.committed_offset("e2e-group", "e2e", 0), Some(15));

    coordinator.stop().await;
}

#[tokio::test]
async fn test_broker_outage_recovers() {
    let broker = Arc::new(MemoryBroker::new());
    let mut config = config();
    config.consumer.enabled = false;
    config.retry.max_attempts = 2;
    let coordinator =
        RelayCoordinator::new(config, broker.clone(), Arc::new(RecordingHandler::new())).unwrap();

    coordinator.start().await.unwrap();

    broker.set_available(false);
    assert!(coordinator.send_batch(5).await.is_err());
    assert_eq!(
        coordinator.status().producer_state,
        ComponentState::Degraded
    );

    broker.set_available(true);
    let result = coordinator.send_batch(5).await.unwrap();
    assert_eq!(result.acked_count, 5);
    assert_eq!(
        coordinator.status().producer_state,
        ComponentState::Running
    );

    coordinator.stop().await;
}
