//! Coordinator lifecycle tests: start retries, idempotent start, lost
//! subscriptions and graceful shutdown.

use std::time::Duration;

use tokio::time::Instant;

use kafka_relay_core::testing::TestHarnessBuilder;
use kafka_relay_core::{ComponentState, RelayError};

#[tokio::test]
async fn test_start_is_idempotent() {
    let harness = TestHarnessBuilder::new().build();

    let first = harness.start().await.unwrap();
    let second = harness.start().await.unwrap();

    assert_eq!(first.producer_state, ComponentState::Running);
    assert_eq!(first, second);
    assert_eq!(harness.client.connect_attempts(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_start_retries_unavailable_broker() {
    let harness = TestHarnessBuilder::new().max_attempts(3).build();
    harness.client.connect_failures(2);

    let status = harness.start().await.unwrap();

    assert_eq!(status.producer_state, ComponentState::Running);
    assert_eq!(harness.client.connect_attempts(), 3);
    let metrics = harness.coordinator.metrics().encode().unwrap();
    assert!(metrics.contains("operation=\"connect\"} 2"));

    harness.stop().await;
}

#[tokio::test]
async fn test_start_failure_leaves_degraded_and_can_be_retried() {
    let harness = TestHarnessBuilder::new().max_attempts(3).build();
    harness.client.connect_failures(4);

    let err = harness.start().await.unwrap_err();
    assert!(matches!(err, RelayError::BrokerUnavailable { .. }));

    let status = harness.coordinator.status();
    assert_eq!(status.producer_state, ComponentState::Degraded);
    assert_eq!(status.consumer_state, ComponentState::Degraded);
    assert_eq!(status.last_error, Some(err));
    assert!(matches!(
        harness.coordinator.send_batch(1).await,
        Err(RelayError::NotRunning)
    ));

    // One injected failure remains; the retry absorbs it.
    let status = harness.start().await.unwrap();
    assert_eq!(status.producer_state, ComponentState::Running);
    assert_eq!(status.consumer_state, ComponentState::Running);
    assert_eq!(harness.client.connect_attempts(), 5);

    harness.stop().await;
}

/// stop() with 10 sends still pending returns within the grace period and
/// reports all 10 sequences as cancelled.
#[tokio::test(start_paused = true)]
async fn test_stop_with_pending_sends_reports_cancelled() {
    let harness = TestHarnessBuilder::new()
        .consumer_enabled(false)
        .grace_period_ms(2_000)
        .build();
    harness.client.hold_all();
    harness.start().await.unwrap();

    let coordinator = harness.coordinator.clone();
    let send = tokio::spawn(async move { coordinator.send_batch(10).await });
    harness.client.wait_for_published(10).await;

    let started = Instant::now();
    harness.stop().await;
    assert!(started.elapsed() <= Duration::from_millis(2_100));

    let result = send.await.unwrap().unwrap();
    assert!(result.cancelled);
    assert_eq!(result.acked_count, 0);
    assert_eq!(result.cancelled_sequences, (1..=10).collect::<Vec<_>>());

    let status = harness.coordinator.status();
    assert_eq!(status.producer_state, ComponentState::Stopped);
    assert!(harness.client.is_closed());
}

/// Outcomes that arrive during the grace period are still recorded.
#[tokio::test]
async fn test_stop_drains_in_flight_outcomes() {
    let harness = TestHarnessBuilder::new().consumer_enabled(false).build();
    harness.client.set_ack_delay(Duration::from_millis(50));
    harness.start().await.unwrap();

    let coordinator = harness.coordinator.clone();
    let send = tokio::spawn(async move { coordinator.send_batch(5).await });
    harness.client.wait_for_published(5).await;

    harness.stop().await;

    let result = send.await.unwrap().unwrap();
    assert!(result.cancelled);
    assert_eq!(harness.coordinator.status().stats.total_acked, 5);
}

#[tokio::test]
async fn test_stop_before_start_is_harmless() {
    let harness = TestHarnessBuilder::new().build();
    harness.stop().await;

    let status = harness.coordinator.status();
    assert_eq!(status.producer_state, ComponentState::Stopped);
    assert_eq!(status.consumer_state, ComponentState::Stopped);

    harness.start().await.unwrap();
    harness.stop().await;
}

#[tokio::test]
async fn test_send_after_stop_is_rejected() {
    let harness = TestHarnessBuilder::new().build();
    harness.start().await.unwrap();
    harness.stop().await;

    assert!(matches!(
        harness.coordinator.send_batch(1).await,
        Err(RelayError::NotRunning)
    ));
}

/// A subscription the broker closes leaves the consumer degraded with the
/// reason recorded, and the producer untouched.
#[tokio::test]
async fn test_closed_subscription_degrades_consumer() {
    let harness = TestHarnessBuilder::new().build();
    harness.start().await.unwrap();

    harness.client.close_subscription();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = harness.coordinator.status();
    assert_eq!(status.consumer_state, ComponentState::Degraded);
    assert_eq!(status.producer_state, ComponentState::Running);
    assert!(matches!(
        status.last_error,
        Some(RelayError::Subscription { .. })
    ));

    harness.stop().await;
    assert_eq!(
        harness.coordinator.status().consumer_state,
        ComponentState::Stopped
    );
}

/// A subscription error ends the receive loop instead of being retried in
/// place.
#[tokio::test]
async fn test_subscription_error_degrades_consumer() {
    let harness = TestHarnessBuilder::new().build();
    harness.start().await.unwrap();

    harness.client.fail_subscription("connection reset by peer");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = harness.coordinator.status();
    assert_eq!(status.consumer_state, ComponentState::Degraded);
    assert!(matches!(
        status.last_error,
        Some(RelayError::BrokerUnavailable { .. })
    ));

    harness.stop().await;
}

/// start() on a running relay resubscribes a degraded consumer, which picks
/// up where its commit point left off.
#[tokio::test]
async fn test_start_resubscribes_degraded_consumer() {
    let harness = TestHarnessBuilder::new().build();
    harness.start().await.unwrap();

    harness.coordinator.send_batch(3).await.unwrap();
    assert!(harness.wait_for_commit(3).await);

    harness.client.close_subscription();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        harness.coordinator.status().consumer_state,
        ComponentState::Degraded
    );

    // Published while nothing is subscribed; delivered on resubscribe.
    harness.coordinator.send_batch(2).await.unwrap();

    let status = harness.start().await.unwrap();
    assert_eq!(status.consumer_state, ComponentState::Running);
    assert_eq!(harness.client.connect_attempts(), 1);

    assert!(harness.wait_for_commit(5).await);
    assert_eq!(harness.handler.sequences(), vec![1, 2, 3, 4, 5]);

    harness.stop().await;
}
