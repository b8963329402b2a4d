//! End-to-end dispatch behaviour over the in-memory queue, in virtual time.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use gapless_common::error::AppError;
use gapless_common::types::{DeliveryResult, FailureReason};
use gapless_decoders::JsonEnvelopeDecoder;
use gapless_notifier::queue::QueueDepth;
use gapless_notifier::{
    Counts, DeadLetterKind, InMemoryQueue, MemoryDeadLetterSink, ResultTracker, WorkerPool,
};

use common::{FailingSink, Harness, ScriptedClient, dispatch_config, envelope};

// ═══════════════════════════════════════════════════════════════════
//  Retry and dead-letter outcomes
// ═══════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn test_always_transient_dead_letters_after_max_retries() {
    let harness = Harness::start(
        dispatch_config(1, 3),
        ScriptedClient::always(DeliveryResult::TransientFailure(FailureReason::Throttled)),
    );
    harness.queue.push(envelope(5));

    harness
        .wait_until(|h| h.tracker.totals().dead_lettered == 1)
        .await;

    assert_eq!(
        harness.tracker.totals(),
        Counts {
            delivered: 0,
            retried: 3,
            dead_lettered: 1,
        }
    );
    assert_eq!(harness.client.calls(), vec![5, 5, 5, 5]);

    let entries = harness.dead_letters.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, DeadLetterKind::RetriesExhausted);
    assert_eq!(entries[0].identifier, Some(5));
    assert_eq!(entries[0].attempts, 3);

    assert_eq!(harness.queue.depth(), QueueDepth::default());
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_is_never_requeued() {
    let harness = Harness::start(
        dispatch_config(2, 5),
        ScriptedClient::always(DeliveryResult::PermanentFailure(FailureReason::InvalidToken(
            "Unregistered".into(),
        ))),
    );
    harness.queue.push(envelope(7));

    harness
        .wait_until(|h| h.tracker.totals().dead_lettered == 1)
        .await;
    // Give a requeued copy every chance to show up.
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(harness.client.calls(), vec![7]);
    assert_eq!(harness.tracker.totals().retried, 0);

    let entries = harness.dead_letters.entries();
    assert_eq!(entries[0].kind, DeadLetterKind::Permanent);
    assert_eq!(entries[0].attempts, 0);
    assert!(entries[0].reason.contains("Unregistered"));

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_then_success() {
    let failures = AtomicU32::new(0);
    let harness = Harness::start(
        dispatch_config(1, 5),
        ScriptedClient::new(move |_| {
            if failures.fetch_add(1, Ordering::SeqCst) < 2 {
                DeliveryResult::TransientFailure(FailureReason::ProviderUnavailable("503".into()))
            } else {
                DeliveryResult::Success
            }
        }),
    );
    harness.queue.push(envelope(9));

    harness
        .wait_until(|h| h.tracker.totals().delivered == 1)
        .await;

    assert_eq!(
        harness.tracker.totals(),
        Counts {
            delivered: 1,
            retried: 2,
            dead_lettered: 0,
        }
    );
    assert!(harness.dead_letters.entries().is_empty());
    assert_eq!(harness.queue.depth(), QueueDepth::default());
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_retry_waits_for_backoff() {
    let harness = Harness::start(
        dispatch_config(1, 1),
        ScriptedClient::always(DeliveryResult::TransientFailure(FailureReason::Timeout)),
    );
    harness.queue.push(envelope(3));

    harness.wait_until(|h| h.tracker.totals().retried == 1).await;
    assert_eq!(harness.client.calls().len(), 1);
    assert_eq!(harness.queue.depth().delayed, 1);

    // Base backoff is 100ms; the second attempt comes only after it.
    harness
        .wait_until(|h| h.tracker.totals().dead_lettered == 1)
        .await;
    assert_eq!(harness.client.calls().len(), 2);
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_delivery_times_out_and_retries() {
    let harness = Harness::start(
        dispatch_config(1, 1),
        ScriptedClient::always(DeliveryResult::Success).with_delay(Duration::from_secs(5)),
    );
    harness.queue.push(envelope(11));

    harness
        .wait_until(|h| h.tracker.totals().dead_lettered == 1)
        .await;

    assert_eq!(harness.tracker.totals().retried, 1);
    assert_eq!(harness.tracker.totals().delivered, 0);
    let entries = harness.dead_letters.entries();
    assert!(entries[0].reason.contains("timed out"), "{}", entries[0].reason);
    harness.stop().await;
}

// ═══════════════════════════════════════════════════════════════════
//  Undecodable envelopes
// ═══════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn test_decode_error_dead_lettered_without_delivery() {
    let harness = Harness::start(
        dispatch_config(1, 3),
        ScriptedClient::always(DeliveryResult::Success),
    );
    harness.queue.push("not json at all");
    harness.queue.push(r#"{"token": "abcd", "identifier": 1}"#);
    harness.queue.push(envelope(1));

    harness
        .wait_until(|h| {
            let totals = h.tracker.totals();
            totals.dead_lettered == 2 && totals.delivered == 1
        })
        .await;

    assert_eq!(harness.client.calls(), vec![1]);
    assert_eq!(harness.tracker.totals().retried, 0);

    let entries = harness.dead_letters.entries();
    assert!(entries.iter().all(|e| e.kind == DeadLetterKind::Decode));
    assert!(entries.iter().all(|e| e.identifier.is_none()));
    assert_eq!(entries[0].body, "not json at all");
    assert!(entries[0].reason.starts_with("malformed envelope"));
    assert!(entries[1].reason.starts_with("schema mismatch"));
    harness.stop().await;
}

// ═══════════════════════════════════════════════════════════════════
//  Concurrency and shutdown
// ═══════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn test_many_workers_deliver_each_message_once() {
    let harness = Harness::start(
        dispatch_config(4, 3),
        ScriptedClient::always(DeliveryResult::Success).with_delay(Duration::from_millis(20)),
    );
    for identifier in 1..=20 {
        harness.queue.push(envelope(identifier));
    }

    harness
        .wait_until(|h| h.tracker.totals().delivered == 20)
        .await;

    let mut calls = harness.client.calls();
    calls.sort_unstable();
    assert_eq!(calls, (1..=20).collect::<Vec<_>>());
    assert_eq!(harness.queue.depth(), QueueDepth::default());
    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_finishes_current_message() {
    let harness = Harness::start(
        dispatch_config(1, 3),
        ScriptedClient::always(DeliveryResult::Success).with_delay(Duration::from_millis(500)),
    );
    harness.queue.push(envelope(1));

    harness.wait_until(|h| h.client.calls().len() == 1).await;
    let queue = harness.queue.clone();
    let tracker = harness.tracker.clone();
    harness.stop().await;

    // The in-flight delivery completed and was acked.
    assert_eq!(tracker.totals().delivered, 1);
    assert_eq!(queue.depth(), QueueDepth::default());

    // Nothing pops after shutdown.
    queue.push(envelope(2));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(queue.depth().ready, 1);
}

#[tokio::test(start_paused = true)]
async fn test_sink_failure_leaves_message_unacked() {
    let queue = Arc::new(InMemoryQueue::new(Duration::from_secs(30)));
    let client = Arc::new(ScriptedClient::always(DeliveryResult::PermanentFailure(
        FailureReason::PayloadRejected("PayloadEmpty".into()),
    )));
    let tracker = Arc::new(ResultTracker::new(Duration::from_secs(60), 60));

    let pool = WorkerPool::new(
        dispatch_config(1, 3),
        queue.clone(),
        client.clone(),
        Arc::new(JsonEnvelopeDecoder::new()),
        Arc::new(FailingSink),
        tracker.clone(),
    )
    .unwrap();
    let shutdown = pool.shutdown_token();
    let handle = tokio::spawn(pool.run());

    queue.push(envelope(4));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(client.calls().len(), 1);
    assert_eq!(queue.depth().inflight, 1);
    assert_eq!(tracker.totals().dead_lettered, 0);

    // After the visibility timeout the message is handed out again.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(client.calls().len(), 2);

    shutdown.cancel();
    handle.await.unwrap();
}

// ═══════════════════════════════════════════════════════════════════
//  Construction
// ═══════════════════════════════════════════════════════════════════

#[test]
fn test_pool_rejects_delivery_timeout_not_shorter_than_lease() {
    let queue = Arc::new(InMemoryQueue::new(Duration::from_secs(1)));
    let client = Arc::new(ScriptedClient::always(DeliveryResult::Success));
    let tracker = Arc::new(ResultTracker::new(Duration::from_secs(60), 60));

    // dispatch_config uses a one second delivery timeout.
    let result = WorkerPool::new(
        dispatch_config(1, 3),
        queue,
        client,
        Arc::new(JsonEnvelopeDecoder::new()),
        Arc::new(MemoryDeadLetterSink::new()),
        tracker,
    );

    match result {
        Err(AppError::Config(message)) => assert!(message.contains("visibility timeout")),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("pool accepted a delivery timeout equal to the lease"),
    }
}
