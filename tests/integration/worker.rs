use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::broadcast;

use feedcast_services::{
    ItemState, QueueConsumer, ResultCache, TaskOutcome, WatchEvent, WorkItem, WorkQueue, Worker,
};

use crate::*;

const DEDUP: Duration = Duration::from_secs(10);

// ══════════════════════════════════════════════════════════════════════════════
//  Redelivery
// ══════════════════════════════════════════════════════════════════════════════

/// The same item processed twice leaves the last attempt's result, and a
/// reader only ever sees whole payloads.
#[tokio::test(start_paused = true)]
async fn redelivered_item_overwrites_with_the_last_attempt() {
    let cluster = Cluster::new(DEDUP);
    let (fp, payload) = extract_task("https://example.com/news");

    let executor = ScriptedExecutor::new(Duration::ZERO, |req, _| {
        let body = serde_json::json!({
            "attempt": req.attempt,
            "items": vec!["entry"; 256],
        });
        TaskOutcome::Completed(Bytes::from(body.to_string()))
    });
    let (_tx, rx) = broadcast::channel(1);
    let worker = Worker::new(
        "w0",
        Arc::new(cluster.queue.consumer("worker").await),
        Arc::new(cluster.cache.clone()),
        executor.clone(),
        rx,
    );

    let mut watch = cluster.cache.watch(&fp).await.unwrap();
    assert_eq!(watch.next().await, Some(WatchEvent::Live));

    cluster
        .queue
        .publish(WorkItem {
            fingerprint: fp.clone(),
            payload,
        })
        .await
        .unwrap();

    // First worker takes the item and stalls past the ack wait.
    let stalled = cluster.queue.consumer("worker").await;
    let first = stalled.next().await.unwrap();
    tokio::time::advance(Duration::from_secs(31)).await;
    let second = stalled.next().await.unwrap();
    assert_eq!(second.seq, first.seq);
    assert_eq!(second.attempt, 2);

    assert_eq!(worker.process(first).await, ItemState::Completed);
    assert_eq!(worker.process(second).await, ItemState::Completed);

    let mut seen = Vec::new();
    for _ in 0..2 {
        match watch.next().await {
            Some(WatchEvent::Entry(entry)) => {
                let v: serde_json::Value = serde_json::from_slice(&entry.payload).unwrap();
                assert_eq!(v["items"].as_array().unwrap().len(), 256);
                seen.push(v["attempt"].as_u64().unwrap());
            }
            other => panic!("expected a write, got {other:?}"),
        }
    }
    assert_eq!(seen, vec![1, 2]);

    let last: serde_json::Value =
        serde_json::from_slice(&cluster.cache.get(&fp).await.unwrap().payload).unwrap();
    assert_eq!(last["attempt"], 2);
    assert_eq!(executor.calls(), 2);
}

// ══════════════════════════════════════════════════════════════════════════════
//  Fault isolation
// ══════════════════════════════════════════════════════════════════════════════

/// A task that panics the executor is terminated; the next one is served.
#[tokio::test(start_paused = true)]
async fn panic_on_one_task_does_not_stop_the_worker() {
    let cluster = Cluster::new(DEDUP);
    let executor = ScriptedExecutor::new(Duration::from_millis(100), |req, _| {
        if req.task.url.contains("crash") {
            panic!("renderer crashed on {}", req.task.url);
        }
        TaskOutcome::Completed(Bytes::from_static(br#"{"title":"B"}"#))
    });
    let handle = cluster.spawn_worker("w0", executor.clone()).await;

    let (fp_a, payload_a) = extract_task("https://example.com/crash");
    let (fp_b, payload_b) = extract_task("https://example.com/fine");

    let caller_a = cluster.fetch(Duration::from_secs(20), &fp_a, payload_a);
    cluster.until_waiting(&fp_a, 1).await;
    let caller_b = cluster.fetch(Duration::from_secs(20), &fp_b, payload_b);

    assert_eq!(
        caller_b.await.unwrap().unwrap(),
        Bytes::from_static(br#"{"title":"B"}"#)
    );
    let err = caller_a.await.unwrap().unwrap_err();
    assert!(matches!(err, feedcast_services::FetchError::DeadlineExceeded { stale: None, .. }));

    // A was terminated, not left for redelivery.
    let stats = cluster.queue.stats().await;
    assert_eq!(stats.pending + stats.in_flight, 0);
    assert_eq!(stats.redelivered, 0);
    assert_eq!(executor.calls(), 2);
    assert!(!handle.is_finished());

    cluster.shutdown.send(()).unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(cluster.queue.stats().await.consumers, 0);
}

/// Shutdown lets the item in hand finish before the worker leaves.
#[tokio::test(start_paused = true)]
async fn shutdown_finishes_the_current_item() {
    let cluster = Cluster::new(DEDUP);
    let executor = ScriptedExecutor::constant(Duration::from_secs(5), r#"{"title":"late"}"#);
    let handle = cluster.spawn_worker("w0", executor.clone()).await;

    let (fp, payload) = extract_task("https://example.com/slow");
    let caller = cluster.fetch(Duration::from_secs(20), &fp, payload);
    while executor.calls() == 0 {
        tokio::task::yield_now().await;
    }

    cluster.shutdown.send(()).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(
        caller.await.unwrap().unwrap(),
        Bytes::from_static(br#"{"title":"late"}"#)
    );
    assert_eq!(cluster.queue.stats().await.consumers, 0);
}
