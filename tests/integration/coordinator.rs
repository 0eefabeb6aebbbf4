use std::time::Duration;

use bytes::Bytes;
use feedcast_services::{FetchError, Interrupt, ResultCache};

use crate::*;

const DEDUP: Duration = Duration::from_secs(10);

// ══════════════════════════════════════════════════════════════════════════════
//  Single flight
// ══════════════════════════════════════════════════════════════════════════════

/// N callers on an empty cache: one publish, one execution, one answer for all.
#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_one_computation() {
    let cluster = Cluster::new(DEDUP);
    let executor = ScriptedExecutor::constant(Duration::from_secs(2), r#"{"title":"X"}"#);
    cluster.spawn_worker("w0", executor.clone()).await;
    cluster.spawn_worker("w1", executor.clone()).await;

    let (fp, payload) = extract_task("https://example.com/news");
    let callers: Vec<_> = (0..16)
        .map(|_| cluster.fetch(Duration::from_secs(20), &fp, payload.clone()))
        .collect();

    for caller in callers {
        assert_eq!(caller.await.unwrap().unwrap(), Bytes::from_static(br#"{"title":"X"}"#));
    }
    let stats = cluster.queue.stats().await;
    assert_eq!(stats.published, 1);
    assert_eq!(executor.calls(), 1);
    assert_eq!(cluster.coordinator.inflight_count(), 0);
}

// ══════════════════════════════════════════════════════════════════════════════
//  Freshness
// ══════════════════════════════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn entry_is_fresh_up_to_the_window_and_recomputed_after() {
    let cluster = Cluster::new(DEDUP);
    let executor = ScriptedExecutor::constant(Duration::from_millis(500), "\"P2\"");
    cluster.spawn_worker("w0", executor.clone()).await;

    let (fp, payload) = extract_task("https://example.com/news");
    cluster.cache.put(&fp, Bytes::from_static(b"\"P1\"")).await.unwrap();

    tokio::time::advance(Duration::from_millis(19_999)).await;
    let got = cluster
        .fetch(Duration::from_secs(20), &fp, payload.clone())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, Bytes::from_static(b"\"P1\""));
    assert_eq!(cluster.queue.stats().await.published, 0);

    tokio::time::advance(Duration::from_millis(2)).await;
    let got = cluster
        .fetch(Duration::from_secs(20), &fp, payload)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, Bytes::from_static(b"\"P2\""));
    assert_eq!(cluster.queue.stats().await.published, 1);
    assert_eq!(executor.calls(), 1);
}

/// A caller asking for 2s freshness right after a computation finished must
/// be served, not left waiting on a publish the dedup window swallows.
#[tokio::test(start_paused = true)]
async fn short_freshness_is_clamped_to_the_dedup_window() {
    let cluster = Cluster::new(DEDUP);
    let executor = ScriptedExecutor::new(Duration::from_secs(1), |_, call| {
        TaskOutcome::Completed(Bytes::from(format!("{{\"run\":{call}}}")))
    });
    cluster.spawn_worker("w0", executor.clone()).await;

    let (fp, payload) = extract_task("https://example.com/news");
    let first = cluster
        .fetch(Duration::from_secs(20), &fp, payload.clone())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, Bytes::from_static(br#"{"run":1}"#));

    // 5s old: stale for a 2s request, but inside the 10s dedup window that
    // would collapse a second publish.
    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(cluster.coordinator.effective_window(Duration::from_secs(2)), DEDUP);
    let second = cluster
        .fetch(Duration::from_secs(2), &fp, payload.clone())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second, first);
    assert_eq!(cluster.queue.stats().await.published, 1);

    // Past the dedup window the same request recomputes.
    tokio::time::advance(Duration::from_secs(7)).await;
    let third = cluster
        .fetch(Duration::from_secs(2), &fp, payload)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(third, Bytes::from_static(br#"{"run":2}"#));
    assert_eq!(cluster.queue.stats().await.published, 2);
}

// ══════════════════════════════════════════════════════════════════════════════
//  Races
// ══════════════════════════════════════════════════════════════════════════════

/// A write landing anywhere after the watch opened is seen by the caller.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_after_watch_is_never_lost() {
    let cluster = Cluster::new(DEDUP);
    for i in 0..50u32 {
        let (fp, payload) = extract_task(&format!("https://example.com/{i}"));
        let caller = cluster.fetch(Duration::from_secs(20), &fp, payload);
        cluster.until_waiting(&fp, 1).await;
        for _ in 0..(i % 4) {
            tokio::task::yield_now().await;
        }
        let body = Bytes::from(format!("{{\"n\":{i}}}"));
        cluster.cache.put(&fp, body.clone()).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(5), caller)
            .await
            .expect("caller missed the write")
            .unwrap()
            .unwrap();
        assert_eq!(got, body);
    }
}

/// Cancelling a caller leaves the computation running for everyone else.
#[tokio::test(start_paused = true)]
async fn cancelled_caller_does_not_cancel_the_computation() {
    let cluster = Cluster::new(DEDUP);
    let executor = ScriptedExecutor::constant(Duration::from_secs(3), r#"{"title":"X"}"#);
    cluster.spawn_worker("w0", executor.clone()).await;

    let (fp, payload) = extract_task("https://example.com/news");
    let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();
    let coordinator = cluster.coordinator.clone();
    let caller = {
        let fp = fp.clone();
        let payload = payload.clone();
        tokio::spawn(async move {
            let interrupt = async move {
                let _ = cancel_rx.await;
                Interrupt::Cancelled
            };
            coordinator
                .fetch_or_compute_until(interrupt, Duration::from_secs(20), &fp, payload)
                .await
        })
    };

    cluster.until_waiting(&fp, 1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel_tx.send(()).unwrap();
    let err = caller.await.unwrap().unwrap_err();
    assert!(matches!(err, FetchError::Cancelled { stale: None, .. }));
    assert_eq!(cluster.cache.watcher_count(&fp), 0);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let entry = cluster.cache.get(&fp).await.unwrap();
    assert_eq!(entry.payload, Bytes::from_static(br#"{"title":"X"}"#));

    // A later caller is served from the cache.
    let got = cluster
        .fetch(Duration::from_secs(20), &fp, payload)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, entry.payload);
    assert_eq!(executor.calls(), 1);
}

/// Deadline with only a stale value seen: the stale value comes back with the error.
#[tokio::test(start_paused = true)]
async fn deadline_hands_back_the_stale_value() {
    let cluster = Cluster::new(DEDUP);
    let (fp, payload) = extract_task("https://example.com/news");
    cluster.cache.put(&fp, Bytes::from_static(b"\"old\"")).await.unwrap();
    tokio::time::advance(Duration::from_secs(3600)).await;

    // No workers: nothing will ever answer.
    let err = cluster
        .fetch(Duration::from_secs(20), &fp, payload)
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, FetchError::DeadlineExceeded { .. }));
    assert_eq!(err.into_stale().unwrap().payload, Bytes::from_static(b"\"old\""));
}
