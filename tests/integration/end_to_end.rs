use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use tower::ServiceExt;

use feedcast_api::ApiState;
use feedcast_core::config::ApiConfig;
use feedcast_services::{QueueConsumer, ResultCache};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Coordinator ↔ queue ↔ worker ↔ cache
// ══════════════════════════════════════════════════════════════════════════════

/// freshness 20s, dedup 10s, empty cache; the worker answers after 2s and
/// every caller that arrived in the meantime gets that answer.
#[tokio::test(start_paused = true)]
async fn callers_arriving_during_the_computation_share_its_result() {
    let cluster = Cluster::new(Duration::from_secs(10));
    let fp = Fingerprint::new("extract_abcd");
    let payload = Bytes::from_static(b"{\"opaque\":true}");

    {
        let queue = cluster.queue.clone();
        let cache = cluster.cache.clone();
        tokio::spawn(async move {
            let consumer = queue.consumer("worker").await;
            while let Ok(delivery) = consumer.next().await {
                tokio::time::sleep(Duration::from_secs(2)).await;
                delivery.ack().await.unwrap();
                cache
                    .put(&delivery.item.fingerprint, Bytes::from_static(br#"{"title":"X"}"#))
                    .await
                    .unwrap();
            }
        });
    }

    let mut callers = vec![cluster.fetch(Duration::from_secs(20), &fp, payload.clone())];
    tokio::time::sleep(Duration::from_secs(1)).await;
    callers.push(cluster.fetch(Duration::from_secs(20), &fp, payload.clone()));
    tokio::time::sleep(Duration::from_millis(500)).await;
    callers.push(cluster.fetch(Duration::from_secs(20), &fp, payload));

    for caller in callers {
        assert_eq!(caller.await.unwrap().unwrap(), Bytes::from_static(br#"{"title":"X"}"#));
    }

    let stats = cluster.queue.stats().await;
    assert_eq!(stats.published, 1);
    let entry = cluster.cache.get(&fp).await.unwrap();
    let written_after = entry.written_at - START_MS;
    assert!(
        (2_000..2_050).contains(&written_after),
        "written {written_after}ms after start"
    );
}

// ══════════════════════════════════════════════════════════════════════════════
//  Through the HTTP surface
// ══════════════════════════════════════════════════════════════════════════════

fn render_request(url: &str) -> Request<Body> {
    let body = serde_json::json!({
        "task": {
            "kind": "extract",
            "url": url,
            "selectors": { "post": "article", "title": "h1", "link": "a" }
        },
        "lifetime_secs": 300
    });
    Request::builder()
        .method("POST")
        .uri("/api/render")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn concurrent_http_requests_render_once() {
    let cluster = Cluster::new(Duration::from_secs(10));
    let executor = ScriptedExecutor::constant(Duration::from_secs(2), r#"{"title":"X","items":[]}"#);
    cluster.spawn_worker("w0", executor.clone()).await;

    let state = ApiState::new(
        &ApiConfig::default(),
        cluster.queue.clone(),
        cluster.cache.clone(),
        cluster.shutdown.clone(),
    );
    let app = feedcast_api::router(state);

    let requests: Vec<_> = (0..4)
        .map(|_| {
            let app = app.clone();
            tokio::spawn(async move { app.oneshot(render_request("https://example.com/news")).await })
        })
        .collect();

    let (expected_fp, _) = extract_task("https://example.com/news");
    for request in requests {
        let resp = request.await.unwrap().unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()["x-feedcast-fingerprint"].to_str().unwrap(),
            expected_fp.as_str()
        );
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"title":"X","items":[]}"#);
    }
    assert_eq!(executor.calls(), 1);

    // Served from the cache on the next request.
    let resp = app
        .oneshot(render_request("https://example.com/news"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(executor.calls(), 1);
    assert_eq!(cluster.queue.stats().await.published, 1);
}
