//! feedcastd — render coordinator daemon.
//!
//! One process hosts the broker, a pool of workers consuming from it, and
//! the HTTP API that admits work through the coordinator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use feedcast_api::ApiState;
use feedcast_core::config::FeedcastConfig;
use feedcast_core::{Clock, SystemClock};
use feedcast_services::{
    CommandExecutor, MemoryResultCache, MemoryWorkQueue, QueueSettings, TaskExecutor, Worker,
};

const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    match FeedcastConfig::write_default_if_missing() {
        Ok(path) => tracing::debug!(path = %path.display(), "config file"),
        Err(e) => tracing::warn!(error = %e, "failed to write default config"),
    }
    let config = FeedcastConfig::load().context("failed to load config")?;

    if config.broker.dedup_window() < config.api.task_timeout() {
        tracing::warn!(
            dedup_window_secs = config.broker.dedup_window_secs,
            task_timeout_secs = config.api.task_timeout_secs,
            "dedup window is shorter than the task timeout; slow renders may run twice"
        );
    }

    // ── Broker ───────────────────────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let queue = MemoryWorkQueue::new(QueueSettings::from(&config.broker));
    let cache = MemoryResultCache::with_clock(&config.broker.cache_bucket, clock);
    tracing::info!(
        subject_prefix = %config.broker.subject_prefix,
        bucket = %config.broker.cache_bucket,
        dedup_window_secs = config.broker.dedup_window_secs,
        "broker ready"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Workers ──────────────────────────────────────────────────────────────
    let executor: Arc<dyn TaskExecutor> = Arc::new(CommandExecutor::from_config(&config.worker));
    let concurrency = config.worker.effective_concurrency();
    let mut workers = Vec::with_capacity(concurrency);
    for i in 0..concurrency {
        let consumer = queue.consumer(&config.broker.durable_name).await;
        let worker = Worker::new(
            format!("{}-{}", config.broker.durable_name, i),
            Arc::new(consumer),
            Arc::new(cache.clone()),
            executor.clone(),
            shutdown_tx.subscribe(),
        );
        workers.push(tokio::spawn(worker.run()));
    }
    tracing::info!(
        workers = concurrency,
        command = %config.worker.command,
        "worker pool started"
    );

    // ── API ──────────────────────────────────────────────────────────────────
    let state = ApiState::new(&config.api, queue.clone(), cache.clone(), shutdown_tx.clone());
    let api_task = {
        let listen_addr = config.api.listen_addr.clone();
        let port = config.api.port;
        tokio::spawn(async move { feedcast_api::serve(state, &listen_addr, port).await })
    };

    let stats_printer = tokio::spawn(print_stats(queue.clone(), cache.clone()));

    // ── Wait for exit ────────────────────────────────────────────────────────
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = api_task           => {
            tracing::error!("API exited: {:?}", r);
            let _ = shutdown_tx.send(());
        }
    }

    // Workers finish the item they hold, then deregister.
    for (i, handle) in workers.into_iter().enumerate() {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(worker = i, error = %e, "worker failed"),
            Err(e) => tracing::warn!(worker = i, error = %e, "worker task panicked"),
        }
    }
    stats_printer.abort();

    let stats = queue.stats().await;
    tracing::info!(
        pending = stats.pending,
        published = stats.published,
        "feedcastd stopped"
    );
    Ok(())
}

async fn print_stats(queue: MemoryWorkQueue, cache: MemoryResultCache) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let stats = queue.stats().await;
        tracing::info!(
            pending = stats.pending,
            in_flight = stats.in_flight,
            consumers = stats.consumers,
            published = stats.published,
            duplicates = stats.duplicates,
            redelivered = stats.redelivered,
            dead_lettered = stats.dead_lettered,
            cache_entries = cache.len(),
            "broker stats"
        );
    }
}
