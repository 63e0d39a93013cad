/// Resilient store client: pooled connections, retries, read cache and a background write queue
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{IngestError, Result};
use crate::store::backend::{BackendFactory, StoreBackend};
use crate::store::cache::ResponseCache;
use crate::store::pool::{ConnectionPool, HealthPolicy};
use crate::store::write_queue::{PendingWrite, WriteQueue};
use crate::types::StoreConfig;

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub cache_hits: u64,
    pub stale_hits: u64,
    pub queue_len: usize,
    pub dropped_writes: u64,
    pub reconnects: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    cache_hits: AtomicU64,
    stale_hits: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    attempts: u32,
    wait_cooldown: bool,
}

pub struct StoreClient {
    config: StoreConfig,
    pool: Arc<ConnectionPool>,
    cache: ResponseCache,
    queue: WriteQueue,
    cooldowns: Mutex<HashMap<String, Instant>>,
    consecutive_failures: AtomicU32,
    counters: Counters,
    shutdown_tx: watch::Sender<bool>,
    drainer: Mutex<Option<JoinHandle<()>>>,
}

impl StoreClient {
    pub async fn new(factory: Arc<dyn BackendFactory>, config: StoreConfig) -> Result<Arc<Self>> {
        let pool = ConnectionPool::connect(
            factory,
            config.pool_size,
            HealthPolicy::from_config(&config),
        )
        .await?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(StoreClient {
            cache: ResponseCache::new(config.fresh_ttl(), config.stale_ttl()),
            queue: WriteQueue::new(config.write_queue_capacity),
            pool,
            config,
            cooldowns: Mutex::new(HashMap::new()),
            consecutive_failures: AtomicU32::new(0),
            counters: Counters::default(),
            shutdown_tx,
            drainer: Mutex::new(None),
        }))
    }

    fn read_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.config.max_retries + 1,
            wait_cooldown: false,
        }
    }

    fn write_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.config.max_retries + 1,
            wait_cooldown: true,
        }
    }

    /// Read `path`. A fresh cache hit skips the network; when the live read fails
    /// a stale cached value is served instead.
    pub async fn get(&self, path: &str, use_cache: bool) -> Result<Option<Value>> {
        if use_cache {
            if let Some(value) = self.cache.fresh(path) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(value));
            }
        }

        if let Some(remaining) = self.cooldown_remaining(path) {
            let err = IngestError::RateLimited(format!(
                "{} cooling down for {:?}",
                path, remaining
            ));
            return self.stale_or(path, use_cache, err);
        }

        let result = self
            .execute(path, self.read_policy(), |backend| {
                let path = path.to_string();
                async move { backend.get(&path).await }
            })
            .await;

        match result {
            Ok(Some(value)) => {
                self.cache.insert(path, value.clone());
                Ok(Some(value))
            }
            Ok(None) => {
                self.cache.invalidate(path);
                Ok(None)
            }
            Err(e @ (IngestError::StoreUnavailable(_) | IngestError::RateLimited(_))) => {
                self.stale_or(path, use_cache, e)
            }
            Err(e) => Err(e),
        }
    }

    fn stale_or(&self, path: &str, use_cache: bool, err: IngestError) -> Result<Option<Value>> {
        if use_cache {
            if let Some(value) = self.cache.stale(path) {
                self.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
                warn!("Serving stale value for {} ({})", path, err);
                return Ok(Some(value));
            }
        }
        Err(err)
    }

    /// Write `value` at `path`. Critical writes complete before returning;
    /// others are queued for the background drainer.
    pub async fn set(&self, path: &str, value: Value, critical: bool) -> Result<()> {
        if *self.shutdown_tx.borrow() {
            return Err(IngestError::SystemShutdown(format!("write to {} after shutdown", path)));
        }

        if !critical {
            self.cache.invalidate(path);
            self.queue.push(PendingWrite::new(path, value));
            return Ok(());
        }
        self.queue.discard(path);
        self.queue.wait_settled(path).await;

        self.execute(path, self.write_policy(), |backend| {
            let path = path.to_string();
            let value = value.clone();
            async move { backend.put(&path, &value).await }
        })
        .await?;

        self.cache.invalidate(path);
        self.cache.insert(path, value);
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.cache.invalidate(path);
        self.queue.discard(path);
        self.queue.wait_settled(path).await;
        self.execute(path, self.write_policy(), |backend| {
            let path = path.to_string();
            async move { backend.delete(&path).await }
        })
        .await
    }

    /// Immediate child keys of `path`, always read live
    pub async fn list_keys(&self, path: &str) -> Result<Vec<String>> {
        self.execute(path, self.read_policy(), |backend| {
            let path = path.to_string();
            async move { backend.list_keys(&path).await }
        })
        .await
    }

    async fn execute<T, F, Fut>(&self, path: &str, policy: RetryPolicy, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn StoreBackend>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let timeout = self.config.request_timeout();
        let mut last_error: Option<IngestError> = None;

        for attempt in 0..policy.attempts {
            if attempt > 0 {
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(self.backoff(attempt)).await;
            }

            if let Some(remaining) = self.cooldown_remaining(path) {
                if !policy.wait_cooldown {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(IngestError::RateLimited(format!(
                        "{} cooling down for {:?}",
                        path, remaining
                    )));
                }
                debug!("Waiting {:?} for rate-limit cooldown on {}", remaining, path);
                tokio::time::sleep(remaining).await;
            }

            let lease = self.pool.select();
            let outcome = match tokio::time::timeout(timeout, op(Arc::clone(&lease.backend))).await {
                Ok(outcome) => outcome,
                Err(_) => Err(IngestError::TransientNetwork(format!(
                    "{} timed out after {:?}",
                    path, timeout
                ))),
            };

            match outcome {
                Ok(value) => {
                    self.pool.record_success(&lease);
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    self.counters.successes.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(IngestError::AuthExpired(reason)) => {
                    warn!("Store auth expired on connection {}: {}", lease.slot, reason);
                    if let Err(e) = lease.backend.refresh_credentials().await {
                        warn!("Credential refresh failed: {}", e);
                    }
                    last_error = Some(IngestError::AuthExpired(reason));
                }
                Err(IngestError::RateLimited(reason)) => {
                    self.start_cooldown(path);
                    if !policy.wait_cooldown {
                        self.counters.failures.fetch_add(1, Ordering::Relaxed);
                        return Err(IngestError::RateLimited(reason));
                    }
                    last_error = Some(IngestError::RateLimited(reason));
                }
                Err(e) if e.is_retryable() => {
                    debug!(
                        "Store request {} failed on connection {} (attempt {}/{}): {}",
                        path,
                        lease.slot,
                        attempt + 1,
                        policy.attempts,
                        e
                    );
                    self.pool.record_failure(&lease);
                    self.note_connection_failure();
                    last_error = Some(e);
                }
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }

        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        let reason = last_error.map_or_else(|| "no attempts made".to_string(), |e| e.to_string());
        Err(IngestError::StoreUnavailable(format!(
            "{} failed after {} attempts: {}",
            path, policy.attempts, reason
        )))
    }

    /// Exponential backoff with up to 25% jitter, capped at the max delay
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_base_delay_ms;
        let max = self.config.retry_max_delay_ms;
        let exp = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(16)).min(max);
        let jitter = if exp >= 4 {
            rand::rng().random_range(0..=exp / 4)
        } else {
            0
        };
        Duration::from_millis((exp + jitter).min(max))
    }

    fn note_connection_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.config.consecutive_failure_threshold {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            warn!(
                "{} consecutive store failures, reconnecting connection pool",
                failures
            );
            self.pool.trigger_reconnect();
        }
    }

    fn start_cooldown(&self, path: &str) {
        let cooldown = self.config.rate_limit_cooldown();
        warn!("Store rate limited on {}, cooling down for {:?}", path, cooldown);
        self.cooldowns
            .lock()
            .insert(path.to_string(), Instant::now() + cooldown);
    }

    fn cooldown_remaining(&self, path: &str) -> Option<Duration> {
        let mut cooldowns = self.cooldowns.lock();
        let until = *cooldowns.get(path)?;
        let now = Instant::now();
        if until <= now {
            cooldowns.remove(path);
            return None;
        }
        Some(until - now)
    }

    /// Spawn the write-queue drainer; calling twice is a no-op
    pub fn start(self: &Arc<Self>) {
        let mut drainer = self.drainer.lock();
        if drainer.is_some() {
            return;
        }

        let client = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *drainer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.config.drain_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!("Store write drainer started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = client.queue.notified() => {}
                    _ = shutdown_rx.changed() => break,
                }
                client.drain_once(false).await;
            }

            let remaining = client.flush().await;
            info!("Store write drainer stopped ({} writes left unflushed)", remaining);
        }));
    }

    /// Stop accepting writes, flush the queue and stop the drainer
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }

        let handle = self.drainer.lock().take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!("Store write drainer task failed: {}", e);
                }
            }
            None => {
                self.flush().await;
            }
        }
    }

    /// Drain until the queue is empty or the flush budget runs out; returns writes left behind
    async fn flush(&self) -> usize {
        let budget = self.config.request_timeout() * self.config.max_write_attempts.max(1);
        let deadline = Instant::now() + budget;

        while !self.queue.is_empty() && Instant::now() < deadline {
            self.drain_once(true).await;
        }

        let remaining = self.queue.len();
        if remaining > 0 {
            warn!("Dropping {} queued writes at shutdown", remaining);
        }
        remaining
    }

    /// Write one batch from the queue; failed writes go back until they run out of attempts.
    /// Writes superseded by a direct write or delete are dropped.
    async fn drain_once(&self, flushing: bool) -> usize {
        let batch = self.queue.take_batch(self.config.write_batch_size);
        if batch.is_empty() {
            return 0;
        }
        let paths: Vec<String> = batch.iter().map(|w| w.path.clone()).collect();

        let single = RetryPolicy {
            attempts: 1,
            wait_cooldown: false,
        };

        let (deferred, batch): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .filter(|w| !self.queue.is_superseded(&w.path))
            .partition(|w| !flushing && self.cooldown_remaining(&w.path).is_some());

        let sends: Vec<BoxFuture<'_, Result<()>>> = batch
            .iter()
            .map(|write| {
                self.execute(&write.path, single, |backend| {
                    let path = write.path.clone();
                    let value = write.value.clone();
                    async move { backend.put(&path, &value).await }
                })
                .boxed()
            })
            .collect();
        let results = join_all(sends).await;

        let mut written = 0;
        let mut retry = deferred;
        for (mut write, result) in batch.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    written += 1;
                    if !self.queue.contains(&write.path) && !self.queue.is_superseded(&write.path) {
                        self.cache.insert(&write.path, write.value);
                    }
                }
                Err(e) => {
                    write.attempts += 1;
                    if write.attempts >= self.config.max_write_attempts {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "Dropping queued write to {} after {} attempts ({:?} since queued): {}",
                            write.path,
                            write.attempts,
                            write.enqueued_at.elapsed(),
                            e
                        );
                    } else {
                        retry.push(write);
                    }
                }
            }
        }

        self.queue.settle(&paths, retry);
        written
    }

    /// Evict cache entries past the stale TTL
    pub fn purge_cache(&self) -> usize {
        let purged = self.cache.purge_expired();
        if purged > 0 {
            debug!("Purged {} expired cache entries", purged);
        }
        purged
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            successes: self.counters.successes.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            stale_hits: self.counters.stale_hits.load(Ordering::Relaxed),
            queue_len: self.queue.len(),
            dropped_writes: self.counters.dropped.load(Ordering::Relaxed) + self.queue.dropped(),
            reconnects: self.pool.reconnect_count(),
        }
    }
}
