/// Fixed-size connection pool with health-scored selection
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::{IngestError, Result};
use crate::store::backend::{BackendFactory, StoreBackend};
use crate::types::StoreConfig;

#[derive(Debug, Clone, Copy)]
pub struct ConnectionHealth {
    pub last_success: Instant,
    pub failure_count: u32,
}

impl ConnectionHealth {
    fn new() -> Self {
        // A fresh connection counts as having just succeeded
        ConnectionHealth {
            last_success: Instant::now(),
            failure_count: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub base_score: f64,
    pub failure_penalty: f64,
    pub degraded_failure_threshold: u32,
    pub degraded_after: Duration,
}

impl HealthPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        HealthPolicy {
            base_score: config.health_base_score,
            failure_penalty: config.failure_penalty,
            degraded_failure_threshold: config.degraded_failure_threshold,
            degraded_after: config.degraded_after(),
        }
    }

    /// BASE - seconds since last success - failures * PENALTY
    pub fn score(&self, health: &ConnectionHealth, now: Instant) -> f64 {
        let age = now.saturating_duration_since(health.last_success).as_secs_f64();
        self.base_score - age - health.failure_count as f64 * self.failure_penalty
    }

    /// No recent success and too many failures
    pub fn is_poor(&self, health: &ConnectionHealth, now: Instant) -> bool {
        now.saturating_duration_since(health.last_success) > self.degraded_after
            && health.failure_count > self.degraded_failure_threshold
    }
}

struct Slot {
    backend: Arc<dyn StoreBackend>,
    health: ConnectionHealth,
}

/// A connection handed out for one request
pub struct Lease {
    pub slot: usize,
    generation: u64,
    pub backend: Arc<dyn StoreBackend>,
}

pub struct ConnectionPool {
    factory: Arc<dyn BackendFactory>,
    slots: RwLock<Vec<Slot>>,
    policy: HealthPolicy,
    generation: AtomicU64,
    reconnecting: AtomicBool,
    reconnects: AtomicU64,
}

impl ConnectionPool {
    pub async fn connect(
        factory: Arc<dyn BackendFactory>,
        size: usize,
        policy: HealthPolicy,
    ) -> Result<Arc<Self>> {
        if size == 0 {
            return Err(IngestError::ConfigError("connection pool needs at least one slot".to_string()));
        }

        let mut slots = Vec::with_capacity(size);
        for slot in 0..size {
            slots.push(Slot {
                backend: factory.connect(slot).await?,
                health: ConnectionHealth::new(),
            });
        }

        info!("Store connection pool ready with {} connections", size);

        Ok(Arc::new(ConnectionPool {
            factory,
            slots: RwLock::new(slots),
            policy,
            generation: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
        }))
    }

    /// Highest-scoring connection; schedules a reconnect when every connection is poor
    pub fn select(self: &Arc<Self>) -> Lease {
        let now = Instant::now();
        let slots = self.slots.read();

        let mut best = 0;
        let mut best_score = f64::NEG_INFINITY;
        let mut all_poor = true;
        for (index, slot) in slots.iter().enumerate() {
            let score = self.policy.score(&slot.health, now);
            if score > best_score {
                best = index;
                best_score = score;
            }
            all_poor &= self.policy.is_poor(&slot.health, now);
        }

        let lease = Lease {
            slot: best,
            generation: self.generation.load(Ordering::SeqCst),
            backend: Arc::clone(&slots[best].backend),
        };
        drop(slots);

        if all_poor {
            warn!(
                "All {} store connections degraded, using least-bad connection {} (score {:.1})",
                self.size(),
                best,
                best_score
            );
            self.trigger_reconnect();
        }

        lease
    }

    pub fn record_success(&self, lease: &Lease) {
        self.update(lease, |health| {
            health.last_success = Instant::now();
            health.failure_count = 0;
        });
    }

    pub fn record_failure(&self, lease: &Lease) {
        self.update(lease, |health| health.failure_count += 1);
    }

    fn update(&self, lease: &Lease, apply: impl FnOnce(&mut ConnectionHealth)) {
        // Outcomes from connections replaced by a reconnect are ignored
        if lease.generation != self.generation.load(Ordering::SeqCst) {
            return;
        }
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(lease.slot) {
            apply(&mut slot.health);
        }
    }

    /// Start a background full reconnect unless one is already running
    pub fn trigger_reconnect(self: &Arc<Self>) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = pool.reconnect_all().await {
                error!("Store pool reconnect failed: {} ({})", e, e.error_code());
            }
            pool.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    /// Replace every connection; slots whose reconnect fails keep the old connection
    pub async fn reconnect_all(&self) -> Result<()> {
        let size = self.size();
        let mut fresh = Vec::with_capacity(size);
        let mut failures = 0;

        for slot in 0..size {
            match self.factory.connect(slot).await {
                Ok(backend) => fresh.push(Some(backend)),
                Err(e) => {
                    warn!("Reconnect of store connection {} failed: {}", slot, e);
                    failures += 1;
                    fresh.push(None);
                }
            }
        }

        {
            let mut slots = self.slots.write();
            for (slot, backend) in slots.iter_mut().zip(fresh) {
                if let Some(backend) = backend {
                    slot.backend = backend;
                }
                slot.health = ConnectionHealth::new();
            }
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.reconnects.fetch_add(1, Ordering::SeqCst);

        if failures == size {
            return Err(IngestError::StoreUnavailable(format!(
                "all {} connections failed to reconnect",
                size
            )));
        }

        info!("Store pool reconnected ({} of {} connections renewed)", size - failures, size);
        Ok(())
    }

    pub fn health(&self) -> Vec<ConnectionHealth> {
        self.slots.read().iter().map(|slot| slot.health).collect()
    }

    pub fn size(&self) -> usize {
        self.slots.read().len()
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryBackend, MemoryBackendFactory};

    fn policy() -> HealthPolicy {
        HealthPolicy {
            base_score: 100.0,
            failure_penalty: 10.0,
            degraded_failure_threshold: 3,
            degraded_after: Duration::from_secs(30),
        }
    }

    async fn pool(size: usize) -> (Arc<ConnectionPool>, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let factory = Arc::new(MemoryBackendFactory::new(Arc::clone(&backend)));
        (ConnectionPool::connect(factory, size, policy()).await.unwrap(), backend)
    }

    #[test]
    fn test_score_formula() {
        let now = Instant::now();
        let health = ConnectionHealth {
            last_success: now,
            failure_count: 2,
        };
        assert_eq!(policy().score(&health, now + Duration::from_secs(5)), 75.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection_avoids_failing_connection() {
        let (pool, _) = pool(3).await;

        let first = pool.select();
        assert_eq!(first.slot, 0);
        pool.record_failure(&first);

        let second = pool.select();
        assert_ne!(second.slot, 0);
        pool.record_failure(&second);
        pool.record_failure(&second);

        let third = pool.select();
        assert_eq!(third.slot, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovered_connection_is_reselected() {
        let (pool, _) = pool(2).await;
        let lease = pool.select();
        pool.record_failure(&lease);
        assert_eq!(pool.select().slot, 1);

        tokio::time::advance(Duration::from_secs(20)).await;
        let lease = Lease {
            slot: 0,
            generation: 0,
            backend: pool.select().backend,
        };
        pool.record_success(&lease);
        assert_eq!(pool.select().slot, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_pool_still_serves_and_reconnects() {
        let (pool, backend) = pool(2).await;
        for _ in 0..5 {
            let lease = pool.select();
            pool.record_failure(&lease);
            let lease = pool.select();
            pool.record_failure(&lease);
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        let lease = pool.select();
        assert!(lease.slot < 2);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.reconnect_count(), 1);
        assert!(pool.health().iter().all(|h| h.failure_count == 0));
        // two initial connects plus two on reconnect
        assert_eq!(backend.calls.connects.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_stale_generation_outcomes_ignored() {
        let (pool, _) = pool(1).await;
        let lease = pool.select();
        pool.reconnect_all().await.unwrap();

        pool.record_failure(&lease);
        assert_eq!(pool.health()[0].failure_count, 0);
    }
}
