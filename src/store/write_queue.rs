/// Bounded queue of non-critical writes, drained in the background
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub path: String,
    pub value: Value,
    pub attempts: u32,
    pub enqueued_at: Instant,
}

impl PendingWrite {
    pub fn new(path: &str, value: Value) -> Self {
        PendingWrite {
            path: path.to_string(),
            value,
            attempts: 0,
            enqueued_at: Instant::now(),
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingWrite>,
    /// Paths handed to the drainer and not yet settled; true once superseded
    in_flight: HashMap<String, bool>,
}

pub struct WriteQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
    settled: Notify,
}

impl WriteQueue {
    pub fn new(capacity: usize) -> Self {
        WriteQueue {
            state: Mutex::new(QueueState::default()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
            settled: Notify::new(),
        }
    }

    /// Queue a write. A pending write to the same path is replaced in place;
    /// on overflow the oldest entry is dropped.
    pub fn push(&self, write: PendingWrite) {
        let mut state = self.state.lock();
        self.insert(&mut state.pending, write);
        drop(state);
        self.notify.notify_one();
    }

    fn insert(&self, pending: &mut VecDeque<PendingWrite>, write: PendingWrite) {
        if let Some(existing) = pending.iter_mut().find(|w| w.path == write.path) {
            existing.value = write.value;
            existing.attempts = existing.attempts.min(write.attempts);
            return;
        }

        if pending.len() >= self.capacity {
            if let Some(oldest) = pending.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Write queue full ({}), dropping oldest write to {} (queued {:?} ago)",
                    self.capacity,
                    oldest.path,
                    oldest.enqueued_at.elapsed()
                );
            }
        }
        pending.push_back(write);
    }

    /// Take up to `max` writes; their paths stay in flight until `settle`
    pub fn take_batch(&self, max: usize) -> Vec<PendingWrite> {
        let mut state = self.state.lock();
        let count = max.min(state.pending.len());
        let batch: Vec<PendingWrite> = state.pending.drain(..count).collect();
        for write in &batch {
            state.in_flight.insert(write.path.clone(), false);
        }
        batch
    }

    /// Whether a direct write or delete replaced this in-flight path
    pub fn is_superseded(&self, path: &str) -> bool {
        self.state.lock().in_flight.get(path).copied().unwrap_or(false)
    }

    /// Finish a batch taken with `take_batch`. Writes in `retry` go back to the
    /// queue unless their path was superseded or a newer write is pending.
    /// Does not wake the drainer.
    pub fn settle(&self, batch_paths: &[String], retry: Vec<PendingWrite>) {
        let mut state = self.state.lock();
        for write in retry {
            let superseded = state.in_flight.get(&write.path).copied().unwrap_or(false);
            if superseded || state.pending.iter().any(|w| w.path == write.path) {
                continue;
            }
            self.insert(&mut state.pending, write);
        }
        for path in batch_paths {
            state.in_flight.remove(path);
        }
        drop(state);
        self.settled.notify_waiters();
    }

    /// Wait until no drainer write to `path` is in flight
    pub async fn wait_settled(&self, path: &str) {
        loop {
            let settled = self.settled.notified();
            let in_flight = self.state.lock().in_flight.contains_key(path);
            if !in_flight {
                return;
            }
            settled.await;
        }
    }

    /// Wait until something is pushed
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state.lock().pending.iter().any(|w| w.path == path)
    }

    /// Drop the pending write to `path` and mark an in-flight one superseded,
    /// ahead of a direct write or delete
    pub fn discard(&self, path: &str) -> bool {
        let mut state = self.state.lock();
        if let Some(superseded) = state.in_flight.get_mut(path) {
            *superseded = true;
        }
        let before = state.pending.len();
        state.pending.retain(|w| w.path != path);
        state.pending.len() != before
    }
}
