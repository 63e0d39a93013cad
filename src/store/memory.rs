/// In-process key-path backend with the same tree semantics as the remote store
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use crate::error::{IngestError, Result};
use crate::store::backend::{BackendFactory, StoreBackend};

/// Failure modes that can be injected for local runs and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    RateLimited,
    Rejected,
    Hang,
}

#[derive(Debug, Default)]
pub struct CallCounts {
    pub gets: AtomicUsize,
    pub puts: AtomicUsize,
    pub deletes: AtomicUsize,
    pub lists: AtomicUsize,
    pub refreshes: AtomicUsize,
    pub connects: AtomicUsize,
}

pub struct MemoryBackend {
    root: RwLock<Value>,
    fault: Mutex<Option<Fault>>,
    queued_faults: Mutex<VecDeque<Fault>>,
    failing_prefixes: Mutex<Vec<String>>,
    auth_valid: AtomicBool,
    pub calls: CallCounts,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        MemoryBackend {
            root: RwLock::new(Value::Object(Map::new())),
            fault: Mutex::new(None),
            queued_faults: Mutex::new(VecDeque::new()),
            failing_prefixes: Mutex::new(Vec::new()),
            auth_valid: AtomicBool::new(true),
            calls: CallCounts::default(),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every request with `fault` until cleared with `None`
    pub fn set_fault(&self, fault: Option<Fault>) {
        *self.fault.lock() = fault;
    }

    /// Fail the next `count` requests with `fault`
    pub fn fail_next(&self, count: usize, fault: Fault) {
        let mut queued = self.queued_faults.lock();
        queued.extend(std::iter::repeat(fault).take(count));
    }

    /// Requests under `prefix` fail as transient errors
    pub fn fail_prefix(&self, prefix: &str) {
        self.failing_prefixes.lock().push(prefix.to_string());
    }

    /// Requests fail with an auth error until credentials are refreshed
    pub fn expire_credentials(&self) {
        self.auth_valid.store(false, Ordering::SeqCst);
    }

    /// Snapshot of the value at `path` bypassing fault injection
    pub fn peek(&self, path: &str) -> Option<Value> {
        let root = self.root.read();
        lookup(&root, &segments(path)).cloned()
    }

    pub fn network_calls(&self) -> usize {
        self.calls.gets.load(Ordering::SeqCst)
            + self.calls.puts.load(Ordering::SeqCst)
            + self.calls.deletes.load(Ordering::SeqCst)
            + self.calls.lists.load(Ordering::SeqCst)
    }

    async fn check(&self, path: &str) -> Result<()> {
        if !self.auth_valid.load(Ordering::SeqCst) {
            return Err(IngestError::AuthExpired(format!("token rejected for {}", path)));
        }

        let fault = self.queued_faults.lock().pop_front().or(*self.fault.lock());
        if let Some(fault) = fault {
            return match fault {
                Fault::Transient => Err(IngestError::TransientNetwork(format!("injected for {}", path))),
                Fault::RateLimited => Err(IngestError::RateLimited(format!("injected for {}", path))),
                Fault::Rejected => Err(IngestError::StoreRejected(format!("injected for {}", path))),
                Fault::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(IngestError::TransientNetwork(format!("hung on {}", path)))
                }
            };
        }

        let failing = self.failing_prefixes.lock().iter().any(|p| path.starts_with(p.as_str()));
        if failing {
            return Err(IngestError::TransientNetwork(format!("prefix failure for {}", path)));
        }
        Ok(())
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn lookup<'a>(node: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(node, |current, key| current.as_object()?.get(*key))
}

fn insert(node: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *node = value;
        return;
    };

    let mut current = node;
    for key in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Some(map) = current.as_object_mut() {
        map.insert(last.to_string(), value);
    }
}

/// Remove `path` and prune parents left empty; true when `node` became empty
fn remove(node: &mut Value, path: &[&str]) -> bool {
    let Some(map) = node.as_object_mut() else {
        return false;
    };
    match path {
        [] => {
            map.clear();
        }
        [key] => {
            map.remove(*key);
        }
        [key, rest @ ..] => {
            let child_empty = map.get_mut(*key).map_or(false, |child| remove(child, rest));
            if child_empty {
                map.remove(*key);
            }
        }
    }
    map.is_empty()
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        self.calls.gets.fetch_add(1, Ordering::SeqCst);
        self.check(path).await?;
        Ok(self.peek(path))
    }

    async fn put(&self, path: &str, value: &Value) -> Result<()> {
        self.calls.puts.fetch_add(1, Ordering::SeqCst);
        self.check(path).await?;

        let segs = segments(path);
        let mut root = self.root.write();
        if value.is_null() {
            remove(&mut root, &segs);
        } else {
            insert(&mut root, &segs, value.clone());
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.calls.deletes.fetch_add(1, Ordering::SeqCst);
        self.check(path).await?;

        let mut root = self.root.write();
        remove(&mut root, &segments(path));
        Ok(())
    }

    async fn list_keys(&self, path: &str) -> Result<Vec<String>> {
        self.calls.lists.fetch_add(1, Ordering::SeqCst);
        self.check(path).await?;

        let root = self.root.read();
        Ok(lookup(&root, &segments(path))
            .and_then(Value::as_object)
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn refresh_credentials(&self) -> Result<()> {
        self.calls.refreshes.fetch_add(1, Ordering::SeqCst);
        self.auth_valid.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Every pool slot shares the one in-process tree
pub struct MemoryBackendFactory {
    backend: Arc<MemoryBackend>,
}

impl MemoryBackendFactory {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        MemoryBackendFactory { backend }
    }
}

#[async_trait]
impl BackendFactory for MemoryBackendFactory {
    async fn connect(&self, _slot: usize) -> Result<Arc<dyn StoreBackend>> {
        self.backend.calls.connects.fetch_add(1, Ordering::SeqCst);
        let backend: Arc<dyn StoreBackend> = self.backend.clone();
        Ok(backend)
    }
}
