//! In-process coordination backend.
//!
//! Behaves like a single-node etcd: every mutation bumps a store revision, prefix
//! watches can start at any revision still in the history, and keys attached to a lease
//! disappear (with delete events) when the lease is revoked or expires. A handful of
//! hooks let tests inject the failures a real cluster produces.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{
    Connector, Coordinator, KeepAliveAck, KeepAliveStream, KeyValue, LeaseHandle, LeaseId,
    Snapshot, WatchEvent, WatchStream,
};
use crate::error::{RegistryError, RegistryResult};

const MIN_KEEPALIVE_PERIOD: Duration = Duration::from_millis(10);

struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
    /// Cancelled when the lease is gone or its keepalive streams are severed
    keepalive: CancellationToken,
}

struct Watch {
    connection: u64,
    prefix: String,
    tx: mpsc::UnboundedSender<Vec<WatchEvent>>,
}

#[derive(Default)]
struct Store {
    revision: i64,
    kvs: BTreeMap<String, Entry>,
    history: Vec<(i64, WatchEvent)>,
    watches: Vec<Watch>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
    revoked: Vec<LeaseId>,
    open_connections: usize,
    unreachable: bool,
}

impl Store {
    /// Record events as one revision and fan them out to matching watches.
    fn commit(&mut self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        self.revision += 1;
        let revision = self.revision;
        for event in &events {
            self.history.push((revision, event.clone()));
        }
        self.watches.retain(|watch| {
            let batch: Vec<WatchEvent> = events
                .iter()
                .filter(|e| e.key.starts_with(&watch.prefix))
                .cloned()
                .collect();
            batch.is_empty() || watch.tx.send(batch).is_ok()
        });
    }

    fn put(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) {
        if let Some(previous) = self.kvs.get(key).and_then(|e| e.lease) {
            if let Some(old) = self.leases.get_mut(&previous) {
                old.keys.remove(key);
            }
        }
        if let Some(id) = lease {
            if let Some(l) = self.leases.get_mut(&id) {
                l.keys.insert(key.to_string());
            }
        }
        self.kvs.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                lease,
            },
        );
        self.commit(vec![WatchEvent::put(key, value)]);
    }

    fn delete(&mut self, key: &str) -> bool {
        match self.kvs.remove(key) {
            Some(entry) => {
                if let Some(l) = entry.lease.and_then(|id| self.leases.get_mut(&id)) {
                    l.keys.remove(key);
                }
                self.commit(vec![WatchEvent::delete(key)]);
                true
            }
            None => false,
        }
    }

    /// Drop a lease together with every key attached to it.
    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        lease.keepalive.cancel();
        let mut keys: Vec<String> = lease.keys.into_iter().collect();
        keys.sort();
        let events = keys
            .iter()
            .filter(|key| self.kvs.remove(key.as_str()).is_some())
            .map(|key| WatchEvent::delete(key.as_str()))
            .collect();
        self.commit(events);
        true
    }
}

/// Shared in-memory store. Cloning yields another handle to the same store.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    store: Arc<Mutex<Store>>,
    connection_ids: Arc<AtomicU64>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection. Fails while the backend is marked unreachable.
    pub async fn connect(&self) -> RegistryResult<Arc<MemoryCoordinator>> {
        let mut store = self.store.lock().await;
        if store.unreachable {
            return Err(RegistryError::Connect("memory backend unreachable".to_string()));
        }
        store.open_connections += 1;
        Ok(Arc::new(MemoryCoordinator {
            backend: self.clone(),
            id: self.connection_ids.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Write a key without a lease, as another client would.
    pub async fn put(&self, key: &str, value: impl Into<Vec<u8>>) {
        self.store.lock().await.put(key, value.into(), None);
    }

    /// Delete a key, as another client would. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> bool {
        self.store.lock().await.delete(key)
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.store.lock().await.kvs.get(key).map(|e| e.value.clone())
    }

    pub async fn keys(&self) -> Vec<String> {
        self.store.lock().await.kvs.keys().cloned().collect()
    }

    pub async fn revision(&self) -> i64 {
        self.store.lock().await.revision
    }

    /// Expire a lease as if it had not been renewed within its TTL.
    pub async fn expire_lease(&self, id: LeaseId) -> bool {
        self.store.lock().await.drop_lease(id)
    }

    /// Expire every lease whose deadline has passed.
    pub async fn reap_expired(&self) -> Vec<LeaseId> {
        let mut store = self.store.lock().await;
        let now = Instant::now();
        let expired: Vec<LeaseId> = store
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            store.drop_lease(*id);
        }
        expired
    }

    /// End all keepalive streams of a lease without removing the lease, the way a
    /// dropped connection to the cluster does.
    pub async fn sever_keepalive(&self, id: LeaseId) {
        let mut store = self.store.lock().await;
        if let Some(lease) = store.leases.get_mut(&id) {
            lease.keepalive.cancel();
            lease.keepalive = CancellationToken::new();
        }
    }

    /// End every open watch stream.
    pub async fn close_watches(&self) {
        self.store.lock().await.watches.clear();
    }

    pub async fn set_reachable(&self, reachable: bool) {
        self.store.lock().await.unreachable = !reachable;
    }

    pub async fn lease_ids(&self) -> Vec<LeaseId> {
        let mut ids: Vec<LeaseId> = self.store.lock().await.leases.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Every revoke call received so far, including ones for unknown leases.
    pub async fn revoked_leases(&self) -> Vec<LeaseId> {
        self.store.lock().await.revoked.clone()
    }

    pub async fn open_connections(&self) -> usize {
        self.store.lock().await.open_connections
    }

    pub async fn watch_count(&self) -> usize {
        self.store.lock().await.watches.len()
    }
}

#[async_trait]
impl Connector for MemoryBackend {
    async fn connect(&self) -> RegistryResult<Arc<dyn Coordinator>> {
        let coordinator: Arc<dyn Coordinator> = MemoryBackend::connect(self).await?;
        Ok(coordinator)
    }
}

/// One connection to a [`MemoryBackend`]
pub struct MemoryCoordinator {
    backend: MemoryBackend,
    id: u64,
    closed: AtomicBool,
    /// Ends the keepalive streams of this connection
    shutdown: CancellationToken,
}

impl MemoryCoordinator {
    fn ensure_open(&self) -> RegistryResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::Backend("connection closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn get_prefix(&self, prefix: &str) -> RegistryResult<Snapshot> {
        self.ensure_open()?;
        let store = self.backend.store.lock().await;
        let kvs = store
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue::new(key.as_str(), entry.value.as_slice()))
            .collect();
        Ok(Snapshot {
            kvs,
            revision: store.revision,
        })
    }

    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> RegistryResult<WatchStream> {
        self.ensure_open()?;
        let mut store = self.backend.store.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();

        // replay what happened since the requested revision, one batch per revision
        let mut pending: Option<(i64, Vec<WatchEvent>)> = None;
        for (revision, event) in store
            .history
            .iter()
            .filter(|(rev, e)| *rev >= start_revision && e.key.starts_with(prefix))
        {
            match pending.as_mut() {
                Some((rev, batch)) if rev == revision => batch.push(event.clone()),
                _ => {
                    if let Some((_, batch)) = pending.take() {
                        let _ = tx.send(batch);
                    }
                    pending = Some((*revision, vec![event.clone()]));
                }
            }
        }
        if let Some((_, batch)) = pending {
            let _ = tx.send(batch);
        }

        store.watches.push(Watch {
            connection: self.id,
            prefix: prefix.to_string(),
            tx,
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn grant(&self, ttl: Duration) -> RegistryResult<LeaseHandle> {
        self.ensure_open()?;
        let mut store = self.backend.store.lock().await;
        store.next_lease += 1;
        let id = store.next_lease;
        store.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
                keepalive: CancellationToken::new(),
            },
        );
        Ok(LeaseHandle { id, ttl })
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> RegistryResult<()> {
        self.ensure_open()?;
        let mut store = self.backend.store.lock().await;
        if !store.leases.contains_key(&lease) {
            return Err(RegistryError::Lease(format!("lease {lease} not found")));
        }
        store.put(key, value, Some(lease));
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> RegistryResult<KeepAliveStream> {
        self.ensure_open()?;
        let (ttl, severed) = {
            let store = self.backend.store.lock().await;
            let l = store
                .leases
                .get(&lease)
                .ok_or_else(|| RegistryError::Lease(format!("lease {lease} not found")))?;
            (l.ttl, l.keepalive.clone())
        };
        let store = self.backend.store.clone();
        let period = (ttl / 3).max(MIN_KEEPALIVE_PERIOD);
        let shutdown = self.shutdown.clone();

        Ok(Box::pin(async_stream::stream! {
            loop {
                if severed.is_cancelled() || shutdown.is_cancelled() {
                    break;
                }
                let renewed = {
                    let mut store = store.lock().await;
                    match store.leases.get_mut(&lease) {
                        Some(l) => {
                            l.deadline = Instant::now() + l.ttl;
                            Some(l.ttl)
                        }
                        None => None,
                    }
                };
                let Some(ttl) = renewed else {
                    break;
                };
                yield KeepAliveAck { id: lease, ttl: ttl.as_secs() as i64 };
                tokio::select! {
                    _ = severed.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
            }
        }))
    }

    async fn revoke(&self, lease: LeaseId) -> RegistryResult<()> {
        self.ensure_open()?;
        let mut store = self.backend.store.lock().await;
        store.revoked.push(lease);
        store.drop_lease(lease);
        Ok(())
    }

    async fn status(&self) -> RegistryResult<()> {
        self.ensure_open()?;
        if self.backend.store.lock().await.unreachable {
            return Err(RegistryError::Connect("memory backend unreachable".to_string()));
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        let mut store = self.backend.store.lock().await;
        store.watches.retain(|w| w.connection != self.id);
        store.open_connections = store.open_connections.saturating_sub(1);
    }
}
