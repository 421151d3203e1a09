//! Local mirror of the instances registered under one service name.
//!
//! A cache is seeded from a prefix read and then kept current by applying the watch
//! events that follow that read, strictly in the order the backend delivered them.
//! Readers take a shared lock; each single update takes the exclusive lock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{Connector, Coordinator, EventKind, Snapshot, WatchEvent, WatchStream};
use crate::error::{RegistryError, RegistryResult};
use crate::key::{self, InstanceDescriptor, parse_key};

/// Decides which cache entry a registry key maps to.
pub trait KeyStrategy: Send + Sync + 'static {
    /// `None` when the key carries no usable information; the event is then ignored.
    fn cache_key(&self, registry_key: &str) -> Option<String>;
}

/// One entry per registry key.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullKey;

impl KeyStrategy for FullKey {
    fn cache_key(&self, registry_key: &str) -> Option<String> {
        Some(registry_key.to_string())
    }
}

/// One entry per instance address, parsed out of the registry key.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressKey;

impl KeyStrategy for AddressKey {
    fn cache_key(&self, registry_key: &str) -> Option<String> {
        parse_key(registry_key).map(|(_, address)| address)
    }
}

/// Notified with the full instance set after bootstrap and after every mutation.
#[async_trait]
pub trait ChangeListener: Send + Sync {
    async fn on_change(&self, service_name: &str, instances: Vec<InstanceDescriptor>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Bootstrap not finished yet
    Starting,
    Watching,
    /// The watch stream ended on its own. No resubscription is attempted, so the
    /// contents are frozen at the last applied event.
    Stale,
    /// Closed on request
    Closed,
}

pub struct DiscoveryCache<S = FullKey> {
    service_name: String,
    prefix: String,
    strategy: S,
    instances: RwLock<HashMap<String, InstanceDescriptor>>,
    state: watch::Sender<WatchState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<S> std::fmt::Debug for DiscoveryCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryCache")
            .field("service_name", &self.service_name)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl DiscoveryCache<FullKey> {
    /// Connect, bootstrap from a prefix read and keep watching in the background.
    pub async fn open(connector: &dyn Connector, service_name: &str) -> RegistryResult<Arc<Self>> {
        Self::open_with_strategy(connector, service_name, FullKey).await
    }
}

impl<S: KeyStrategy> DiscoveryCache<S> {
    /// Empty cache that is not attached to any backend.
    pub fn new(service_name: impl Into<String>, strategy: S) -> Self {
        let service_name = service_name.into();
        let (state, _) = watch::channel(WatchState::Starting);
        Self {
            prefix: key::service_prefix(&service_name),
            service_name,
            strategy,
            instances: RwLock::new(HashMap::new()),
            state,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub async fn open_with_strategy(
        connector: &dyn Connector,
        service_name: &str,
        strategy: S,
    ) -> RegistryResult<Arc<Self>> {
        let coordinator = connector.connect().await?;
        let cache = Arc::new(Self::new(service_name, strategy));

        let stream = match cache.bootstrap_and_watch(coordinator.as_ref()).await {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("Failed to bootstrap discovery for {service_name}: {e}");
                coordinator.close().await;
                return Err(match e {
                    RegistryError::Connect(_) => e,
                    other => RegistryError::Connect(other.to_string()),
                });
            }
        };

        log::info!(
            "Discovery for {service_name} bootstrapped with {} instances",
            cache.len().await
        );
        cache.spawn(coordinator, Some(stream), None).await;
        Ok(cache)
    }

    /// Start the bootstrap and the watch in the background, notifying `listener`
    /// after bootstrap and after every mutation.
    pub(crate) async fn start_with_listener(
        self: &Arc<Self>,
        coordinator: Arc<dyn Coordinator>,
        listener: Arc<dyn ChangeListener>,
    ) {
        self.spawn(coordinator, None, Some(listener)).await;
    }

    async fn spawn(
        self: &Arc<Self>,
        coordinator: Arc<dyn Coordinator>,
        stream: Option<WatchStream>,
        listener: Option<Arc<dyn ChangeListener>>,
    ) {
        let cache = self.clone();
        let task = tokio::spawn(async move {
            cache.run(coordinator, stream, listener).await;
        });
        *self.task.lock().await = Some(task);
    }

    async fn bootstrap_and_watch(
        &self,
        coordinator: &dyn Coordinator,
    ) -> RegistryResult<WatchStream> {
        let snapshot = coordinator.get_prefix(&self.prefix).await?;
        self.bootstrap(&snapshot).await;
        // start right after the snapshot so nothing falls in between
        coordinator
            .watch_prefix(&self.prefix, snapshot.revision + 1)
            .await
    }

    async fn run(
        self: Arc<Self>,
        coordinator: Arc<dyn Coordinator>,
        stream: Option<WatchStream>,
        listener: Option<Arc<dyn ChangeListener>>,
    ) {
        let stream = match stream {
            Some(stream) => Some(stream),
            None => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    result = self.bootstrap_and_watch(coordinator.as_ref()) => match result {
                        Ok(stream) => Some(stream),
                        Err(e) => {
                            log::error!(
                                "Failed to bootstrap discovery for {}: {e}",
                                self.service_name
                            );
                            None
                        }
                    },
                }
            }
        };

        let final_state = match stream {
            Some(stream) => {
                self.state.send_replace(WatchState::Watching);
                if let Some(listener) = &listener {
                    listener.on_change(&self.service_name, self.snapshot().await).await;
                }
                self.consume(stream, listener.as_deref()).await
            }
            None if self.cancel.is_cancelled() => WatchState::Closed,
            None => WatchState::Stale,
        };

        coordinator.close().await;
        self.state.send_replace(final_state);
        log::info!("Discovery watch for {} ended ({final_state:?})", self.service_name);
    }

    async fn consume(
        &self,
        mut stream: WatchStream,
        listener: Option<&dyn ChangeListener>,
    ) -> WatchState {
        loop {
            let batch = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return WatchState::Closed,
                batch = stream.next() => batch,
            };
            let Some(batch) = batch else {
                log::warn!(
                    "Watch stream for {} closed, cache frozen with {} instances",
                    self.service_name,
                    self.len().await
                );
                return WatchState::Stale;
            };
            for event in &batch {
                log::info!("Watch event {:?} on {}", event.kind, event.key);
                if self.apply(event).await {
                    if let Some(listener) = listener {
                        listener.on_change(&self.service_name, self.snapshot().await).await;
                    }
                }
            }
        }
    }

    /// Replace the contents with the decodable entries of a prefix read.
    pub async fn bootstrap(&self, snapshot: &Snapshot) {
        let mut seeded = HashMap::with_capacity(snapshot.kvs.len());
        for kv in &snapshot.kvs {
            let descriptor = match key::decode(&kv.value) {
                Ok(d) => d,
                Err(e) => {
                    log::warn!("Skipping undecodable entry {}: {e}", kv.key);
                    continue;
                }
            };
            match self.strategy.cache_key(&kv.key) {
                Some(cache_key) => {
                    seeded.insert(cache_key, descriptor);
                }
                None => log::warn!("Skipping entry with malformed key {}", kv.key),
            }
        }
        *self.instances.write().await = seeded;
    }

    /// Apply one watch event. Returns whether the contents changed.
    pub async fn apply(&self, event: &WatchEvent) -> bool {
        match event.kind {
            EventKind::Put => {
                let descriptor = match key::decode(&event.value) {
                    Ok(d) => d,
                    Err(e) => {
                        log::warn!("Ignoring put on {} with undecodable value: {e}", event.key);
                        return false;
                    }
                };
                let Some(cache_key) = self.strategy.cache_key(&event.key) else {
                    log::warn!("Ignoring put on malformed key {}", event.key);
                    return false;
                };
                self.instances.write().await.insert(cache_key, descriptor);
                true
            }
            EventKind::Delete => {
                let Some(cache_key) = self.strategy.cache_key(event.deleted_key()) else {
                    return false;
                };
                self.instances.write().await.remove(&cache_key).is_some()
            }
        }
    }

    /// Copy of every current instance. Order is unspecified.
    pub async fn snapshot(&self) -> Vec<InstanceDescriptor> {
        self.instances.read().await.values().cloned().collect()
    }

    pub async fn get(&self, cache_key: &str) -> Option<InstanceDescriptor> {
        self.instances.read().await.get(cache_key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn state(&self) -> WatchState {
        *self.state.borrow()
    }

    /// True once the watch ended without being asked to.
    pub fn is_stale(&self) -> bool {
        self.state() == WatchState::Stale
    }

    /// Wait until the background watch has ended.
    pub async fn finished(&self) -> WatchState {
        let mut state = self.state.subscribe();
        let result = state
            .wait_for(|s| matches!(s, WatchState::Stale | WatchState::Closed))
            .await
            .map(|s| *s);
        result.unwrap_or(WatchState::Closed)
    }

    /// Ask the background watch to stop without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop watching and wait for the background task to release its connection.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    log::error!("Discovery task for {} failed: {e}", self.service_name);
                }
            }
            None => {
                self.state.send_replace(WatchState::Closed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::KeyValue;

    fn value(name: &str, address: &str, port: u32) -> Vec<u8> {
        key::encode(&InstanceDescriptor::new(name, address, port)).unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_skips_undecodable_entries() {
        let cache = DiscoveryCache::new("server1", FullKey);
        let snapshot = Snapshot {
            kvs: vec![
                KeyValue::new("server1/10.0.0.2", value("server1", "10.0.0.2", 9090)),
                KeyValue::new("server1/10.0.0.3", "garbage"),
                KeyValue::new("server1/10.0.0.1", value("server1", "10.0.0.1", 8080)),
            ],
            revision: 7,
        };
        cache.bootstrap(&snapshot).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.get("server1/10.0.0.3").await.is_none());
        assert_eq!(
            cache.get("server1/10.0.0.1").await,
            Some(InstanceDescriptor::new("server1", "10.0.0.1", 8080))
        );
    }

    #[tokio::test]
    async fn test_put_is_last_write_wins() {
        let cache = DiscoveryCache::new("server1", FullKey);
        let first = WatchEvent::put("server1/10.0.0.1", value("server1", "10.0.0.1", 8080));
        let second = WatchEvent::put("server1/10.0.0.1", value("server1", "10.0.0.1", 8081));
        assert!(cache.apply(&first).await);
        assert!(cache.apply(&second).await);

        let instances = cache.snapshot().await;
        assert_eq!(instances, vec![InstanceDescriptor::new("server1", "10.0.0.1", 8081)]);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let cache = DiscoveryCache::new("server1", FullKey);
        assert!(!cache.apply(&WatchEvent::delete("server1/10.0.0.1")).await);
        assert!(cache.is_empty().await);

        cache.apply(&WatchEvent::put("server1/10.0.0.1", value("server1", "10.0.0.1", 8080))).await;
        assert!(cache.apply(&WatchEvent::delete("server1/10.0.0.1")).await);
        assert!(!cache.apply(&WatchEvent::delete("server1/10.0.0.1")).await);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_undecodable_put_leaves_previous_value() {
        let cache = DiscoveryCache::new("server1", FullKey);
        cache.apply(&WatchEvent::put("server1/10.0.0.1", value("server1", "10.0.0.1", 8080))).await;
        assert!(!cache.apply(&WatchEvent::put("server1/10.0.0.1", "{")).await);
        assert_eq!(
            cache.get("server1/10.0.0.1").await.map(|d| d.port()),
            Some(8080)
        );
    }

    #[tokio::test]
    async fn test_address_strategy_matches_by_address() {
        let cache = DiscoveryCache::new("server1", AddressKey);
        cache.apply(&WatchEvent::put("server1/10.0.0.1", value("server1", "10.0.0.1", 8080))).await;
        cache.apply(&WatchEvent::put("server1/10.0.0.2", value("server1", "10.0.0.2", 8080))).await;
        assert!(cache.get("10.0.0.1").await.is_some());

        // malformed keys carry no information
        assert!(!cache.apply(&WatchEvent::put("server1/a/b", value("server1", "a", 1))).await);
        assert!(!cache.apply(&WatchEvent::delete("garbage")).await);

        assert!(cache.apply(&WatchEvent::delete("server1/10.0.0.1")).await);
        assert_eq!(
            cache.snapshot().await,
            vec![InstanceDescriptor::new("server1", "10.0.0.2", 8080)]
        );
    }

    #[tokio::test]
    async fn test_close_without_task_marks_closed() {
        let cache = DiscoveryCache::new("server1", FullKey);
        assert_eq!(cache.state(), WatchState::Starting);
        cache.close().await;
        assert_eq!(cache.state(), WatchState::Closed);
        assert!(!cache.is_stale());
    }
}
