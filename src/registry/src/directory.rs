//! Named discovery caches owned by the application.
//!
//! Components that need to look up instances by service name get a reference to a
//! [`ServiceDirectory`] instead of reaching for process-wide state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::backend::Connector;
use crate::discovery::DiscoveryCache;
use crate::error::{RegistryError, RegistryResult};
use crate::key::InstanceDescriptor;
use crate::selector;

/// Target type accepted by [`ServiceDirectory::open_targets`].
pub const ETCD_TARGET_TYPE: &str = "etcd";

/// Split a `"<type>:<service name>"` target. Only etcd targets are recognised.
pub fn parse_target(target: &str) -> Option<&str> {
    let (target_type, service_name) = target.split_once(':')?;
    if target_type != ETCD_TARGET_TYPE || service_name.is_empty() {
        return None;
    }
    Some(service_name)
}

pub struct ServiceDirectory {
    connector: Arc<dyn Connector>,
    caches: RwLock<HashMap<String, Arc<DiscoveryCache>>>,
}

impl ServiceDirectory {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            caches: RwLock::new(HashMap::new()),
        }
    }

    /// Open discovery for `service_name`, replacing and closing any cache already
    /// open for it.
    pub async fn open(&self, service_name: &str) -> RegistryResult<Arc<DiscoveryCache>> {
        let cache = DiscoveryCache::open(self.connector.as_ref(), service_name).await?;
        let previous = self
            .caches
            .write()
            .await
            .insert(service_name.to_string(), cache.clone());
        if let Some(previous) = previous {
            log::info!("Replacing discovery cache for {service_name}");
            previous.close().await;
        }
        Ok(cache)
    }

    /// Open every `"etcd:<service name>"` target. Other target types and names that
    /// fail to open are logged and skipped. Returns the names that were opened.
    pub async fn open_targets<T: AsRef<str>>(&self, targets: &[T]) -> Vec<String> {
        let mut opened = Vec::new();
        for target in targets {
            let target = target.as_ref();
            let Some(service_name) = parse_target(target) else {
                log::warn!("Ignoring discovery target {target}");
                continue;
            };
            match self.open(service_name).await {
                Ok(_) => opened.push(service_name.to_string()),
                Err(e) => log::error!("Failed to open discovery for {service_name}: {e}"),
            }
        }
        opened
    }

    pub async fn get(&self, service_name: &str) -> RegistryResult<Arc<DiscoveryCache>> {
        self.caches
            .read()
            .await
            .get(service_name)
            .cloned()
            .ok_or_else(|| RegistryError::NotInitialized(service_name.to_string()))
    }

    pub async fn pick_random(&self, service_name: &str) -> RegistryResult<InstanceDescriptor> {
        let cache = self.get(service_name).await?;
        selector::pick_random(&cache).await
    }

    pub async fn list_all(&self, service_name: &str) -> RegistryResult<Vec<InstanceDescriptor>> {
        let cache = self.get(service_name).await?;
        Ok(selector::list_all(&cache).await)
    }

    pub async fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Close and forget the cache for `service_name`. Returns whether one was open.
    pub async fn close(&self, service_name: &str) -> bool {
        let cache = self.caches.write().await.remove(service_name);
        match cache {
            Some(cache) => {
                cache.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let caches: Vec<Arc<DiscoveryCache>> =
            self.caches.write().await.drain().map(|(_, c)| c).collect();
        for cache in caches {
            cache.close().await;
        }
    }
}

impl Drop for ServiceDirectory {
    fn drop(&mut self) {
        for cache in self.caches.get_mut().values() {
            cache.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::key;

    #[test]
    fn test_parse_target() {
        assert_eq!(parse_target("etcd:server1"), Some("server1"));
        assert_eq!(parse_target("dns:server1"), None);
        assert_eq!(parse_target("etcd:"), None);
        assert_eq!(parse_target("server1"), None);
    }

    #[tokio::test]
    async fn test_get_before_open_is_not_initialized() {
        let directory = ServiceDirectory::new(Arc::new(MemoryBackend::new()));
        let err = directory.get("server1").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotInitialized(name) if name == "server1"));
    }

    #[tokio::test]
    async fn test_open_targets_skips_foreign_types() {
        let backend = MemoryBackend::new();
        let descriptor = InstanceDescriptor::new("server1", "10.0.0.1", 8080);
        backend
            .put(&descriptor.key(), key::encode(&descriptor).unwrap())
            .await;

        let directory = ServiceDirectory::new(Arc::new(backend.clone()));
        let opened = directory
            .open_targets(&["etcd:server1", "consul:server2", "garbage"])
            .await;
        assert_eq!(opened, vec!["server1".to_string()]);
        assert_eq!(directory.service_names().await, vec!["server1".to_string()]);
        assert_eq!(directory.pick_random("server1").await.unwrap(), descriptor);

        directory.close_all().await;
        assert!(directory.service_names().await.is_empty());
        assert_eq!(backend.open_connections().await, 0);
    }

    /// Refuses the connection attempt numbered `fail_on`, counting from zero.
    struct FlakyConnector {
        backend: MemoryBackend,
        attempts: std::sync::atomic::AtomicUsize,
        fail_on: usize,
    }

    #[async_trait::async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self) -> RegistryResult<Arc<dyn crate::backend::Coordinator>> {
            let attempt = self.attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if attempt == self.fail_on {
                return Err(RegistryError::Connect("connection refused".to_string()));
            }
            Connector::connect(&self.backend).await
        }
    }

    #[tokio::test]
    async fn test_open_targets_continues_past_failed_name() {
        let backend = MemoryBackend::new();
        let directory = ServiceDirectory::new(Arc::new(FlakyConnector {
            backend: backend.clone(),
            attempts: Default::default(),
            fail_on: 1,
        }));

        let opened = directory
            .open_targets(&["etcd:server1", "etcd:server2", "etcd:server3"])
            .await;
        assert_eq!(opened, vec!["server1".to_string(), "server3".to_string()]);
        assert!(matches!(
            directory.get("server2").await,
            Err(RegistryError::NotInitialized(_))
        ));
        assert!(directory.get("server3").await.is_ok());
        assert_eq!(backend.open_connections().await, 2);

        directory.close_all().await;
        assert_eq!(backend.open_connections().await, 0);
    }

    #[tokio::test]
    async fn test_reopen_replaces_and_closes_previous() {
        let backend = MemoryBackend::new();
        let directory = ServiceDirectory::new(Arc::new(backend.clone()));

        let first = directory.open("server1").await.unwrap();
        let second = directory.open("server1").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.state(), crate::discovery::WatchState::Closed);
        assert_eq!(backend.open_connections().await, 1);

        assert!(directory.close("server1").await);
        assert!(!directory.close("server1").await);
    }
}
