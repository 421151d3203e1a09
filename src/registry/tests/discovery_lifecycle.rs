use std::sync::Arc;
use std::time::Duration;

use ntest::timeout;
use registry::key;
use registry::{
    DiscoveryCache, InstanceDescriptor, MemoryBackend, Registration, RegistrationStatus,
    ServiceDirectory, WatchState, selector,
};

async fn put_instance(backend: &MemoryBackend, descriptor: &InstanceDescriptor) {
    backend
        .put(&descriptor.key(), key::encode(descriptor).unwrap())
        .await;
}

/// Poll until the cache holds `expected` instances.
async fn wait_for_len(cache: &DiscoveryCache, expected: usize) {
    while cache.len().await != expected {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
#[timeout(10000)]
async fn test_cache_follows_puts_and_deletes() {
    let backend = MemoryBackend::new();
    let first = InstanceDescriptor::new("server1", "10.0.0.1", 8080);
    put_instance(&backend, &first).await;
    // a neighbouring service sharing the name as a prefix must not leak in
    put_instance(&backend, &InstanceDescriptor::new("server10", "10.0.0.9", 8080)).await;

    let cache = DiscoveryCache::open(&backend, "server1").await.unwrap();
    assert_eq!(cache.snapshot().await, vec![first.clone()]);
    assert_eq!(selector::pick_random(&cache).await.unwrap(), first);

    let second = InstanceDescriptor::new("server1", "10.0.0.2", 9090);
    put_instance(&backend, &second).await;
    wait_for_len(&cache, 2).await;

    backend.delete(&first.key()).await;
    wait_for_len(&cache, 1).await;
    assert_eq!(cache.snapshot().await, vec![second]);
    assert_eq!(cache.state(), WatchState::Watching);

    cache.close().await;
    assert_eq!(cache.state(), WatchState::Closed);
    assert_eq!(backend.watch_count().await, 0);
    assert_eq!(backend.open_connections().await, 0);
}

#[tokio::test]
#[timeout(10000)]
async fn test_cache_goes_stale_when_watch_ends() {
    let backend = MemoryBackend::new();
    put_instance(&backend, &InstanceDescriptor::new("server1", "10.0.0.1", 8080)).await;
    let cache = DiscoveryCache::open(&backend, "server1").await.unwrap();

    backend.close_watches().await;
    assert_eq!(cache.finished().await, WatchState::Stale);
    assert!(cache.is_stale());

    // contents stay frozen at the last applied event
    put_instance(&backend, &InstanceDescriptor::new("server1", "10.0.0.2", 8080)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cache.len().await, 1);
    assert_eq!(backend.open_connections().await, 0);
}

#[tokio::test]
#[timeout(10000)]
async fn test_open_fails_when_backend_unreachable() {
    let backend = MemoryBackend::new();
    backend.set_reachable(false).await;
    let result = DiscoveryCache::open(&backend, "server1").await;
    assert!(matches!(result, Err(registry::RegistryError::Connect(_))));
}

#[tokio::test]
#[timeout(10000)]
async fn test_registered_instance_is_discovered_and_withdrawn() {
    let backend = MemoryBackend::new();
    let directory = ServiceDirectory::new(Arc::new(backend.clone()));
    let opened = directory.open_targets(&["etcd:server1"]).await;
    assert_eq!(opened, vec!["server1".to_string()]);
    let cache = directory.get("server1").await.unwrap();
    assert!(cache.is_empty().await);

    let descriptor = InstanceDescriptor::new("server1", "10.0.0.7", 8080);
    let registration =
        Registration::register(&backend, descriptor.clone(), Duration::from_secs(30))
            .await
            .unwrap();
    wait_for_len(&cache, 1).await;
    assert_eq!(directory.pick_random("server1").await.unwrap(), descriptor);

    registration.stop().await.unwrap();
    wait_for_len(&cache, 0).await;
    assert!(directory.pick_random("server1").await.is_err());

    directory.close_all().await;
    assert_eq!(backend.open_connections().await, 0);
}

#[tokio::test]
#[timeout(10000)]
async fn test_lost_lease_is_reported_and_revoked_once() {
    let backend = MemoryBackend::new();
    let registration = Registration::register(
        &backend,
        InstanceDescriptor::new("server1", "10.0.0.1", 8080),
        Duration::from_secs(3),
    )
    .await
    .unwrap();
    let lease = registration.lease().id;

    backend.sever_keepalive(lease).await;
    assert_eq!(registration.terminated().await, RegistrationStatus::LeaseLost);
    assert_eq!(backend.revoked_leases().await, vec![lease]);
    assert!(backend.keys().await.is_empty());
    assert_eq!(backend.open_connections().await, 0);

    // stopping after the loss does not revoke again
    registration.stop().await.unwrap();
    assert_eq!(registration.status(), RegistrationStatus::LeaseLost);
    assert_eq!(backend.revoked_leases().await, vec![lease]);
}

#[tokio::test(start_paused = true)]
#[timeout(10000)]
async fn test_keepalive_keeps_lease_past_its_ttl() {
    let backend = MemoryBackend::new();
    let registration = Registration::register(
        &backend,
        InstanceDescriptor::new("server1", "10.0.0.1", 8080),
        Duration::from_secs(3),
    )
    .await
    .unwrap();

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(backend.reap_expired().await.is_empty());
    }
    assert_eq!(registration.status(), RegistrationStatus::Active);
    assert_eq!(backend.keys().await, vec!["server1/10.0.0.1".to_string()]);

    registration.stop().await.unwrap();
}
