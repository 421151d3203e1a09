use std::sync::Arc;

use async_trait::async_trait;
use ntest::timeout;
use registry::key;
use registry::resolver::ResolverState;
use registry::{
    InstanceDescriptor, MemoryBackend, RegistryError, RegistryResult, ResolutionSink,
    ResolutionState, ResolverBuilder, Target,
};
use tokio::sync::mpsc;

/// Forwards every pushed state to the test.
struct RecordingSink {
    tx: mpsc::UnboundedSender<Vec<String>>,
}

#[async_trait]
impl ResolutionSink for RecordingSink {
    async fn update_state(&self, state: ResolutionState) -> RegistryResult<()> {
        let addrs = state.addresses.into_iter().map(|a| a.addr).collect();
        self.tx
            .send(addrs)
            .map_err(|e| RegistryError::Sink(e.to_string()))
    }
}

fn recording_sink() -> (Arc<RecordingSink>, mpsc::UnboundedReceiver<Vec<String>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingSink { tx }), rx)
}

async fn put_instance(backend: &MemoryBackend, descriptor: &InstanceDescriptor) {
    backend
        .put(&descriptor.key(), key::encode(descriptor).unwrap())
        .await;
}

#[tokio::test]
#[timeout(10000)]
async fn test_resolver_pushes_full_address_sets() {
    let backend = MemoryBackend::new();
    put_instance(&backend, &InstanceDescriptor::new("server2", "10.0.0.1", 8080)).await;

    let builder = ResolverBuilder::new("server1", Arc::new(backend.clone()));
    let (sink, mut updates) = recording_sink();
    let resolver = builder
        .build(&Target::parse("server1:///server2"), sink)
        .await
        .unwrap();
    assert_eq!(resolver.service_name(), "server2");

    assert_eq!(
        updates.recv().await.unwrap(),
        vec!["http://10.0.0.1:8080".to_string()]
    );

    put_instance(&backend, &InstanceDescriptor::new("server2", "10.0.0.2", 9090)).await;
    assert_eq!(
        updates.recv().await.unwrap(),
        vec![
            "http://10.0.0.1:8080".to_string(),
            "http://10.0.0.2:9090".to_string()
        ]
    );
    assert_eq!(resolver.state(), ResolverState::Watching);

    backend.delete("server2/10.0.0.1").await;
    assert_eq!(
        updates.recv().await.unwrap(),
        vec!["http://10.0.0.2:9090".to_string()]
    );

    // deleting an unknown key changes nothing and pushes nothing
    backend.delete("server2/10.0.0.1").await;
    resolver.resolve_now();

    resolver.close().await;
    assert_eq!(resolver.state(), ResolverState::Closed);
    assert!(updates.try_recv().is_err());
    assert_eq!(backend.watch_count().await, 0);
    assert_eq!(backend.open_connections().await, 0);
}

#[tokio::test]
#[timeout(10000)]
async fn test_resolver_pushes_empty_state_after_bootstrap() {
    let backend = MemoryBackend::new();
    let builder = ResolverBuilder::new("server1", Arc::new(backend.clone()));
    let (sink, mut updates) = recording_sink();
    let resolver = builder.build(&Target::new("server1", "server3"), sink).await.unwrap();

    assert!(updates.recv().await.unwrap().is_empty());
    resolver.close().await;
}

#[tokio::test]
#[timeout(10000)]
async fn test_build_rejects_empty_endpoint() {
    let backend = MemoryBackend::new();
    let builder = ResolverBuilder::new("server1", Arc::new(backend.clone()));
    let (sink, _updates) = recording_sink();
    let result = builder.build(&Target::parse("server1:///"), sink).await;
    assert!(matches!(result, Err(RegistryError::InvalidTarget(_))));
    assert_eq!(backend.open_connections().await, 0);
}

#[tokio::test]
#[timeout(10000)]
async fn test_build_fails_when_backend_unreachable() {
    let backend = MemoryBackend::new();
    backend.set_reachable(false).await;
    let builder = ResolverBuilder::new("server1", Arc::new(backend));
    let (sink, _updates) = recording_sink();
    let result = builder.build(&Target::new("server1", "server2"), sink).await;
    assert!(matches!(result, Err(RegistryError::Connect(_))));
}
