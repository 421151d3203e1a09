//! Name resolution for RPC clients backed by a discovery cache.
//!
//! A [`ResolverBuilder`] is registered under a scheme equal to the service name. Building
//! it for a target opens a dedicated connection and a cache for the target's service,
//! and from then on the full address set is pushed to a [`ResolutionSink`] after the
//! bootstrap and after every change. Sinks receive whole states, never deltas; the
//! tonic adapter in this module does the diffing.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tonic::transport::{Channel, Endpoint};
use tower::discover::Change;

use crate::backend::Connector;
use crate::discovery::{ChangeListener, DiscoveryCache, FullKey, WatchState};
use crate::error::{RegistryError, RegistryResult};
use crate::key::InstanceDescriptor;

/// One usable address, e.g. `http://10.0.0.1:8080`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolvedAddress {
    pub addr: String,
}

/// Every currently usable address of a target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionState {
    pub addresses: Vec<ResolvedAddress>,
}

impl ResolutionState {
    pub fn from_instances(instances: &[InstanceDescriptor]) -> Self {
        let mut addresses: Vec<ResolvedAddress> = instances
            .iter()
            .map(|d| ResolvedAddress {
                addr: d.grpc_address(),
            })
            .collect();
        addresses.sort();
        Self { addresses }
    }
}

/// Receives resolution updates on behalf of the RPC client
#[async_trait]
pub trait ResolutionSink: Send + Sync {
    async fn update_state(&self, state: ResolutionState) -> RegistryResult<()>;
}

/// Parsed dial target of the form `scheme://authority/endpoint`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Target {
    pub scheme: String,
    pub authority: String,
    /// Name of the service to resolve
    pub endpoint: String,
}

impl Target {
    pub fn new(scheme: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            authority: String::new(),
            endpoint: endpoint.into(),
        }
    }

    /// Targets without `://` are taken to be a bare endpoint.
    pub fn parse(target: &str) -> Self {
        let Some((scheme, rest)) = target.split_once("://") else {
            return Self {
                endpoint: target.to_string(),
                ..Default::default()
            };
        };
        let (authority, endpoint) = rest.split_once('/').unwrap_or(("", rest));
        Self {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            endpoint: endpoint.to_string(),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.authority, self.endpoint)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    /// Connected, bootstrap still running
    Built,
    Watching,
    Closed,
}

/// Builds resolvers for one scheme
#[derive(Clone)]
pub struct ResolverBuilder {
    scheme: String,
    connector: Arc<dyn Connector>,
}

impl std::fmt::Debug for ResolverBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverBuilder")
            .field("scheme", &self.scheme)
            .finish()
    }
}

impl ResolverBuilder {
    pub fn new(scheme: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            scheme: scheme.into(),
            connector,
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Open a connection for `target` and start pushing its address set to `sink`.
    ///
    /// The service resolved is the target's endpoint, whatever the scheme.
    pub async fn build(
        &self,
        target: &Target,
        sink: Arc<dyn ResolutionSink>,
    ) -> RegistryResult<Resolver> {
        if target.endpoint.is_empty() {
            return Err(RegistryError::InvalidTarget(target.to_string()));
        }
        if !target.scheme.is_empty() && target.scheme != self.scheme {
            log::warn!(
                "Building resolver for {target} with builder registered under {}",
                self.scheme
            );
        }

        let coordinator = self.connector.connect().await?;
        log::info!("Resolver built for {target}, resolving {}", target.endpoint);

        let cache = Arc::new(DiscoveryCache::new(target.endpoint.as_str(), FullKey));
        cache
            .start_with_listener(coordinator, Arc::new(SinkListener { sink }))
            .await;

        Ok(Resolver {
            target: target.clone(),
            cache,
        })
    }
}

struct SinkListener {
    sink: Arc<dyn ResolutionSink>,
}

#[async_trait]
impl ChangeListener for SinkListener {
    async fn on_change(&self, service_name: &str, instances: Vec<InstanceDescriptor>) {
        let state = ResolutionState::from_instances(&instances);
        log::info!("Updating addresses of {service_name}: {:?}", state.addresses);
        if let Err(e) = self.sink.update_state(state).await {
            log::warn!("Resolution update for {service_name} rejected: {e}");
        }
    }
}

/// Live resolution of one target
pub struct Resolver {
    target: Target,
    cache: Arc<DiscoveryCache>,
}

impl Resolver {
    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn service_name(&self) -> &str {
        self.cache.service_name()
    }

    pub fn state(&self) -> ResolverState {
        match self.cache.state() {
            WatchState::Starting => ResolverState::Built,
            WatchState::Watching => ResolverState::Watching,
            WatchState::Stale | WatchState::Closed => ResolverState::Closed,
        }
    }

    /// Addresses are always current as of the last applied event, so there is
    /// nothing to refresh.
    pub fn resolve_now(&self) {
        log::debug!("resolve_now for {} ignored", self.target);
    }

    pub async fn instances(&self) -> Vec<InstanceDescriptor> {
        self.cache.snapshot().await
    }

    /// Stop watching. Returns once the background task has exited.
    pub async fn close(&self) {
        self.cache.close().await;
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.cache.cancel();
    }
}

/// Feeds resolution states into a tonic balance channel.
pub struct BalanceChannelSink {
    tx: mpsc::Sender<Change<String, Endpoint>>,
    current: Mutex<HashSet<String>>,
}

impl BalanceChannelSink {
    pub fn new(tx: mpsc::Sender<Change<String, Endpoint>>) -> Self {
        Self {
            tx,
            current: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl ResolutionSink for BalanceChannelSink {
    async fn update_state(&self, state: ResolutionState) -> RegistryResult<()> {
        let next: HashSet<String> = state.addresses.into_iter().map(|a| a.addr).collect();
        let mut current = self.current.lock().await;

        let removed: Vec<String> = current.difference(&next).cloned().collect();
        for addr in removed {
            self.tx
                .send(Change::Remove(addr.clone()))
                .await
                .map_err(|e| RegistryError::Sink(e.to_string()))?;
            current.remove(&addr);
        }

        let added: Vec<String> = next.difference(&current).cloned().collect();
        for addr in added {
            let endpoint = match Endpoint::from_shared(addr.clone()) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    log::warn!("Skipping invalid endpoint {addr}: {e}");
                    continue;
                }
            };
            self.tx
                .send(Change::Insert(addr.clone(), endpoint))
                .await
                .map_err(|e| RegistryError::Sink(e.to_string()))?;
            current.insert(addr);
        }
        Ok(())
    }
}

/// Build a resolver for `target` that drives a tonic balance channel.
pub async fn balance_channel(
    builder: &ResolverBuilder,
    target: &Target,
    capacity: usize,
) -> RegistryResult<(Channel, Resolver)> {
    let (channel, tx) = Channel::balance_channel::<String>(capacity);
    let resolver = builder
        .build(target, Arc::new(BalanceChannelSink::new(tx)))
        .await?;
    Ok((channel, resolver))
}
