//! etcd v3 implementation of the coordination backend.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions};
use tokio_util::sync::CancellationToken;

use super::{
    Connector, Coordinator, EventKind, KeepAliveAck, KeepAliveStream, KeyValue, LeaseHandle,
    LeaseId, Snapshot, WatchEvent, WatchStream,
};
use crate::error::{RegistryError, RegistryResult};

/// Lower bound for the renewal period of a keepalive stream.
const MIN_KEEPALIVE_PERIOD: Duration = Duration::from_millis(500);

/// Connection parameters for an etcd cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdOptions {
    /// Initial cluster endpoints, e.g. `127.0.0.1:2379`
    pub endpoints: Vec<String>,
    /// Deadline for establishing the first connection
    pub connect_timeout: Duration,
    /// Deadline for the health check issued right after connecting
    pub status_timeout: Duration,
    /// How often to refresh the endpoint list from the cluster membership. Zero disables.
    pub auto_sync_interval: Duration,
}

impl Default for EtcdOptions {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".to_string()],
            connect_timeout: Duration::from_secs(5),
            status_timeout: Duration::from_secs(10),
            auto_sync_interval: Duration::from_secs(60),
        }
    }
}

impl EtcdOptions {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            ..Default::default()
        }
    }
}

/// Opens a fresh [`EtcdCoordinator`] per call
#[derive(Debug, Clone)]
pub struct EtcdConnector {
    options: EtcdOptions,
}

impl EtcdConnector {
    pub fn new(options: EtcdOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &EtcdOptions {
        &self.options
    }
}

#[async_trait]
impl Connector for EtcdConnector {
    async fn connect(&self) -> RegistryResult<Arc<dyn Coordinator>> {
        let coordinator = EtcdCoordinator::connect(&self.options).await?;
        Ok(Arc::new(coordinator))
    }
}

/// One connection to an etcd cluster
pub struct EtcdCoordinator {
    client: Client,
    shutdown: CancellationToken,
}

impl EtcdCoordinator {
    /// Connect and verify the cluster answers a status request.
    ///
    /// Once connected the client reconnects on its own, so the only place an
    /// unreachable cluster surfaces as an error is here.
    pub async fn connect(options: &EtcdOptions) -> RegistryResult<Self> {
        if options.endpoints.is_empty() {
            return Err(RegistryError::Connect("no etcd endpoints configured".to_string()));
        }

        log::info!("Connecting to etcd endpoints {:?}", options.endpoints);

        let connect_options = ConnectOptions::new().with_connect_timeout(options.connect_timeout);
        let client = Client::connect(options.endpoints.as_slice(), Some(connect_options))
            .await
            .map_err(|e| {
                log::error!("Failed to connect to etcd {:?}: {e}", options.endpoints);
                RegistryError::Connect(e.to_string())
            })?;

        let mut status_client = client.clone();
        match tokio::time::timeout(options.status_timeout, status_client.status()).await {
            Ok(Ok(status)) => {
                log::info!(
                    "Connected to etcd {} (version {})",
                    options.endpoints[0],
                    status.version()
                );
            }
            Ok(Err(e)) => {
                log::error!("etcd status check failed: {e}");
                return Err(RegistryError::Connect(e.to_string()));
            }
            Err(_) => {
                return Err(RegistryError::Connect(format!(
                    "etcd status check timed out after {:?}",
                    options.status_timeout
                )));
            }
        }

        let shutdown = CancellationToken::new();
        if !options.auto_sync_interval.is_zero() {
            spawn_endpoint_sync(
                client.clone(),
                options.endpoints.clone(),
                options.auto_sync_interval,
                shutdown.child_token(),
            );
        }

        Ok(Self { client, shutdown })
    }
}

/// Periodically add newly joined cluster members to the client's endpoint set.
fn spawn_endpoint_sync(
    client: Client,
    endpoints: Vec<String>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut known: HashSet<String> = endpoints.into_iter().collect();
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let mut member_client = client.clone();
            let members = match member_client.member_list().await {
                Ok(resp) => resp,
                Err(e) => {
                    log::warn!("Failed to refresh etcd member list: {e}");
                    continue;
                }
            };
            for member in members.members() {
                for url in member.client_urls() {
                    if known.contains(url) {
                        continue;
                    }
                    match client.add_endpoint(url).await {
                        Ok(()) => {
                            log::info!("Added etcd endpoint {url}");
                            known.insert(url.clone());
                        }
                        Err(e) => log::warn!("Failed to add etcd endpoint {url}: {e}"),
                    }
                }
            }
        }
        log::debug!("etcd endpoint sync stopped");
    });
}

fn convert_event(event: &etcd_client::Event) -> Option<WatchEvent> {
    let kv = event.kv()?;
    let key = String::from_utf8_lossy(kv.key()).into_owned();
    match event.event_type() {
        EventType::Put => Some(WatchEvent::put(key, kv.value().to_vec())),
        EventType::Delete => Some(WatchEvent {
            kind: EventKind::Delete,
            prev_key: event
                .prev_kv()
                .map(|prev| String::from_utf8_lossy(prev.key()).into_owned()),
            key,
            value: Vec::new(),
        }),
    }
}

fn is_lease_not_found(err: &etcd_client::Error) -> bool {
    err.to_string().contains("requested lease not found")
}

#[async_trait]
impl Coordinator for EtcdCoordinator {
    async fn get_prefix(&self, prefix: &str) -> RegistryResult<Snapshot> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or_default();
        let kvs = resp
            .kvs()
            .iter()
            .map(|kv| KeyValue::new(String::from_utf8_lossy(kv.key()), kv.value()))
            .collect();
        Ok(Snapshot { kvs, revision })
    }

    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> RegistryResult<WatchStream> {
        let mut client = self.client.clone();
        let options = WatchOptions::new()
            .with_prefix()
            .with_prev_key()
            .with_start_revision(start_revision);
        let (watcher, mut stream) = client.watch(prefix, Some(options)).await?;
        let prefix = prefix.to_string();
        let shutdown = self.shutdown.clone();

        Ok(Box::pin(async_stream::stream! {
            // cancels the server-side watch when the stream is dropped
            let _watcher = watcher;
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = stream.message() => message,
                };
                match message {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            log::warn!("etcd watch on {prefix} canceled: {}", resp.cancel_reason());
                            break;
                        }
                        let batch: Vec<WatchEvent> =
                            resp.events().iter().filter_map(convert_event).collect();
                        if !batch.is_empty() {
                            yield batch;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("etcd watch on {prefix} failed: {e}");
                        break;
                    }
                }
            }
        }))
    }

    async fn grant(&self, ttl: Duration) -> RegistryResult<LeaseHandle> {
        let mut client = self.client.clone();
        let ttl_secs = ttl.as_secs().max(1) as i64;
        let resp = client
            .lease_grant(ttl_secs, None)
            .await
            .map_err(|e| RegistryError::Lease(e.to_string()))?;
        Ok(LeaseHandle {
            id: resp.id(),
            ttl: Duration::from_secs(resp.ttl().max(0) as u64),
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> RegistryResult<()> {
        let mut client = self.client.clone();
        client
            .put(key, value, Some(PutOptions::new().with_lease(lease)))
            .await
            .map_err(|e| RegistryError::Lease(e.to_string()))?;
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> RegistryResult<KeepAliveStream> {
        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease)
            .await
            .map_err(|e| RegistryError::Lease(e.to_string()))?;
        let shutdown = self.shutdown.clone();

        Ok(Box::pin(async_stream::stream! {
            loop {
                if let Err(e) = keeper.keep_alive().await {
                    log::warn!("Failed to send keepalive for lease {lease}: {e}");
                    break;
                }
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = stream.message() => message,
                };
                match message {
                    Ok(Some(resp)) => {
                        // a non-positive TTL means the lease is already gone
                        if resp.ttl() <= 0 {
                            break;
                        }
                        let ttl = resp.ttl();
                        yield KeepAliveAck { id: resp.id(), ttl };
                        let period =
                            (Duration::from_secs(ttl as u64) / 3).max(MIN_KEEPALIVE_PERIOD);
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(period) => {}
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("Keepalive stream for lease {lease} failed: {e}");
                        break;
                    }
                }
            }
        }))
    }

    async fn revoke(&self, lease: LeaseId) -> RegistryResult<()> {
        let mut client = self.client.clone();
        match client.lease_revoke(lease).await {
            Ok(_) => Ok(()),
            Err(e) if is_lease_not_found(&e) => {
                log::debug!("Lease {lease} already gone");
                Ok(())
            }
            Err(e) => Err(RegistryError::Lease(e.to_string())),
        }
    }

    async fn status(&self) -> RegistryResult<()> {
        let mut client = self.client.clone();
        client.status().await?;
        Ok(())
    }

    /// Ends the endpoint sync task and every watch and keepalive stream opened here.
    async fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for EtcdCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = EtcdOptions::default();
        assert_eq!(options.endpoints, vec!["127.0.0.1:2379".to_string()]);
        assert_eq!(options.connect_timeout, Duration::from_secs(5));
        assert_eq!(options.status_timeout, Duration::from_secs(10));
        assert_eq!(options.auto_sync_interval, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_connect_without_endpoints_fails_fast() {
        let options = EtcdOptions::new(Vec::new());
        let result = EtcdCoordinator::connect(&options).await;
        assert!(matches!(result, Err(RegistryError::Connect(_))));
    }
}
