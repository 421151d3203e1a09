//! Self-registration with lease renewal.
//!
//! A [`Registration`] owns one lease and one connection. The instance is written under
//! the lease and a background task consumes the keepalive acknowledgements until it is
//! stopped or the lease is lost. Both ways out revoke the lease exactly once and close
//! the connection.

use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{Connector, Coordinator, KeepAliveStream, LeaseHandle};
use crate::error::{RegistryError, RegistryResult};
use crate::key::{self, InstanceDescriptor};

/// Lease TTL used when the caller does not pick one. The backend renews at roughly a
/// third of this.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    /// Lease is being renewed
    Active,
    /// The keepalive stream closed underneath us
    LeaseLost,
    /// Stopped on request
    Stopped,
}

/// Handle to a registered instance
pub struct Registration {
    descriptor: InstanceDescriptor,
    key: String,
    lease: LeaseHandle,
    cancel: CancellationToken,
    status: watch::Receiver<RegistrationStatus>,
    task: Mutex<Option<JoinHandle<RegistryResult<()>>>>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("key", &self.key)
            .field("lease", &self.lease)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl Registration {
    /// Connect, grant a lease, write the instance under it and start renewing.
    ///
    /// Fails with a connect error when the backend is unreachable and with a lease
    /// error when the grant or the write is rejected.
    pub async fn register(
        connector: &dyn Connector,
        descriptor: InstanceDescriptor,
        ttl: Duration,
    ) -> RegistryResult<Self> {
        let coordinator = connector.connect().await?;
        match Self::start(coordinator.clone(), descriptor, ttl).await {
            Ok(registration) => Ok(registration),
            Err(e) => {
                log::error!("Registration failed: {e}");
                coordinator.close().await;
                Err(e)
            }
        }
    }

    /// Register `service_name` at this host's outbound address.
    pub async fn register_local(
        connector: &dyn Connector,
        service_name: &str,
        port: u32,
        ttl: Duration,
    ) -> RegistryResult<Self> {
        let address = local_address()?;
        let descriptor = InstanceDescriptor::new(service_name, address.to_string(), port);
        Self::register(connector, descriptor, ttl).await
    }

    async fn start(
        coordinator: Arc<dyn Coordinator>,
        descriptor: InstanceDescriptor,
        ttl: Duration,
    ) -> RegistryResult<Self> {
        let key = descriptor.key();
        let value = key::encode(&descriptor)?;

        let lease = coordinator.grant(ttl).await?;
        let acks = match put_and_keep_alive(coordinator.as_ref(), &key, value, &lease).await {
            Ok(acks) => acks,
            Err(e) => {
                if let Err(revoke_err) = coordinator.revoke(lease.id).await {
                    log::warn!("Failed to revoke lease {} after error: {revoke_err}", lease.id);
                }
                return Err(e);
            }
        };

        log::info!("Registered {key} under lease {} (ttl {:?})", lease.id, lease.ttl);

        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(RegistrationStatus::Active);
        let task = tokio::spawn(keepalive_loop(
            coordinator,
            key.clone(),
            lease,
            acks,
            cancel.clone(),
            status_tx,
        ));

        Ok(Self {
            descriptor,
            key,
            lease,
            cancel,
            status: status_rx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn descriptor(&self) -> &InstanceDescriptor {
        &self.descriptor
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lease(&self) -> LeaseHandle {
        self.lease
    }

    pub fn status(&self) -> RegistrationStatus {
        *self.status.borrow()
    }

    /// Wait until the registration is no longer active, whatever the reason.
    pub async fn terminated(&self) -> RegistrationStatus {
        let mut status = self.status.clone();
        match status.wait_for(|s| *s != RegistrationStatus::Active).await {
            Ok(s) => *s,
            // sender dropped: the task is gone
            Err(_) => *self.status.borrow(),
        }
    }

    /// Stop renewing, revoke the lease and release the connection.
    ///
    /// Returns the revoke result. After the lease was already lost this does nothing.
    /// A caller racing another `stop` returns once that one has revoked and released.
    pub async fn stop(&self) -> RegistryResult<()> {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        let Some(task) = task else {
            self.terminated().await;
            return Ok(());
        };
        match task.await {
            Ok(result) => result,
            Err(e) => Err(RegistryError::Lease(format!("keepalive task failed: {e}"))),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        // the task still revokes the lease on its own
        self.cancel.cancel();
    }
}

async fn put_and_keep_alive(
    coordinator: &dyn Coordinator,
    key: &str,
    value: Vec<u8>,
    lease: &LeaseHandle,
) -> RegistryResult<KeepAliveStream> {
    coordinator.put(key, value, lease.id).await?;
    coordinator.keep_alive(lease.id).await
}

async fn keepalive_loop(
    coordinator: Arc<dyn Coordinator>,
    key: String,
    lease: LeaseHandle,
    mut acks: KeepAliveStream,
    cancel: CancellationToken,
    status: watch::Sender<RegistrationStatus>,
) -> RegistryResult<()> {
    let (result, final_status) = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::info!("Stopping registration of {key}, revoking lease {}", lease.id);
                let result = coordinator.revoke(lease.id).await;
                if let Err(e) = &result {
                    log::error!("Failed to revoke lease {}: {e}", lease.id);
                }
                break (result, RegistrationStatus::Stopped);
            }
            ack = acks.next() => match ack {
                Some(ack) => {
                    log::debug!("Lease {} for {key} renewed, ttl {}s", ack.id, ack.ttl);
                }
                None => {
                    log::warn!("Keepalive stream for {key} closed, lease {} lost", lease.id);
                    if let Err(e) = coordinator.revoke(lease.id).await {
                        log::warn!("Best-effort revoke of lease {} failed: {e}", lease.id);
                    }
                    break (Ok(()), RegistrationStatus::LeaseLost);
                }
            }
        }
    };

    drop(acks);
    coordinator.close().await;
    let _ = status.send(final_status);
    result
}

/// Address of the interface this host uses for outbound traffic.
///
/// No packet is sent; connecting a UDP socket only selects a route.
pub fn local_address() -> RegistryResult<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    Ok(socket.local_addr()?.ip())
}
