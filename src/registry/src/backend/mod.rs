//! Coordination backend boundary.
//!
//! The registration and discovery sides only talk to the backend through
//! [`Coordinator`]. Each component opens its own connection through a [`Connector`]
//! and owns it exclusively until it closes it.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::error::RegistryResult;

pub mod etcd;
pub mod memory;

pub use etcd::{EtcdConnector, EtcdCoordinator, EtcdOptions};
pub use memory::{MemoryBackend, MemoryCoordinator};

/// Backend lease identifier
pub type LeaseId = i64;

/// A granted lease and the TTL it was granted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseHandle {
    pub id: LeaseId,
    pub ttl: Duration,
}

/// One key/value pair as returned by a prefix read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Result of a prefix read, together with the store revision it was taken at.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub kvs: Vec<KeyValue>,
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// Notification for a key under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// Empty for deletes
    pub value: Vec<u8>,
    /// Key of the previous value, when the backend reports one
    pub prev_key: Option<String>,
}

impl WatchEvent {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: EventKind::Put,
            key: key.into(),
            value: value.into(),
            prev_key: None,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            kind: EventKind::Delete,
            prev_key: Some(key.clone()),
            key,
            value: Vec::new(),
        }
    }

    /// Key that was removed by a delete event. Falls back to the event key when the
    /// backend did not send the previous key-value.
    pub fn deleted_key(&self) -> &str {
        self.prev_key.as_deref().unwrap_or(&self.key)
    }
}

/// Acknowledgement of a lease renewal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveAck {
    pub id: LeaseId,
    /// Remaining TTL in seconds as reported by the backend
    pub ttl: i64,
}

/// Event batches in the order the backend delivered them. The stream ends when the
/// watch is closed by either side.
pub type WatchStream = Pin<Box<dyn Stream<Item = Vec<WatchEvent>> + Send>>;

/// Renewal acknowledgements. The stream ends when the lease can no longer be renewed.
pub type KeepAliveStream = Pin<Box<dyn Stream<Item = KeepAliveAck> + Send>>;

/// Operations the registry needs from the coordination backend
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Read every key under `prefix`
    async fn get_prefix(&self, prefix: &str) -> RegistryResult<Snapshot>;

    /// Watch every key under `prefix`, starting at `start_revision`
    async fn watch_prefix(&self, prefix: &str, start_revision: i64) -> RegistryResult<WatchStream>;

    async fn grant(&self, ttl: Duration) -> RegistryResult<LeaseHandle>;

    async fn put(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> RegistryResult<()>;

    /// Keep a lease alive. Renewal cadence is up to the backend.
    async fn keep_alive(&self, lease: LeaseId) -> RegistryResult<KeepAliveStream>;

    /// Revoke a lease. Revoking an unknown or already expired lease is not an error.
    async fn revoke(&self, lease: LeaseId) -> RegistryResult<()>;

    /// Check that the backend is reachable and healthy
    async fn status(&self) -> RegistryResult<()>;

    /// Release the connection. Streams opened through it end.
    async fn close(&self);
}

/// Opens new, exclusively owned connections to the coordination backend
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> RegistryResult<Arc<dyn Coordinator>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deleted_key_prefers_prev_key() {
        let event = WatchEvent {
            kind: EventKind::Delete,
            key: "server1/10.0.0.1".to_string(),
            value: Vec::new(),
            prev_key: Some("server1/10.0.0.9".to_string()),
        };
        assert_eq!(event.deleted_key(), "server1/10.0.0.9");

        let event = WatchEvent {
            prev_key: None,
            ..event
        };
        assert_eq!(event.deleted_key(), "server1/10.0.0.1");
    }
}
