//! Registry keys and the instance descriptor stored under them.
//!
//! Every running instance is stored under `"<service name>/<address>"`, with a JSON
//! value of the form `{"Name": .., "Ip": .., "Port": ..}`. Both the registration side
//! and the discovery side go through this module so they agree on the mapping.

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, RegistryResult};

/// Separator between the service name and the instance address in a registry key.
pub const KEY_SEPARATOR: char = '/';

/// Name, address and port of one running instance of a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct InstanceDescriptor {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Ip")]
    address: String,
    #[serde(rename = "Port")]
    port: u32,
}

impl InstanceDescriptor {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u32) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    /// Registry key this instance is stored under.
    pub fn key(&self) -> String {
        host_key(&self.name, &self.address)
    }

    /// Address in the form tonic endpoints expect, e.g. `http://10.0.0.1:8080`.
    pub fn grpc_address(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}

/// Build the registry key for an instance of `service_name` at `address`.
pub fn host_key(service_name: &str, address: &str) -> String {
    format!("{service_name}{KEY_SEPARATOR}{address}")
}

/// Split a registry key into service name and address.
///
/// Returns `None` unless the key has exactly two non-empty components.
pub fn parse_key(key: &str) -> Option<(String, String)> {
    split_key(key).ok()
}

/// Like [`parse_key`], for callers that want to report the offending key.
pub fn split_key(key: &str) -> RegistryResult<(String, String)> {
    let malformed = || RegistryError::MalformedKey(key.to_string());
    let mut parts = key.split(KEY_SEPARATOR);
    let name = parts.next().ok_or_else(malformed)?;
    let address = parts.next().ok_or_else(malformed)?;
    if parts.next().is_some() || name.is_empty() || address.is_empty() {
        return Err(malformed());
    }
    Ok((name.to_string(), address.to_string()))
}

/// Prefix under which all instances of `service_name` live.
pub fn service_prefix(service_name: &str) -> String {
    format!("{service_name}{KEY_SEPARATOR}")
}

/// Serialize a descriptor into its registry value.
pub fn encode(descriptor: &InstanceDescriptor) -> RegistryResult<Vec<u8>> {
    Ok(serde_json::to_vec(descriptor)?)
}

/// Deserialize a registry value.
pub fn decode(value: &[u8]) -> RegistryResult<InstanceDescriptor> {
    Ok(serde_json::from_slice(value)?)
}
