/// Error types that can occur while registering or discovering services
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Backend unreachable or unhealthy when opening a connection
    #[error("Failed to connect to coordination backend: {0}")]
    Connect(String),

    /// Lease grant, put or revoke failed
    #[error("Lease operation failed: {0}")]
    Lease(String),

    /// A registry value could not be decoded into an instance descriptor
    #[error("Failed to decode instance descriptor: {0}")]
    Decode(#[from] serde_json::Error),

    /// Selection was attempted against an empty cache
    #[error("No instances available for service {service_name}")]
    Empty { service_name: String },

    /// Registry key does not split into exactly a service name and an address
    #[error("Malformed registry key: {0}")]
    MalformedKey(String),

    /// No discovery cache has been opened for the service
    #[error("Discovery for service {0} is not initialized")]
    NotInitialized(String),

    /// Resolution target does not name a service
    #[error("Invalid resolution target: {0}")]
    InvalidTarget(String),

    /// Resolution state sink rejected an update
    #[error("Resolution sink error: {0}")]
    Sink(String),

    /// The local network address could not be determined
    #[error("Failed to determine local address: {0}")]
    LocalAddress(#[from] std::io::Error),

    /// Any other backend failure
    #[error("Coordination backend error: {0}")]
    Backend(String),
}

impl From<etcd_client::Error> for RegistryError {
    fn from(err: etcd_client::Error) -> Self {
        RegistryError::Backend(err.to_string())
    }
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;
