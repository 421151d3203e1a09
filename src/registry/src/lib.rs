pub mod backend;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod key;
pub mod registration;
pub mod resolver;
pub mod selector;

pub use backend::{Connector, Coordinator, EtcdConnector, EtcdOptions, MemoryBackend};
pub use directory::ServiceDirectory;
pub use discovery::{AddressKey, DiscoveryCache, FullKey, KeyStrategy, WatchState};
pub use error::{RegistryError, RegistryResult};
pub use key::InstanceDescriptor;
pub use registration::{DEFAULT_LEASE_TTL, Registration, RegistrationStatus};
pub use resolver::{
    BalanceChannelSink, ResolutionSink, ResolutionState, Resolver, ResolverBuilder, Target,
};
