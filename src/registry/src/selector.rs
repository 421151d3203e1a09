//! Read-only selection over a discovery cache.

use rand::seq::SliceRandom;

use crate::discovery::{DiscoveryCache, KeyStrategy};
use crate::error::{RegistryError, RegistryResult};
use crate::key::InstanceDescriptor;

/// Pick one instance uniformly at random.
///
/// Uses the thread-local generator, which is seeded once from the OS and never
/// reseeded per call.
pub async fn pick_random<S: KeyStrategy>(
    cache: &DiscoveryCache<S>,
) -> RegistryResult<InstanceDescriptor> {
    let instances = cache.snapshot().await;
    choose(&instances)
        .cloned()
        .ok_or_else(|| RegistryError::Empty {
            service_name: cache.service_name().to_string(),
        })
}

/// Every current instance, in no particular order.
pub async fn list_all<S: KeyStrategy>(cache: &DiscoveryCache<S>) -> Vec<InstanceDescriptor> {
    cache.snapshot().await
}

/// Uniform choice over an already taken snapshot.
pub fn choose(instances: &[InstanceDescriptor]) -> Option<&InstanceDescriptor> {
    instances.choose(&mut rand::thread_rng())
}
