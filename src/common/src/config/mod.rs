use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// File read by [`Configuration::load`] from the working directory
pub const CONFIG_FILE: &str = "registry.toml";

/// Prefix of environment overrides, nested keys split on `__`
pub const ENV_PREFIX: &str = "REGISTRY__";

/// Connection parameters for the coordination cluster
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Cluster endpoints, e.g. `127.0.0.1:2379`
    pub endpoints: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Bound on the reachability check made right after connecting
    #[serde(with = "humantime_serde")]
    pub status_timeout: Duration,
    /// How often the endpoint list is refreshed from the cluster members. `0s` disables.
    #[serde(with = "humantime_serde")]
    pub auto_sync_interval: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["127.0.0.1:2379".to_string()],
            connect_timeout: Duration::from_secs(5),
            status_timeout: Duration::from_secs(10),
            auto_sync_interval: Duration::from_secs(60),
        }
    }
}

/// Self-registration of this process
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RegistrationConfig {
    pub service_name: String,
    pub port: u32,
    /// Advertised address. The outbound interface address is used when unset.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(with = "humantime_serde", default = "default_ttl")]
    pub ttl: Duration,
}

fn default_ttl() -> Duration {
    Duration::from_secs(180)
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct DiscoveryConfig {
    /// Services to track, each as `etcd:<service name>`
    pub targets: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct Configuration {
    pub backend: BackendConfig,
    /// Registration is disabled when absent
    pub registration: Option<RegistrationConfig>,
    pub discovery: DiscoveryConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file(CONFIG_FILE)).extract().map_err(Box::new)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file(path)).extract().map_err(Box::new)
    }

    fn figment(file: figment::providers::Data<Toml>) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(file)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }
}
