use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::cli::{CommonArgs, CommonCommands, utils};
use common::config::{Configuration, RegistrationConfig};
use registry::{
    EtcdConnector, EtcdOptions, InstanceDescriptor, Registration, RegistrationStatus,
    ServiceDirectory,
};

/// How often the tracked instance sets are logged
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "service-registry")]
#[command(about = "Registers this host with etcd and tracks the instances of other services")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Option<AgentCommands>,
}

#[derive(Subcommand)]
enum AgentCommands {
    #[command(flatten)]
    Common(CommonCommands),
}

impl Default for AgentCommands {
    fn default() -> Self {
        Self::Common(CommonCommands::Start)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    utils::init_logging(&cli.common);

    let config = utils::load_config(cli.common.config.as_ref())?;

    let command = cli.command.unwrap_or_default();
    let AgentCommands::Common(ref common_cmd) = command;
    if utils::handle_common_command(common_cmd, &config)? {
        return Ok(());
    }
    utils::validate_config(&config)?;

    run(config).await
}

fn etcd_options(config: &Configuration) -> EtcdOptions {
    EtcdOptions {
        endpoints: config.backend.endpoints.clone(),
        connect_timeout: config.backend.connect_timeout,
        status_timeout: config.backend.status_timeout,
        auto_sync_interval: config.backend.auto_sync_interval,
    }
}

async fn register(
    connector: &EtcdConnector,
    registration: &RegistrationConfig,
) -> Result<Registration> {
    let result = match &registration.address {
        Some(address) => {
            let descriptor =
                InstanceDescriptor::new(&registration.service_name, address, registration.port);
            Registration::register(connector, descriptor, registration.ttl).await
        }
        None => {
            Registration::register_local(
                connector,
                &registration.service_name,
                registration.port,
                registration.ttl,
            )
            .await
        }
    };
    result.with_context(|| format!("Failed to register {}", registration.service_name))
}

async fn run(config: Configuration) -> Result<()> {
    let connector = Arc::new(EtcdConnector::new(etcd_options(&config)));
    log::info!("Using etcd endpoints: {}", config.backend.endpoints.join(", "));

    let registration = match &config.registration {
        Some(registration_config) => {
            let registration = register(connector.as_ref(), registration_config).await?;
            log::info!(
                "Registered {} as {}",
                registration.key(),
                registration.descriptor().grpc_address()
            );
            Some(registration)
        }
        None => {
            log::info!("No registration configured");
            None
        }
    };

    let directory = ServiceDirectory::new(connector.clone());
    let opened = directory.open_targets(config.discovery.targets.as_slice()).await;
    log::info!("Tracking {} service(s): {}", opened.len(), opened.join(", "));

    let mut report = tokio::time::interval(REPORT_INTERVAL);
    let mut lease_watched = registration.is_some();

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for ctrl+c signal")?;
                log::info!("Shutting down");
                break;
            }
            _ = report.tick() => report_instances(&directory).await,
            status = lease_terminated(registration.as_ref()), if lease_watched => {
                lease_watched = false;
                if status == RegistrationStatus::LeaseLost {
                    log::error!("Registration lease lost, this instance is no longer advertised");
                }
            }
        }
    }

    if let Some(registration) = registration {
        if let Err(e) = registration.stop().await {
            log::error!("Failed to deregister {}: {e}", registration.key());
        }
    }
    directory.close_all().await;
    log::info!("Shutdown complete");
    Ok(())
}

async fn lease_terminated(registration: Option<&Registration>) -> RegistrationStatus {
    match registration {
        Some(registration) => registration.terminated().await,
        None => std::future::pending().await,
    }
}

async fn report_instances(directory: &ServiceDirectory) {
    for service_name in directory.service_names().await {
        let Ok(cache) = directory.get(&service_name).await else {
            continue;
        };
        let mut addresses: Vec<String> = cache
            .snapshot()
            .await
            .iter()
            .map(InstanceDescriptor::grpc_address)
            .collect();
        addresses.sort();
        if cache.is_stale() {
            log::warn!("{service_name} (stale, watch ended): [{}]", addresses.join(", "));
        } else {
            log::info!("{service_name}: [{}]", addresses.join(", "));
        }
    }
}
