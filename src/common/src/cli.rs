use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Common CLI arguments shared across registry binaries
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug, Clone, Default, PartialEq, Eq)]
pub enum CommonCommands {
    /// Register and watch the configured services (default behavior)
    #[default]
    Start,
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information and exit
    Version,
}

pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Initialize logging based on CLI arguments. `RUST_LOG` wins when set.
    pub fn init_logging(args: &CommonArgs) {
        let level = if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            "info"
        };

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        match config_path {
            Some(path) => {
                log::info!("Loading configuration from: {}", path.display());
                Configuration::load_from_path(path).context("Failed to load configuration")
            }
            None => Configuration::load().context("Failed to load configuration"),
        }
    }

    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            println!("Service Registry Configuration:");
            println!("===============================");
            println!("Backend endpoints: {}", config.backend.endpoints.join(", "));
            println!("Connect timeout: {:?}", config.backend.connect_timeout);
            println!("Status timeout: {:?}", config.backend.status_timeout);
            println!("Endpoint sync interval: {:?}", config.backend.auto_sync_interval);

            if let Some(registration) = &config.registration {
                println!(
                    "Registration: {} on port {} (address {}, ttl {:?})",
                    registration.service_name,
                    registration.port,
                    registration.address.as_deref().unwrap_or("auto"),
                    registration.ttl
                );
            } else {
                println!("Registration: disabled");
            }

            if config.discovery.targets.is_empty() {
                println!("Discovery: no targets");
            } else {
                println!("Discovery targets: {}", config.discovery.targets.join(", "));
            }
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        log::info!("Validating configuration...");

        if config.backend.endpoints.is_empty() {
            anyhow::bail!("Backend endpoints cannot be empty");
        }
        if config.backend.endpoints.iter().any(|e| e.trim().is_empty()) {
            anyhow::bail!("Backend endpoints cannot contain empty entries");
        }

        if let Some(registration) = &config.registration {
            if registration.service_name.is_empty() {
                anyhow::bail!("Registration service name cannot be empty");
            }
            if registration.service_name.contains('/') {
                anyhow::bail!(
                    "Registration service name {} cannot contain '/'",
                    registration.service_name
                );
            }
            // leases are granted in whole seconds
            if registration.ttl.as_secs() == 0 {
                anyhow::bail!("Registration TTL must be at least one second");
            }
        }

        for target in &config.discovery.targets {
            match target.split_once(':') {
                Some(("etcd", name)) if !name.is_empty() && !name.contains('/') => {}
                _ => anyhow::bail!("Invalid discovery target {target}, expected etcd:<service>"),
            }
        }

        log::info!("Configuration validation passed");
        Ok(())
    }

    /// Handle commands that don't start the agent. Returns whether the command was handled.
    pub fn handle_common_command(command: &CommonCommands, config: &Configuration) -> Result<bool> {
        match command {
            CommonCommands::Config { json } => {
                display_config(config, *json)?;
                Ok(true)
            }
            CommonCommands::Validate => {
                validate_config(config)?;
                Ok(true)
            }
            CommonCommands::Version => {
                println!("{}", version_info());
                Ok(true)
            }
            CommonCommands::Start => Ok(false),
        }
    }

    pub fn version_info() -> String {
        format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}
