use std::path::PathBuf;

use ::tracing::{error, info_span};
use accel_allocator::{config::AgentConfig, service::Service, tracing::setup_tracing};
use clap::Parser;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Name of the node this agent runs on")]
    node_name: Option<String>,

    #[arg(long, help = "Root of the kernel device tree")]
    sysfs_root: Option<String>,
}

fn load_config(cli: &Cli) -> anyhow::Result<AgentConfig> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::from_path(&path.to_string_lossy())?,
        None => AgentConfig::default(),
    };
    if let Some(node_name) = &cli.node_name {
        config.node_name = node_name.clone();
    }
    if let Some(sysfs_root) = &cli.sysfs_root {
        config.sysfs_root = sysfs_root.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error loading config: {err:?}");
            std::process::exit(1);
        }
    };

    setup_tracing(&config);

    let root_span = info_span!("accel-allocator", node = config.node_name.as_str());
    let _guard = root_span.enter();

    let mut service = match Service::new(config).await {
        Ok(service) => service,
        Err(err) => {
            error!("Error creating service: {:?}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = service.start().await {
        error!("Error starting service: {:?}", err);
        std::process::exit(1);
    }
}
