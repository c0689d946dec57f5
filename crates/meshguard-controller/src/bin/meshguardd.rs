//! meshguard daemon: starts the control plane and its HTTP surface

use clap::{Arg, ArgAction, Command};
use meshguard_common::config::MeshConfig;
use meshguard_controller::{Controller, Server};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Command::new("meshguardd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Self-healing mesh control plane")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (JSON)")
                .required(false),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Bind address (default: 0.0.0.0:8080)")
                .required(false),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    init_tracing(matches.get_flag("verbose"))?;

    let config = load_config(matches.get_one::<String>("config"))?;
    let bind_addr = matches
        .get_one::<String>("bind")
        .map(String::as_str)
        .unwrap_or("0.0.0.0:8080");

    info!("starting meshguardd v{}", env!("CARGO_PKG_VERSION"));

    let controller = match Controller::new(config) {
        Ok(controller) => Arc::new(controller),
        Err(e) => {
            error!(error = %e, "failed to assemble control plane");
            std::process::exit(1);
        }
    };
    controller.start();

    let shutdown_controller = controller.clone();
    let shutdown = async move {
        if tokio::signal::ctrl_c().await.is_err() {
            error!("failed to listen for shutdown signal");
            return;
        }
        info!("shutdown signal received, stopping gracefully");
        shutdown_controller.stop().await;
    };

    let server = Server::new(controller);
    if let Err(e) = server.run(bind_addr, shutdown).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("meshguard={0},meshguardd={0}", default)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn load_config(path: Option<&String>) -> Result<MeshConfig, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            serde_json::from_str(&text)?
        }
        None => MeshConfig::default(),
    };
    config.validate()?;
    Ok(config)
}
