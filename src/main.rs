use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use kubevisor::discovery::{find_binary, SearchHints};
use kubevisor::harness::{start_handler, BringUp, BringUpOptions, ControlPlane};
use kubevisor::pki::OpensslIssuer;
use kubevisor::services::{build_plan, ServiceKind};
use kubevisor::types::Ports;
use kubevisor::{Config, SupervisorError};

#[derive(Parser)]
#[command(name = "kubevisor")]
#[command(about = "Local Kubernetes control plane supervisor", long_about = None)]
#[command(version)]
struct Cli {
    #[arg(long, global = true, help = "TOML config file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Directory holding the Kubernetes binaries")]
    binary_root: Option<PathBuf>,

    #[arg(long, global = true, help = "Working directory (temporary when unset)")]
    workdir: Option<PathBuf>,

    #[arg(long, global = true)]
    port_base: Option<u16>,

    #[arg(long, global = true, help = "Health rounds before giving up")]
    tries: Option<u32>,

    #[arg(long, global = true, help = "Print child output instead of logging it")]
    print_output: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring up services (all by default) and supervise them until Ctrl-C
    Up {
        #[arg(help = "Services to run")]
        services: Vec<ServiceKind>,
    },
    /// Start one service with its prerequisites and supervise it
    Start {
        service: ServiceKind,
    },
    /// Show the start order and port layout without launching anything
    Plan {
        services: Vec<ServiceKind>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Up { services } => up(&config, &requested(services)).await?,
        Commands::Start { service } => start(&config, service).await?,
        Commands::Plan { services } => plan(&config, &requested(services))?,
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(root) = &cli.binary_root {
        config.binary_root = Some(root.clone());
    }
    if let Some(workdir) = &cli.workdir {
        config.workdir = Some(workdir.clone());
    }
    if let Some(port_base) = cli.port_base {
        config.port_base = port_base;
    }
    if let Some(tries) = cli.tries {
        config.health_check_tries = tries;
    }
    config.print_output |= cli.print_output;
    Ok(config)
}

fn requested(services: Vec<ServiceKind>) -> Vec<ServiceKind> {
    if services.is_empty() {
        ServiceKind::ALL.to_vec()
    } else {
        services
    }
}

fn issuer(config: &Config) -> Result<Arc<OpensslIssuer>> {
    let openssl = find_binary("openssl", &SearchHints::new(config.binary_root.clone()))
        .context("credentials are issued with the openssl binary")?;
    Ok(Arc::new(OpensslIssuer::new(openssl)))
}

async fn up(config: &Config, services: &[ServiceKind]) -> Result<()> {
    let options = BringUpOptions::from_config("control-plane", config);
    let plane = ControlPlane::up(&options, services, issuer(config)?)
        .await
        .context("bringing up the control plane")?;

    supervise(plane.bring_up()).await;
    Ok(())
}

async fn start(config: &Config, service: ServiceKind) -> Result<()> {
    let options = BringUpOptions::from_config(service.as_str(), config);
    let bring_up = start_handler(&options, service, issuer(config)?)
        .await
        .with_context(|| format!("starting {}", service))?;

    supervise(&bring_up).await;
    Ok(())
}

/// Logs health changes until Ctrl-C or the first crash.
async fn supervise(bring_up: &BringUp) {
    println!("Bring-up {} ready: {:?}", bring_up.id(), bring_up.chain().names());
    println!("Workdir: {:?}", bring_up.env().workdir());
    println!("Kubeconfig: {:?}", bring_up.credentials().kubeconfig);

    let monitors = bring_up.monitor();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                log::error!("waiting for Ctrl-C failed: {}", e);
            }
        }
        Some(exit) = bring_up.next_crash() => {
            let crash = SupervisorError::Crash {
                service: exit.service.clone(),
                exit,
            };
            log::error!("{}, shutting down", crash);
        }
    }

    bring_up.shutdown().await;
    for monitor in monitors {
        let _ = monitor.await;
    }
}

fn plan(config: &Config, services: &[ServiceKind]) -> Result<()> {
    let ports = Ports::from_base(config.port_base)
        .with_context(|| format!("port base {} is too high", config.port_base))?;

    println!("Start order:");
    for (i, kind) in build_plan(services).iter().enumerate() {
        println!("  {}. {}", i + 1, kind);
    }
    println!("\nPorts:");
    for (name, port) in ports.all() {
        println!("  {:<32} {}", name, port);
    }
    Ok(())
}
