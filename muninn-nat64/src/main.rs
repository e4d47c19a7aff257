#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use muninn_nat64_lib::config::load_from_path;
use muninn_nat64_lib::ctrl::{self, CtrlHandler};
use muninn_nat64_lib::hooks::{RecordingEgress, StaticRouter};
use muninn_nat64_lib::instance::{InstanceRegistry, Xlator, XlatorKind};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// The timer wheel's coarse resolution.
const TICK_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(author, version, about = "Stateful NAT64 translator daemon")]
struct Cli {
    /// Path to configuration TOML file
    #[arg(short, long, value_name = "FILE", default_value = "demos/config/basic.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let cfg = match load_from_path(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(%err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    info!(socket = %cfg.socket_path.display(), instances = cfg.instances.len(),
        "configuration loaded");

    let registry = Arc::new(InstanceRegistry::new());
    let egress = Arc::new(RecordingEgress::new());
    let router = Arc::new(StaticRouter::default());

    for instance in &cfg.instances {
        let xlator = Xlator::from_config(instance, egress.clone(), router.clone());
        if let Err(err) = registry.add(XlatorKind::Nat64, xlator) {
            error!(%err, instance = %instance.name, "failed to create instance");
            std::process::exit(1);
        }
    }

    let handler = Arc::new(CtrlHandler::new(registry.clone(), egress, router));

    let ticker = {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                registry.tick_all(Instant::now());
            }
        })
    };

    let socket_path = cfg.socket_path.clone();
    let server = tokio::spawn(async move {
        if let Err(err) = ctrl::run_server(&socket_path, handler).await {
            error!(%err, "control plane server exited");
        }
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("shutting down"),
        Err(err) => error!(%err, "failed to listen for the shutdown signal"),
    }

    server.abort();
    ticker.abort();
    let _ = std::fs::remove_file(&cfg.socket_path);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
