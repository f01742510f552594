use std::{env, future, path::PathBuf, process::exit};

use anyhow::Result;
use clap::Parser;
use tokio::signal::{
    self,
    unix::{SignalKind, signal as unix_signal},
};
use tracing::{Instrument, debug, error, info_span, warn};

mod address;
mod bootstrap;
mod config;
mod daemon;
mod error;
mod identity;
mod loader;
mod logging;
mod node_config;
mod server;
mod table;

use address::HostPrefixGenerator;
use bootstrap::{Bootstrap, Collaborators};
use config::{BootstrapConfig, LogLevel};
use loader::ScriptLoader;
use server::Server;
use table::PinnedMapOpener;

#[derive(Parser)]
#[command(name = "dataplane-agent")]
#[command(about = "Brings up the node dataplane and serves the control socket", long_about = None)]
struct Cli {
    /// Log level
    #[arg(short = 'l', long, value_enum, default_value_t = LogLevel::Info, env = "DATAPLANE_AGENT_LOG_LEVEL")]
    log_level: LogLevel,
    /// Socket path to listen for connections
    #[arg(short = 's', long = "socket", value_name = "PATH", default_value = config::DEFAULT_SOCKET_PATH, env = "DATAPLANE_AGENT_SOCKET")]
    socket_path: PathBuf,
    /// IPv6 address of the node; generated from a host IPv4 address when empty
    #[arg(short = 'n', long, value_name = "ADDR", default_value = "", env = "DATAPLANE_AGENT_NODE_ADDR")]
    node_addr: String,
    /// Device to snoop on; selects direct mode instead of vxlan
    #[arg(short = 'd', long, value_name = "IFACE", default_value = config::NO_DEVICE, env = "DATAPLANE_AGENT_DEVICE")]
    device: String,
    /// Library directory holding the dataplane loader
    #[arg(short = 'D', long, value_name = "DIR", default_value = config::DEFAULT_LIB_DIR, env = "DATAPLANE_AGENT_LIB_DIR")]
    lib_dir: PathBuf,
    /// Runtime data directory
    #[arg(short = 'R', long, value_name = "DIR", default_value = config::DEFAULT_RUN_DIR, env = "DATAPLANE_AGENT_RUN_DIR")]
    run_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_guard = logging::init(cli.log_level);
    let host = env::var("HOSTNAME").unwrap_or_default();

    if let Err(err) = run(cli).instrument(info_span!("agent", host = %host)).await {
        error!("{err:#}");
        drop(log_guard);
        exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = BootstrapConfig::new(
        cli.lib_dir,
        cli.run_dir,
        cli.socket_path,
        &cli.device,
        cli.log_level,
    );

    let prefixes = HostPrefixGenerator;
    let loader = ScriptLoader::new(&config.lib_dir, &config.run_dir);
    let maps = PinnedMapOpener::default();
    let mut bootstrap = Bootstrap::new(
        &config,
        Collaborators {
            prefixes: &prefixes,
            loader: &loader,
            maps: &maps,
        },
    );

    let dataplane = bootstrap.init_dataplane(&cli.node_addr).await?;
    debug!(stage = ?bootstrap.stage(), "dataplane bootstrap finished");
    bootstrap
        .serve(dataplane, Server::new, shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to wait for ctrl-c");
            future::pending::<()>().await;
        }
    };
    let terminate = async {
        match unix_signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
