//! IPMsg Node -- LAN messenger daemon.
//!
//! Usage:
//!   ipmsg-node                              # Run with default config
//!   ipmsg-node --config path.toml           # Run with custom config
//!   ipmsg-node send --host 10.0.0.5 hello   # One-shot TCP message
//!   ipmsg-node config                       # Print effective config

use std::sync::Arc;

use clap::{Parser, Subcommand};

use ipmsg_node::config::NodeConfig;
use ipmsg_node::delivery::DeliveryService;
use ipmsg_node::store::MemoryStore;
use ipmsg_node::{expand_tilde, Node};

#[derive(Parser)]
#[command(name = "ipmsg-node", about = "IPMsg-style LAN messenger node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.ipmsg/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Send one message over TCP and exit
    Send {
        /// Target host or IP
        #[arg(long)]
        host: String,
        /// Target TCP port (defaults to the configured tcp_port)
        #[arg(long)]
        port: Option<u16>,
        /// Message text
        message: String,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ipmsg_node=info,ipmsg_protocol=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Run) | None => run_node(cfg).await?,
        Some(Commands::Send { host, port, message }) => {
            let port = port.unwrap_or(cfg.network.tcp_port);
            let mut delivery = DeliveryService::from_config(&cfg);
            let seq = delivery.send_message(&message, &host, port).await?;
            delivery.disconnect_all();
            println!("sent {host}:{port} seq={seq}");
        }
        Some(Commands::Config) => {
            println!("# {}", config_path.display());
            print!("{}", toml::to_string_pretty(&cfg)?);
        }
    }

    Ok(())
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let node = Node::start(cfg, store).await?;

    tracing::info!("press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    node.shutdown().await;
    Ok(())
}
