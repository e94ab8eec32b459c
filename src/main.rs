//! Chain Gateway CLI Application
//!
//! Runs a gateway node or sends one-shot RPCs to a running one.

use chain_gateway::core::MemoryChain;
use chain_gateway::network::message::{MAX_SHARE_PEERS_LEN, RPC_SHARE_PEERS};
use chain_gateway::network::{rpc, Address, ConnConfig, Gateway, GatewayConfig, ReaderRpc};
use clap::{Parser, Subcommand};
use std::sync::Arc;

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "gateway")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Peer-to-peer gateway for a blockchain node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a gateway node
    Start {
        /// Host to listen on
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Host announced to peers; required when listening on 0.0.0.0
        #[arg(long)]
        advertise_host: Option<String>,

        /// Port to listen on
        #[arg(short, long, default_value = "9981")]
        port: u16,

        /// Seed node to bootstrap from (host:port)
        #[arg(short, long)]
        seed: Option<String>,

        /// Maximum number of peers
        #[arg(long)]
        max_peers: Option<usize>,
    },

    /// Check that a node answers and print its protocol version
    Ping {
        /// Node address (host:port)
        addr: String,
    },

    /// Ask a node for the peers it knows
    Peers {
        /// Node address (host:port)
        addr: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(run(cli.command))
        .map_err(|e| -> Box<dyn std::error::Error> { e })
}

async fn run(command: Commands) -> CliResult<()> {
    match command {
        Commands::Start {
            host,
            advertise_host,
            port,
            seed,
            max_peers,
        } => {
            let defaults = GatewayConfig::default();
            let config = GatewayConfig {
                host,
                advertise_host,
                port,
                max_peers: max_peers.unwrap_or(defaults.max_peers),
                ..defaults
            };

            let gateway = Gateway::bind(config, Arc::new(MemoryChain::new())).await?;
            gateway.serve();
            println!("🌐 Gateway listening on {}", gateway.address());

            if let Some(seed) = seed {
                let seed = Address::parse(&seed)?;
                gateway.bootstrap(&seed).await?;
                if let Err(e) = gateway.synchronize().await {
                    log::warn!("Initial synchronization failed: {}", e);
                }
            }

            tokio::signal::ctrl_c().await?;
            println!("\n📴 Shutting down gateway...");
            gateway.shutdown().await;
        }

        Commands::Ping { addr } => {
            let addr = Address::parse(&addr)?;
            let version = rpc::ping(&addr, &ConnConfig::default()).await?;
            println!("✅ {} speaks protocol version {}", addr, version);
        }

        Commands::Peers { addr } => {
            let addr = Address::parse(&addr)?;
            let mut reader = ReaderRpc::<Vec<Address>>::new(MAX_SHARE_PEERS_LEN);
            rpc::call(&addr, RPC_SHARE_PEERS, &mut reader, &ConnConfig::default()).await?;

            let peers = reader.into_inner().unwrap_or_default();
            println!("📋 {} knows {} peers:", addr, peers.len());
            for peer in peers {
                println!("   {}", peer);
            }
        }
    }

    Ok(())
}
