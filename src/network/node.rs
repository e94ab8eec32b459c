//! Gateway node
//!
//! Ties the networking components together: binds the listener, registers the
//! built-in RPCs, runs the accept loop and the periodic peer maintenance.

use crate::core::{Block, ConsensusSet, Transaction};
use crate::network::address::{Address, AddressError};
use crate::network::connection::{Conn, ConnConfig};
use crate::network::error::GatewayResult;
use crate::network::message::{
    RPC_ADD_ME, RPC_PING, RPC_RELAY_BLOCK, RPC_RELAY_TRANSACTION, RPC_SEND_BLOCKS, RPC_SHARE_PEERS,
};
use crate::network::peer::{AddMeHandler, PeerConfig, PeerManager, SharePeersHandler};
use crate::network::relay::{
    BroadcastReport, RelayBlockHandler, RelayBroadcaster, RelayTransactionHandler,
};
use crate::network::rpc::{self, PingHandler, RpcCall, RpcHandler, RpcRegistry};
use crate::network::sync::{SendBlocksHandler, SyncEngine, DEFAULT_MAX_SYNC_ROUNDS};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Host to listen on
    pub host: String,
    /// Host given to peers in AddMe; defaults to `host`
    pub advertise_host: Option<String>,
    /// Port to listen on; 0 picks a free port
    pub port: u16,
    pub max_peers: usize,
    pub min_peers: usize,
    pub address_book_capacity: usize,
    /// Period of the fill / gossip / ping loop
    pub gossip_interval: Duration,
    pub max_sync_rounds: usize,
    pub conn: ConnConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let peers = PeerConfig::default();
        Self {
            host: "127.0.0.1".to_string(),
            advertise_host: None,
            port: 9981,
            max_peers: peers.max_peers,
            min_peers: peers.min_peers,
            address_book_capacity: peers.address_book_capacity,
            gossip_interval: Duration::from_secs(60),
            max_sync_rounds: DEFAULT_MAX_SYNC_ROUNDS,
            conn: peers.conn,
        }
    }
}

impl GatewayConfig {
    fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            max_peers: self.max_peers,
            min_peers: self.min_peers,
            address_book_capacity: self.address_book_capacity,
            conn: self.conn,
        }
    }
}

/// Read-only snapshot of the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayInfo {
    pub address: Address,
    pub peers: Vec<Address>,
}

/// The P2P gateway
pub struct Gateway {
    config: GatewayConfig,
    address: Address,
    /// Taken by `serve`
    listener: Mutex<Option<TcpListener>>,
    registry: Arc<RpcRegistry>,
    consensus: Arc<dyn ConsensusSet>,
    peers: Arc<PeerManager>,
    sync: Arc<SyncEngine>,
    relay: Arc<RelayBroadcaster>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Bind the listener and register the built-in RPCs
    pub async fn bind(config: GatewayConfig, consensus: Arc<dyn ConsensusSet>) -> GatewayResult<Self> {
        // Peers check AddMe against the caller's real host, so a wildcard
        // would never be accepted
        let advertised = config.advertise_host.as_deref().unwrap_or(&config.host);
        if Address::from_parts(advertised, config.port)?.is_unspecified() {
            return Err(AddressError::Unspecified(advertised.to_string()).into());
        }

        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let port = listener.local_addr()?.port();
        let address = Address::from_parts(advertised, port)?;

        let peers = Arc::new(PeerManager::new(address.clone(), config.peer_config()));
        let sync = Arc::new(SyncEngine::new(
            consensus.clone(),
            peers.clone(),
            config.max_sync_rounds,
        ));
        let relay = Arc::new(RelayBroadcaster::new(consensus.clone(), peers.clone()));

        let registry = Arc::new(RpcRegistry::new());
        registry.register(RPC_PING, Arc::new(PingHandler)).await?;
        registry
            .register(RPC_ADD_ME, Arc::new(AddMeHandler { peers: peers.clone() }))
            .await?;
        registry
            .register(RPC_SHARE_PEERS, Arc::new(SharePeersHandler { peers: peers.clone() }))
            .await?;
        registry
            .register(
                RPC_SEND_BLOCKS,
                Arc::new(SendBlocksHandler {
                    consensus: consensus.clone(),
                }),
            )
            .await?;
        registry
            .register(
                RPC_RELAY_BLOCK,
                Arc::new(RelayBlockHandler {
                    relay: relay.clone(),
                    sync: sync.clone(),
                }),
            )
            .await?;
        registry
            .register(
                RPC_RELAY_TRANSACTION,
                Arc::new(RelayTransactionHandler {
                    relay: relay.clone(),
                }),
            )
            .await?;

        log::info!("Gateway bound to {}", address);

        Ok(Self {
            config,
            address,
            listener: Mutex::new(Some(listener)),
            registry,
            consensus,
            peers,
            sync,
            relay,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the accept loop and the maintenance loop
    pub fn serve(&self) {
        let listener = match self.listener.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(listener) = listener else {
            log::warn!("Gateway {} is already serving", self.address);
            return;
        };

        let registry = self.registry.clone();
        let io_timeout = self.config.conn.io_timeout;
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let registry = registry.clone();
                        let conn = Conn::new(stream, Address::from(remote), io_timeout);
                        tokio::spawn(async move {
                            if let Err(e) = registry.dispatch(conn).await {
                                log::debug!("RPC from {} failed: {}", remote, e);
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        let peers = self.peers.clone();
        let period = self.config.gossip_interval;
        let maintenance = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                peers.ping_round().await;
                peers.fill_round().await;
                peers.gossip_round().await;
            }
        });

        self.lock_tasks().extend([accept, maintenance]);
        log::info!("Gateway listening on {}", self.address);
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub async fn info(&self) -> GatewayInfo {
        GatewayInfo {
            address: self.address.clone(),
            peers: self.peers.peer_addresses().await,
        }
    }

    pub fn peer_manager(&self) -> Arc<PeerManager> {
        self.peers.clone()
    }

    pub fn consensus(&self) -> Arc<dyn ConsensusSet> {
        self.consensus.clone()
    }

    pub async fn bootstrap(&self, seed: &Address) -> GatewayResult<()> {
        self.peers.bootstrap(seed).await
    }

    pub async fn add_peer(&self, addr: &Address) -> GatewayResult<()> {
        self.peers.add_peer(addr).await
    }

    pub async fn remove_peer(&self, addr: &Address) -> GatewayResult<()> {
        self.peers.remove_peer(addr).await
    }

    /// Run a client RPC against `addr`
    pub async fn rpc<C>(&self, addr: &Address, id: &str, call: &mut C) -> GatewayResult<()>
    where
        C: RpcCall + ?Sized,
    {
        rpc::call(addr, id, call, &self.config.conn).await
    }

    pub async fn register_rpc(&self, id: &str, handler: Arc<dyn RpcHandler>) -> GatewayResult<()> {
        self.registry.register(id, handler).await
    }

    pub async fn synchronize(&self) -> GatewayResult<()> {
        self.sync.synchronize().await
    }

    pub async fn relay_block(&self, block: Block) -> GatewayResult<BroadcastReport> {
        self.relay.relay_block(block).await
    }

    pub async fn relay_transaction(&self, tx: Transaction) -> GatewayResult<BroadcastReport> {
        self.relay.relay_transaction(tx).await
    }

    /// Stop serving and drop every peer
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            task.abort();
            // Wait for the task to drop the listener
            let _ = task.await;
        }
        self.peers.close_all().await;
        log::info!("Gateway {} shut down", self.address);
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        for task in self.lock_tasks().iter() {
            task.abort();
        }
    }
}
