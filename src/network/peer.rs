//! Peer management
//!
//! The [`PeerManager`] owns the live peer set and the address book. Peers are
//! verified with a Ping before they are admitted. Every later RPC dials a
//! fresh connection on demand, and the peer record only tracks liveness.

use crate::network::addrman::AddressBook;
use crate::network::address::Address;
use crate::network::connection::{Conn, ConnConfig};
use crate::network::error::{GatewayError, GatewayResult};
use crate::network::message::{
    MAX_ENCODED_ADDRESS_LEN, MAX_SHARED_PEERS, MAX_SHARE_PEERS_LEN, RPC_ADD_ME, RPC_SHARE_PEERS,
};
use crate::network::rpc::{self, ReaderRpc, RpcHandler, WriterRpc};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Maximum number of peers
pub const MAX_PEERS: usize = 8;

/// Peers we try to keep at least
pub const MIN_PEERS: usize = 3;

/// Consecutive failures after which a peer is dropped
pub const MAX_STRIKES: u32 = 3;

/// Peers asked for their peers per gossip round
pub const GOSSIP_FANOUT: usize = 3;

/// Peer set limits
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub max_peers: usize,
    pub min_peers: usize,
    pub address_book_capacity: usize,
    pub conn: ConnConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_peers: MAX_PEERS,
            min_peers: MIN_PEERS,
            address_book_capacity: crate::network::addrman::DEFAULT_ADDRESS_BOOK_CAPACITY,
            conn: ConnConfig::default(),
        }
    }
}

/// A live peer
#[derive(Debug, Clone)]
pub struct Peer {
    pub addr: Address,
    /// Unique per admission; a re-added peer gets a new session
    pub session: u64,
    pub added_at: Instant,
    pub last_seen: Instant,
    /// Consecutive failed RPCs
    pub strikes: u32,
}

impl Peer {
    fn new(addr: Address, session: u64) -> Self {
        let now = Instant::now();
        Self {
            addr,
            session,
            added_at: now,
            last_seen: now,
            strikes: 0,
        }
    }
}

#[derive(Debug, Default)]
struct PeerTable {
    peers: HashMap<Address, Peer>,
    /// Adds whose Ping is in flight; they count against capacity
    pending: HashSet<Address>,
}

/// Manages the live peer set
pub struct PeerManager {
    local: Address,
    config: PeerConfig,
    table: RwLock<PeerTable>,
    book: RwLock<AddressBook>,
    sessions: AtomicU64,
}

impl PeerManager {
    pub fn new(local: Address, config: PeerConfig) -> Self {
        let book = AddressBook::new(config.address_book_capacity);
        Self {
            local,
            config,
            table: RwLock::new(PeerTable::default()),
            book: RwLock::new(book),
            sessions: AtomicU64::new(0),
        }
    }

    pub fn local_address(&self) -> &Address {
        &self.local
    }

    pub fn conn_config(&self) -> &ConnConfig {
        &self.config.conn
    }

    /// Add a peer after checking that it answers Ping
    pub async fn add_peer(&self, addr: &Address) -> GatewayResult<()> {
        if addr == &self.local {
            return Err(GatewayError::InvalidPeer {
                addr: addr.clone(),
                reason: "cannot add self".to_string(),
            });
        }
        if !addr.is_valid() {
            return Err(GatewayError::InvalidPeer {
                addr: addr.clone(),
                reason: "malformed address".to_string(),
            });
        }

        {
            let mut table = self.table.write().await;
            if table.peers.contains_key(addr) || table.pending.contains(addr) {
                return Ok(());
            }
            if table.peers.len() + table.pending.len() >= self.config.max_peers {
                return Err(GatewayError::PeerListFull(self.config.max_peers));
            }
            table.pending.insert(addr.clone());
        }

        // No lock is held while we talk to the peer
        let result = rpc::ping(addr, &self.config.conn).await;

        let mut book = self.book.write().await;
        book.add(addr.clone());
        let mut table = self.table.write().await;
        table.pending.remove(addr);

        match result {
            Ok(_) => {
                let session = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
                table.peers.insert(addr.clone(), Peer::new(addr.clone(), session));
                book.good(addr);
                log::info!("Added peer: {} (session {})", addr, session);
                Ok(())
            }
            Err(e) => {
                book.attempt(addr);
                log::warn!("Could not add peer {}: {}", addr, e);
                Err(GatewayError::InvalidPeer {
                    addr: addr.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Remove a peer and forget its address
    pub async fn remove_peer(&self, addr: &Address) -> GatewayResult<()> {
        let removed = self.table.write().await.peers.remove(addr);
        match removed {
            Some(peer) => {
                self.book.write().await.remove(addr);
                log::info!("Removed peer: {} (session {})", addr, peer.session);
                Ok(())
            }
            None => Err(GatewayError::UnknownPeer(addr.clone())),
        }
    }

    /// Note a successful exchange with a peer
    pub async fn record_success(&self, addr: &Address) {
        if let Some(peer) = self.table.write().await.peers.get_mut(addr) {
            peer.last_seen = Instant::now();
            peer.strikes = 0;
        }
    }

    /// Note a failed exchange; the peer is dropped after too many in a row
    pub async fn record_failure(&self, addr: &Address) {
        let dropped = {
            let mut table = self.table.write().await;
            let strikes = match table.peers.get_mut(addr) {
                Some(peer) => {
                    peer.strikes += 1;
                    peer.strikes
                }
                None => return,
            };
            strikes >= MAX_STRIKES && table.peers.remove(addr).is_some()
        };

        self.book.write().await.attempt(addr);
        if dropped {
            log::info!("Dropped unresponsive peer: {}", addr);
        }
    }

    pub async fn peer_addresses(&self) -> Vec<Address> {
        self.table.read().await.peers.keys().cloned().collect()
    }

    pub async fn peer(&self, addr: &Address) -> Option<Peer> {
        self.table.read().await.peers.get(addr).cloned()
    }

    pub async fn peer_count(&self) -> usize {
        self.table.read().await.peers.len()
    }

    pub async fn known_address_count(&self) -> usize {
        self.book.read().await.len()
    }

    /// Add addresses to the book; returns how many were new
    pub async fn learn_addresses(&self, addrs: impl IntoIterator<Item = Address>) -> usize {
        let mut book = self.book.write().await;
        addrs
            .into_iter()
            .filter(|addr| addr != &self.local)
            .filter(|addr| book.add(addr.clone()))
            .count()
    }

    /// Current peers first, then address-book samples, de-duplicated and capped
    pub async fn shareable_peers(&self) -> Vec<Address> {
        let mut shared = self.peer_addresses().await;
        shared.shuffle(&mut rand::thread_rng());
        shared.truncate(MAX_SHARED_PEERS);

        let sample = self.book.read().await.sample(MAX_SHARED_PEERS);
        for addr in sample {
            if shared.len() >= MAX_SHARED_PEERS {
                break;
            }
            if !shared.contains(&addr) {
                shared.push(addr);
            }
        }
        shared
    }

    /// Ask `addr` for the peers it knows
    pub async fn request_peers(&self, addr: &Address) -> GatewayResult<Vec<Address>> {
        let mut reader = ReaderRpc::<Vec<Address>>::new(MAX_SHARE_PEERS_LEN);
        rpc::call(addr, RPC_SHARE_PEERS, &mut reader, &self.config.conn).await?;

        let mut peers = reader.into_inner().unwrap_or_default();
        peers.truncate(MAX_SHARED_PEERS);
        peers.retain(Address::is_valid);
        Ok(peers)
    }

    /// Join the network through `seed`
    pub async fn bootstrap(&self, seed: &Address) -> GatewayResult<()> {
        let failed = |source: GatewayError| GatewayError::BootstrapFailed {
            seed: seed.clone(),
            source: Box::new(source),
        };

        log::info!("Bootstrapping via {}", seed);
        self.add_peer(seed).await.map_err(failed)?;

        let shared = self.request_peers(seed).await.map_err(failed)?;
        self.learn_addresses(shared.iter().cloned()).await;

        for addr in shared.iter().filter(|addr| *addr != &self.local && *addr != seed) {
            if let Err(e) = self.add_peer(addr).await {
                log::debug!("Skipping bootstrap peer {}: {}", addr, e);
            }
        }

        let mut writer = WriterRpc::new(&self.local);
        rpc::call(seed, RPC_ADD_ME, &mut writer, &self.config.conn)
            .await
            .map_err(failed)?;

        log::info!(
            "Bootstrap complete: {} peers, {} known addresses",
            self.peer_count().await,
            self.known_address_count().await
        );
        Ok(())
    }

    /// Ask a few random peers for their peers; only ever adds addresses
    pub async fn gossip_round(&self) -> usize {
        let mut peers = self.peer_addresses().await;
        peers.shuffle(&mut rand::thread_rng());
        peers.truncate(GOSSIP_FANOUT);

        let mut learned = 0;
        for addr in peers {
            match self.request_peers(&addr).await {
                Ok(shared) => {
                    self.record_success(&addr).await;
                    learned += self.learn_addresses(shared).await;
                }
                Err(e) => {
                    log::warn!("Gossip with {} failed: {}", addr, e);
                    self.record_failure(&addr).await;
                }
            }
        }

        if learned > 0 {
            log::debug!("Gossip learned {} new addresses", learned);
        }
        learned
    }

    /// Top the peer set up to `min_peers` from the address book
    pub async fn fill_round(&self) -> usize {
        let missing = self.config.min_peers.saturating_sub(self.peer_count().await);
        if missing == 0 {
            return 0;
        }

        let current: HashSet<Address> = self.peer_addresses().await.into_iter().collect();
        let candidates = self.book.read().await.sample(missing * 2);

        let mut added = 0;
        for addr in candidates.iter().filter(|addr| !current.contains(*addr)) {
            if added >= missing {
                break;
            }
            if self.add_peer(addr).await.is_ok() {
                added += 1;
            }
        }
        added
    }

    /// Ping every peer and count strikes against the silent ones
    pub async fn ping_round(&self) {
        for addr in self.peer_addresses().await {
            match rpc::ping(&addr, &self.config.conn).await {
                Ok(_) => self.record_success(&addr).await,
                Err(e) => {
                    log::debug!("Ping to {} failed: {}", addr, e);
                    self.record_failure(&addr).await;
                }
            }
        }
    }

    /// Drop every peer
    pub async fn close_all(&self) {
        let mut table = self.table.write().await;
        let count = table.peers.len();
        table.peers.clear();
        table.pending.clear();
        log::info!("Closed {} peers", count);
    }
}

/// AddMe: the caller asks to be added as a peer
pub struct AddMeHandler {
    pub peers: Arc<PeerManager>,
}

#[async_trait]
impl RpcHandler for AddMeHandler {
    async fn handle(&self, conn: &mut Conn) -> GatewayResult<()> {
        let advertised: Address = conn.read_object(MAX_ENCODED_ADDRESS_LEN).await?;
        if !advertised.is_valid() {
            return Err(GatewayError::InvalidPeer {
                addr: advertised,
                reason: "malformed address".to_string(),
            });
        }

        // The transport address is authoritative for who is calling
        let remote = conn.remote_address();
        if advertised.host() != remote.host() {
            return Err(GatewayError::InvalidPeer {
                addr: advertised.clone(),
                reason: format!("advertised host does not match caller {}", remote),
            });
        }

        self.peers.add_peer(&advertised).await
    }
}

/// SharePeers: reply with a bounded sample of addresses
pub struct SharePeersHandler {
    pub peers: Arc<PeerManager>,
}

#[async_trait]
impl RpcHandler for SharePeersHandler {
    async fn handle(&self, conn: &mut Conn) -> GatewayResult<()> {
        let shared = self.peers.shareable_peers().await;
        conn.write_object(&shared).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::{conn_pair, spawn_gateway, test_conn_config, unused_address};
    use futures::future::join_all;

    fn manager(local: &str, max_peers: usize) -> PeerManager {
        PeerManager::new(
            Address::parse(local).unwrap(),
            PeerConfig {
                max_peers,
                conn: test_conn_config(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_add_peer_is_idempotent() {
        let remote = spawn_gateway().await;
        let pm = manager("127.0.0.1:1", MAX_PEERS);

        pm.add_peer(remote.address()).await.unwrap();
        pm.add_peer(remote.address()).await.unwrap();
        assert_eq!(pm.peer_addresses().await, vec![remote.address().clone()]);
    }

    #[tokio::test]
    async fn test_add_self_and_unreachable_rejected() {
        let pm = manager("127.0.0.1:1", MAX_PEERS);
        let local = pm.local_address().clone();
        assert!(matches!(
            pm.add_peer(&local).await,
            Err(GatewayError::InvalidPeer { .. })
        ));

        let dead = unused_address().await;
        assert!(matches!(
            pm.add_peer(&dead).await,
            Err(GatewayError::InvalidPeer { .. })
        ));
        assert_eq!(pm.peer_count().await, 0);
        // The address is remembered, with the failed attempt recorded
        assert_eq!(pm.known_address_count().await, 1);
    }

    #[tokio::test]
    async fn test_peer_list_full() {
        let a = spawn_gateway().await;
        let b = spawn_gateway().await;
        let pm = manager("127.0.0.1:1", 1);

        pm.add_peer(a.address()).await.unwrap();
        let err = pm.add_peer(b.address()).await.unwrap_err();
        assert!(matches!(err, GatewayError::PeerListFull(1)));
        // Re-adding an existing peer is still a no-op success
        pm.add_peer(a.address()).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_then_add_gets_fresh_session() {
        let remote = spawn_gateway().await;
        let pm = manager("127.0.0.1:1", MAX_PEERS);

        pm.add_peer(remote.address()).await.unwrap();
        let first = pm.peer(remote.address()).await.unwrap().session;

        pm.remove_peer(remote.address()).await.unwrap();
        assert!(pm.peer(remote.address()).await.is_none());
        assert!(matches!(
            pm.remove_peer(remote.address()).await,
            Err(GatewayError::UnknownPeer(_))
        ));

        pm.add_peer(remote.address()).await.unwrap();
        let second = pm.peer(remote.address()).await.unwrap().session;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_strikes_drop_peer() {
        let remote = spawn_gateway().await;
        let pm = manager("127.0.0.1:1", MAX_PEERS);
        pm.add_peer(remote.address()).await.unwrap();

        for _ in 0..MAX_STRIKES - 1 {
            pm.record_failure(remote.address()).await;
        }
        pm.record_success(remote.address()).await;
        pm.record_failure(remote.address()).await;
        assert_eq!(pm.peer_count().await, 1);

        for _ in 0..MAX_STRIKES {
            pm.record_failure(remote.address()).await;
        }
        assert_eq!(pm.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_shareable_peers_bounded() {
        let pm = manager("127.0.0.1:1", MAX_PEERS);
        let addrs = (1..=100).map(|i| Address::parse(&format!("10.0.1.{}:9981", i)).unwrap());
        assert_eq!(pm.learn_addresses(addrs).await, 100);

        let shared = pm.shareable_peers().await;
        assert_eq!(shared.len(), MAX_SHARED_PEERS);
        let distinct: HashSet<_> = shared.iter().collect();
        assert_eq!(distinct.len(), MAX_SHARED_PEERS);
    }

    #[tokio::test]
    async fn test_learn_skips_self() {
        let pm = manager("127.0.0.1:1", MAX_PEERS);
        let local = pm.local_address().clone();
        assert_eq!(pm.learn_addresses(vec![local]).await, 0);
    }

    #[tokio::test]
    async fn test_add_me_checks_advertised_host() {
        let pm = Arc::new(manager("127.0.0.1:1", MAX_PEERS));
        let handler = AddMeHandler { peers: pm.clone() };

        let (mut client, mut server) = conn_pair(test_conn_config()).await;
        let spoofed = Address::parse("10.9.8.7:9981").unwrap();
        client.write_object(&spoofed).await.unwrap();
        let err = handler.handle(&mut server).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidPeer { ref addr, .. } if addr == &spoofed));
        assert_eq!(pm.peer_count().await, 0);

        // A caller advertising its own host is added
        let remote = spawn_gateway().await;
        let (mut client, mut server) = conn_pair(test_conn_config()).await;
        client.write_object(remote.address()).await.unwrap();
        handler.handle(&mut server).await.unwrap();
        assert_eq!(pm.peer_addresses().await, vec![remote.address().clone()]);
    }

    #[tokio::test]
    async fn test_concurrent_adds_stay_consistent() {
        let remote = spawn_gateway().await;
        let pm = manager("127.0.0.1:1", 2);

        let same = join_all((0..5).map(|_| pm.add_peer(remote.address()))).await;
        assert!(same.iter().all(Result::is_ok));
        assert_eq!(pm.peer_count().await, 1);

        // In-flight adds count against capacity, so only one more fits
        let others = [spawn_gateway().await, spawn_gateway().await, spawn_gateway().await];
        let results = join_all(others.iter().map(|g| pm.add_peer(g.address()))).await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, GatewayError::PeerListFull(2))));
        assert_eq!(pm.peer_count().await, 2);
    }

    #[tokio::test]
    async fn test_ping_round_resets_and_drops() {
        let live = spawn_gateway().await;
        let dead = spawn_gateway().await;
        let pm = manager("127.0.0.1:1", MAX_PEERS);
        pm.add_peer(live.address()).await.unwrap();
        pm.add_peer(dead.address()).await.unwrap();
        pm.record_failure(live.address()).await;
        dead.shutdown().await;

        for _ in 0..MAX_STRIKES {
            pm.ping_round().await;
        }
        assert_eq!(pm.peer_addresses().await, vec![live.address().clone()]);
        assert_eq!(pm.peer(live.address()).await.unwrap().strikes, 0);
    }

    #[tokio::test]
    async fn test_fill_round_tops_up_from_book() {
        let a = spawn_gateway().await;
        let b = spawn_gateway().await;
        let pm = manager("127.0.0.1:1", MAX_PEERS);
        let dead = unused_address().await;
        pm.learn_addresses(vec![a.address().clone(), b.address().clone(), dead])
            .await;

        assert_eq!(pm.fill_round().await, 2);
        assert_eq!(pm.peer_count().await, 2);
    }

    #[tokio::test]
    async fn test_gossip_learns_addresses() {
        let remote = spawn_gateway().await;
        let extra = Address::parse("10.0.2.1:9981").unwrap();
        remote.peer_manager().learn_addresses(vec![extra.clone()]).await;

        let pm = manager("127.0.0.1:1", MAX_PEERS);
        pm.add_peer(remote.address()).await.unwrap();
        let before = pm.known_address_count().await;

        assert_eq!(pm.gossip_round().await, 1);
        assert_eq!(pm.known_address_count().await, before + 1);
        assert_eq!(pm.peer_count().await, 1);
    }
}
