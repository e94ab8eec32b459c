//! Block and transaction relay
//!
//! New blocks and transactions are pushed to every peer with a one-shot write
//! RPC. Blocks are only forwarded when they extend our canonical chain, which
//! stops side chains and rejected blocks from spreading. Transactions carry no
//! such signal, so a bounded seen-set keeps a transaction from bouncing
//! between peers forever.

use crate::core::{Block, BlockStatus, ConsensusError, ConsensusSet, Transaction, TransactionId};
use crate::network::connection::Conn;
use crate::network::error::{GatewayError, GatewayResult};
use crate::network::message::{MAX_BLOCK_LEN, MAX_TX_LEN, RPC_RELAY_BLOCK, RPC_RELAY_TRANSACTION};
use crate::network::peer::PeerManager;
use crate::network::rpc::{self, RpcHandler, WriterRpc};
use crate::network::sync::SyncEngine;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Transaction ids remembered by the seen-set
pub const DEFAULT_SEEN_CAPACITY: usize = 65_536;

/// Outcome of one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Peers we tried to reach
    pub attempted: usize,
    /// Peers the write failed for
    pub failed: usize,
}

impl BroadcastReport {
    pub fn delivered(&self) -> usize {
        self.attempted - self.failed
    }
}

/// FIFO-bounded set of recently seen transaction ids
#[derive(Debug)]
struct SeenSet {
    ids: HashSet<TransactionId>,
    order: VecDeque<TransactionId>,
    capacity: usize,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns true if the id was not seen before
    fn insert(&mut self, id: TransactionId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id);
        true
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// Pushes blocks and transactions to the peer set
pub struct RelayBroadcaster {
    consensus: Arc<dyn ConsensusSet>,
    peers: Arc<PeerManager>,
    seen: Mutex<SeenSet>,
}

impl RelayBroadcaster {
    pub fn new(consensus: Arc<dyn ConsensusSet>, peers: Arc<PeerManager>) -> Self {
        Self::with_seen_capacity(consensus, peers, DEFAULT_SEEN_CAPACITY)
    }

    pub fn with_seen_capacity(
        consensus: Arc<dyn ConsensusSet>,
        peers: Arc<PeerManager>,
        capacity: usize,
    ) -> Self {
        Self {
            consensus,
            peers,
            seen: Mutex::new(SeenSet::new(capacity)),
        }
    }

    /// Hand a block to consensus and forward it if it became our tip
    pub async fn relay_block(&self, block: Block) -> GatewayResult<BroadcastReport> {
        let id = block.id();
        match self.consensus.accept_block(block.clone()).await? {
            BlockStatus::Canonical => {
                let report = self.broadcast(RPC_RELAY_BLOCK, &block).await;
                log::info!(
                    "Relayed block {} to {}/{} peers",
                    id,
                    report.delivered(),
                    report.attempted
                );
                Ok(report)
            }
            BlockStatus::SideChain => {
                log::debug!("Block {} landed on a side chain, not relaying", id);
                Ok(BroadcastReport::default())
            }
        }
    }

    /// Forward a locally created transaction to every peer
    pub async fn relay_transaction(&self, tx: Transaction) -> GatewayResult<BroadcastReport> {
        self.seen.lock().await.insert(tx.id());
        Ok(self.broadcast(RPC_RELAY_TRANSACTION, &tx).await)
    }

    /// Handle a transaction relayed to us: drop duplicates, validate, forward
    pub async fn receive_transaction(&self, tx: Transaction) -> GatewayResult<BroadcastReport> {
        let id = tx.id();
        if !self.seen.lock().await.insert(id) {
            log::debug!("Dropping duplicate transaction {}", id);
            return Ok(BroadcastReport::default());
        }

        self.consensus.accept_transaction(tx.clone()).await?;
        Ok(self.broadcast(RPC_RELAY_TRANSACTION, &tx).await)
    }

    /// Write `value` under RPC `id` to every current peer, concurrently
    pub async fn broadcast<T>(&self, id: &str, value: &T) -> BroadcastReport
    where
        T: Serialize + Sync + ?Sized,
    {
        let peers = self.peers.peer_addresses().await;
        let conn = *self.peers.conn_config();

        let calls = peers.iter().map(|addr| async move {
            let mut writer = WriterRpc::new(value);
            (addr, rpc::call(addr, id, &mut writer, &conn).await)
        });

        let mut report = BroadcastReport {
            attempted: peers.len(),
            failed: 0,
        };
        for (addr, result) in join_all(calls).await {
            match result {
                Ok(()) => self.peers.record_success(addr).await,
                Err(e) => {
                    log::warn!("Broadcast of {} to {} failed: {}", id, addr, e);
                    self.peers.record_failure(addr).await;
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub async fn seen_count(&self) -> usize {
        self.seen.lock().await.len()
    }
}

/// RelayBlock: a peer pushes a block it just accepted
pub struct RelayBlockHandler {
    pub relay: Arc<RelayBroadcaster>,
    pub sync: Arc<SyncEngine>,
}

#[async_trait]
impl RpcHandler for RelayBlockHandler {
    async fn handle(&self, conn: &mut Conn) -> GatewayResult<()> {
        let block: Block = conn.read_object(MAX_BLOCK_LEN).await?;

        match self.relay.relay_block(block).await {
            Ok(_) => Ok(()),
            Err(GatewayError::Validation(ConsensusError::KnownBlock(_))) => Ok(()),
            Err(GatewayError::Validation(ConsensusError::Orphan { block, parent })) => {
                // We are missing history; catch up in the background
                log::info!(
                    "Orphan block {} from {} (parent {}), synchronizing",
                    block,
                    conn.remote_address(),
                    parent
                );
                if !self.sync.request_sync() {
                    log::debug!("Synchronize already pending, not queuing another");
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// RelayTransaction: a peer pushes a transaction
pub struct RelayTransactionHandler {
    pub relay: Arc<RelayBroadcaster>,
}

#[async_trait]
impl RpcHandler for RelayTransactionHandler {
    async fn handle(&self, conn: &mut Conn) -> GatewayResult<()> {
        let tx: Transaction = conn.read_object(MAX_TX_LEN).await?;
        self.relay.receive_transaction(tx).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MemoryChain;
    use crate::network::testing::{spawn_gateway, spawn_gateway_with, test_conn_config, wait_for};

    #[test]
    fn test_seen_set_evicts_oldest() {
        let mut seen = SeenSet::new(2);
        let a = Transaction::new("a").id();
        let b = Transaction::new("b").id();
        let c = Transaction::new("c").id();

        assert!(seen.insert(a));
        assert!(!seen.insert(a));
        assert!(seen.insert(b));
        assert!(seen.insert(c));
        assert_eq!(seen.len(), 2);
        // `a` was evicted, so it counts as new again
        assert!(seen.insert(a));
    }

    #[tokio::test]
    async fn test_block_reaches_each_peer_once() {
        let origin_chain = Arc::new(MemoryChain::new());
        let origin = spawn_gateway_with(origin_chain.clone()).await;

        let live_a = spawn_gateway().await;
        let live_b = spawn_gateway().await;
        let dead = spawn_gateway().await;
        for peer in [&live_a, &live_b, &dead] {
            origin.add_peer(peer.address()).await.unwrap();
        }
        dead.shutdown().await;

        let block = Block::new(origin_chain.tip().await, vec![]);
        let report = origin.relay_block(block.clone()).await.unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.failed, 1);

        for peer in [&live_a, &live_b] {
            let consensus = peer.consensus();
            let id = block.id();
            assert!(wait_for(|| async { consensus.height_of(&id).await == Some(1) }).await);
        }
    }

    #[tokio::test]
    async fn test_rejected_block_not_broadcast() {
        let origin = spawn_gateway().await;
        let peer = spawn_gateway().await;
        origin.add_peer(peer.address()).await.unwrap();

        let orphan = Block::new(crate::core::BlockId::from_bytes([3; 32]), vec![]);
        let err = origin.relay_block(orphan).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Validation(ConsensusError::Orphan { .. })
        ));
        assert_eq!(peer.consensus().height().await, 0);
    }

    #[tokio::test]
    async fn test_side_chain_block_not_broadcast() {
        let origin_chain = Arc::new(MemoryChain::new());
        let genesis = origin_chain.tip().await;
        origin_chain.mine(vec![]).await.unwrap();
        origin_chain.mine(vec![]).await.unwrap();

        let origin = spawn_gateway_with(origin_chain).await;
        let peer = spawn_gateway().await;
        origin.add_peer(peer.address()).await.unwrap();

        let fork = Block::new(genesis, vec![]).with_nonce(42);
        let report = origin.relay_block(fork).await.unwrap();
        assert_eq!(report, BroadcastReport::default());
        assert_eq!(peer.consensus().height().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_inbound_transaction_not_rebroadcast() {
        let node = spawn_gateway().await;
        let peer = spawn_gateway().await;
        node.add_peer(peer.address()).await.unwrap();

        let relay = RelayBroadcaster::new(node.consensus(), node.peer_manager());
        let tx = Transaction::new("transfer 5");

        let first = relay.receive_transaction(tx.clone()).await.unwrap();
        assert_eq!(first.attempted, 1);
        assert_eq!(first.failed, 0);

        let second = relay.receive_transaction(tx).await.unwrap();
        assert_eq!(second.attempted, 0);
        assert_eq!(relay.seen_count().await, 1);
    }

    #[tokio::test]
    async fn test_transaction_propagates() {
        let origin = spawn_gateway().await;
        let peer_chain = Arc::new(MemoryChain::new());
        let peer = spawn_gateway_with(peer_chain.clone()).await;
        origin.add_peer(peer.address()).await.unwrap();

        let report = origin
            .relay_transaction(Transaction::new("hello"))
            .await
            .unwrap();
        assert_eq!(report.delivered(), 1);
        assert!(wait_for(|| async { peer_chain.pending_count().await == 1 }).await);
    }

    #[tokio::test]
    async fn test_orphan_relay_triggers_synchronize() {
        let origin_chain = Arc::new(MemoryChain::new());
        origin_chain.mine(vec![]).await.unwrap();
        let tip = origin_chain.mine(vec![]).await.unwrap();
        let origin = spawn_gateway_with(origin_chain.clone()).await;

        let receiver_chain = Arc::new(MemoryChain::new());
        let receiver = spawn_gateway_with(receiver_chain.clone()).await;
        receiver.add_peer(origin.address()).await.unwrap();

        // The receiver lacks the parent, so it has to fetch it from its peer
        let mut writer = WriterRpc::new(&tip);
        rpc::call(
            receiver.address(),
            RPC_RELAY_BLOCK,
            &mut writer,
            &test_conn_config(),
        )
        .await
        .unwrap();

        assert!(wait_for(|| async { receiver_chain.height().await == 2 }).await);
        assert_eq!(receiver_chain.tip().await, tip.id());
    }
}
