//! Chain synchronization with peers
//!
//! The client sends a history of up to 32 block ids, newest first, ending with
//! genesis. The server answers with the blocks that follow the first id it has
//! on its canonical chain. The client applies them in order and asks again
//! while the server reports more.

use crate::core::{Block, BlockId, ConsensusError, ConsensusSet};
use crate::network::address::Address;
use crate::network::connection::Conn;
use crate::network::error::{GatewayError, GatewayResult};
use crate::network::message::{
    BlockBatch, BlockHistory, BLOCK_HISTORY_LEN, MAX_BATCH_LEN, MAX_CATCH_UP_BLOCKS,
    MAX_HISTORY_LEN, RPC_SEND_BLOCKS,
};
use crate::network::peer::PeerManager;
use crate::network::rpc::{self, RpcCall, RpcHandler};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Default number of rounds before synchronization gives up
pub const DEFAULT_MAX_SYNC_ROUNDS: usize = 10;

/// Most recent blocks listed one by one in a history
const RECENT_HISTORY_LEN: usize = 12;

/// Upper bound on SendBlocks calls to one peer within a round
const MAX_BATCHES_PER_PEER: usize = 1000;

/// Room left for the batch envelope
const BATCH_ENVELOPE_LEN: usize = 64;

/// Block ids describing the local chain, newest first, genesis last
pub async fn block_history(consensus: &dyn ConsensusSet) -> BlockHistory {
    let height = consensus.height().await;

    let mut heights = Vec::with_capacity(BLOCK_HISTORY_LEN);
    let mut cursor = height;
    let mut step = 1;
    while cursor > 0 && heights.len() < BLOCK_HISTORY_LEN - 1 {
        heights.push(cursor);
        if heights.len() >= RECENT_HISTORY_LEN {
            step *= 2;
        }
        cursor = cursor.saturating_sub(step);
    }
    heights.push(0);

    let mut history = Vec::with_capacity(heights.len());
    for h in heights {
        if let Some(id) = consensus.block_id_at(h).await {
            history.push(id);
        }
    }
    history
}

/// Blocks following the newest id in `history` that we have on our chain
pub async fn blocks_after(consensus: &dyn ConsensusSet, history: &[BlockId]) -> BlockBatch {
    let mut start = None;
    for id in history {
        if let Some(height) = consensus.height_of(id).await {
            start = Some(height + 1);
            break;
        }
    }
    let Some(start) = start else {
        log::debug!("No common block in history of {} ids", history.len());
        return BlockBatch::default();
    };

    let tip = consensus.height().await;
    let mut batch = BlockBatch::default();
    let mut size = 0;
    let mut next = start;
    while next <= tip && batch.blocks.len() < MAX_CATCH_UP_BLOCKS {
        let Some(block) = consensus.block_at(next).await else {
            break;
        };
        size += block.encoded_size() + 1;
        if size > MAX_BATCH_LEN - BATCH_ENVELOPE_LEN && !batch.blocks.is_empty() {
            break;
        }
        batch.blocks.push(block);
        next += 1;
    }
    batch.more_available = next <= tip;
    batch
}

/// Client half of SendBlocks
struct BlockRequest {
    history: BlockHistory,
    batch: Option<BlockBatch>,
}

#[async_trait]
impl RpcCall for BlockRequest {
    async fn call(&mut self, conn: &mut Conn) -> GatewayResult<()> {
        conn.write_object(&self.history).await?;
        self.batch = Some(conn.read_object(MAX_BATCH_LEN).await?);
        Ok(())
    }
}

/// What one peer gave us during a round
#[derive(Debug, Default)]
struct PeerSync {
    accepted: usize,
    /// The peer served a block consensus refused
    rejection: Option<ConsensusError>,
}

/// Chain synchronization manager
pub struct SyncEngine {
    consensus: Arc<dyn ConsensusSet>,
    peers: Arc<PeerManager>,
    max_rounds: usize,
    /// Serializes concurrent synchronize calls
    running: Mutex<()>,
    /// A background synchronize is queued or running
    requested: AtomicBool,
}

impl SyncEngine {
    pub fn new(consensus: Arc<dyn ConsensusSet>, peers: Arc<PeerManager>, max_rounds: usize) -> Self {
        Self {
            consensus,
            peers,
            max_rounds: max_rounds.max(1),
            running: Mutex::new(()),
            requested: AtomicBool::new(false),
        }
    }

    /// Fetch and apply missing blocks until a full round brings nothing new
    pub async fn synchronize(&self) -> GatewayResult<()> {
        let _running = self.running.lock().await;

        let mut peers = self.peers.peer_addresses().await;
        if peers.is_empty() {
            return Err(GatewayError::NoPeers);
        }

        for round in 1..=self.max_rounds {
            peers.shuffle(&mut rand::thread_rng());

            let mut accepted = 0;
            let mut failures = 0;
            let mut last_error = None;
            for addr in &peers {
                let error = match self.sync_with(addr).await {
                    Ok(PeerSync {
                        accepted: n,
                        rejection: None,
                    }) => {
                        self.peers.record_success(addr).await;
                        accepted += n;
                        continue;
                    }
                    Ok(PeerSync {
                        accepted: n,
                        rejection: Some(e),
                    }) => {
                        log::warn!("Peer {} sent a block we rejected: {}", addr, e);
                        accepted += n;
                        GatewayError::Validation(e)
                    }
                    Err(e) => {
                        log::warn!("Sync with {} failed: {}", addr, e);
                        e
                    }
                };
                self.peers.record_failure(addr).await;
                failures += 1;
                last_error = Some(error);
            }

            if let Some(last) = last_error.filter(|_| failures == peers.len()) {
                return Err(GatewayError::AllPeersFailed {
                    attempted: peers.len(),
                    last: Box::new(last),
                });
            }

            if accepted == 0 {
                log::info!(
                    "Synchronized at height {} after {} round(s)",
                    self.consensus.height().await,
                    round
                );
                return Ok(());
            }
            log::info!("Sync round {} accepted {} blocks", round, accepted);

            let current = self.peers.peer_addresses().await;
            if !current.is_empty() {
                peers = current;
            }
        }

        Err(GatewayError::SyncExhausted(self.max_rounds))
    }

    /// Queue a background synchronize unless one is already queued or running.
    ///
    /// Returns true if this call queued it.
    pub fn request_sync(self: &Arc<Self>) -> bool {
        if self.requested.swap(true, Ordering::AcqRel) {
            return false;
        }

        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.synchronize().await {
                log::warn!("Background synchronize failed: {}", e);
            }
            engine.requested.store(false, Ordering::Release);
        });
        true
    }

    /// Pull blocks from one peer while it keeps reporting more
    async fn sync_with(&self, addr: &Address) -> GatewayResult<PeerSync> {
        let mut result = PeerSync::default();
        // Last block the peer sent; it anchors the next request even when the
        // blocks went to a side chain and our tip did not move
        let mut anchor = None;

        for _ in 0..MAX_BATCHES_PER_PEER {
            let mut history = block_history(self.consensus.as_ref()).await;
            if let Some(id) = anchor {
                anchor_history(&mut history, id);
            }

            let mut request = BlockRequest {
                history,
                batch: None,
            };
            rpc::call(addr, RPC_SEND_BLOCKS, &mut request, self.peers.conn_config()).await?;
            let batch = request.batch.unwrap_or_default();

            let last = batch.blocks.last().map(Block::id);
            let (accepted, rejection) = self.apply_batch(batch.blocks).await;
            result.accepted += accepted;

            if rejection.is_some() {
                result.rejection = rejection;
                break;
            }
            match last {
                Some(id) if batch.more_available && anchor != Some(id) => anchor = Some(id),
                _ => break,
            }
        }
        Ok(result)
    }

    /// Apply blocks in order, stopping at the first rejection
    async fn apply_batch(&self, blocks: Vec<Block>) -> (usize, Option<ConsensusError>) {
        let mut accepted = 0;
        for block in blocks {
            match self.consensus.accept_block(block).await {
                Ok(_) => accepted += 1,
                Err(ConsensusError::KnownBlock(_)) => {}
                // Later blocks build on this one, so the rest of the batch is useless
                Err(e) => return (accepted, Some(e)),
            }
        }
        (accepted, None)
    }
}

/// Put `id` at the front of `history`, keeping genesis last and the length bounded
fn anchor_history(history: &mut BlockHistory, id: BlockId) {
    if history.first() == Some(&id) {
        return;
    }
    if history.len() >= BLOCK_HISTORY_LEN {
        history.remove(history.len() - 2);
    }
    history.insert(0, id);
}

/// SendBlocks: answer a history with the blocks that follow it
pub struct SendBlocksHandler {
    pub consensus: Arc<dyn ConsensusSet>,
}

#[async_trait]
impl RpcHandler for SendBlocksHandler {
    async fn handle(&self, conn: &mut Conn) -> GatewayResult<()> {
        let history: BlockHistory = conn.read_object(MAX_HISTORY_LEN).await?;
        if history.len() > BLOCK_HISTORY_LEN {
            return Err(GatewayError::Decode(format!(
                "history of {} ids exceeds {}",
                history.len(),
                BLOCK_HISTORY_LEN
            )));
        }

        let batch = blocks_after(self.consensus.as_ref(), &history).await;
        log::debug!(
            "Sending {} blocks to {} (more: {})",
            batch.blocks.len(),
            conn.remote_address(),
            batch.more_available
        );
        conn.write_object(&batch).await
    }
}
