//! In-memory chain
//!
//! A minimal [`ConsensusSet`] with longest-chain fork choice. Blocks on every
//! fork are kept; the canonical path is recomputed when a fork overtakes the
//! current tip.

use crate::core::block::{Block, MAX_BLOCK_SIZE};
use crate::core::consensus::{BlockStatus, ConsensusError, ConsensusSet};
use crate::core::id::{BlockId, TransactionId};
use crate::core::transaction::{Transaction, MAX_TX_SIZE};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A stored block and its height
#[derive(Debug, Clone)]
struct StoredBlock {
    block: Block,
    height: u64,
}

#[derive(Debug)]
struct ChainState {
    /// Every known block, on any fork
    blocks: HashMap<BlockId, StoredBlock>,
    /// Canonical chain, indexed by height
    path: Vec<BlockId>,
    /// Transactions waiting for a block
    pending: HashMap<TransactionId, Transaction>,
}

impl ChainState {
    fn tip_height(&self) -> u64 {
        self.path.len() as u64 - 1
    }

    /// Validate a block against its parent and return its height
    fn validate(&self, id: &BlockId, block: &Block) -> Result<u64, ConsensusError> {
        if self.blocks.contains_key(id) {
            return Err(ConsensusError::KnownBlock(*id));
        }

        let parent = self
            .blocks
            .get(&block.parent_id)
            .ok_or(ConsensusError::Orphan {
                block: *id,
                parent: block.parent_id,
            })?;

        if block.timestamp < parent.block.timestamp {
            return Err(ConsensusError::InvalidBlock(
                "timestamp precedes parent".to_string(),
            ));
        }

        let size = block.encoded_size();
        if size > MAX_BLOCK_SIZE {
            return Err(ConsensusError::InvalidBlock(format!(
                "block too large: {} bytes (max: {})",
                size, MAX_BLOCK_SIZE
            )));
        }

        Ok(parent.height + 1)
    }

    /// Rebuild the canonical path ending at `tip`
    fn reorganize(&mut self, tip: BlockId) {
        let mut path = Vec::new();
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            match self.blocks.get(&id) {
                Some(stored) => {
                    path.push(id);
                    cursor = (stored.height > 0).then_some(stored.block.parent_id);
                }
                None => break,
            }
        }
        path.reverse();
        self.path = path;
    }
}

/// In-memory consensus set
#[derive(Debug)]
pub struct MemoryChain {
    state: RwLock<ChainState>,
}

impl MemoryChain {
    /// Create a chain holding only the genesis block
    pub fn new() -> Self {
        let genesis = Block::genesis();
        let id = genesis.id();
        let mut blocks = HashMap::new();
        blocks.insert(
            id,
            StoredBlock {
                block: genesis,
                height: 0,
            },
        );

        Self {
            state: RwLock::new(ChainState {
                blocks,
                path: vec![id],
                pending: HashMap::new(),
            }),
        }
    }

    /// Id of the canonical tip
    pub async fn tip(&self) -> BlockId {
        let state = self.state.read().await;
        state.path[state.path.len() - 1]
    }

    /// Build a block on the current tip and accept it
    pub async fn mine(&self, transactions: Vec<Transaction>) -> Result<Block, ConsensusError> {
        let mut block = {
            let state = self.state.read().await;
            let tip = state.path[state.path.len() - 1];
            let mut block = Block::new(tip, transactions);
            if let Some(parent) = state.blocks.get(&tip) {
                // Keep timestamps monotonic even if the wall clock steps back
                block.timestamp = block.timestamp.max(parent.block.timestamp);
            }
            block
        };
        block.nonce = rand::random();
        self.accept_block(block.clone()).await?;
        Ok(block)
    }

    /// Number of transactions waiting for a block
    pub async fn pending_count(&self) -> usize {
        self.state.read().await.pending.len()
    }
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConsensusSet for MemoryChain {
    async fn accept_block(&self, block: Block) -> Result<BlockStatus, ConsensusError> {
        let id = block.id();
        let mut state = self.state.write().await;
        let height = state.validate(&id, &block)?;

        let extends = height > state.tip_height();
        if extends {
            for tx in &block.transactions {
                state.pending.remove(&tx.id());
            }
        }
        state.blocks.insert(id, StoredBlock { block, height });

        if extends {
            state.reorganize(id);
            log::debug!("Block {} is the new tip at height {}", id, height);
            Ok(BlockStatus::Canonical)
        } else {
            log::debug!("Block {} stored on a side chain at height {}", id, height);
            Ok(BlockStatus::SideChain)
        }
    }

    async fn accept_transaction(&self, tx: Transaction) -> Result<(), ConsensusError> {
        if tx.data.is_empty() {
            return Err(ConsensusError::InvalidTransaction("empty payload".to_string()));
        }
        if tx.data.len() > MAX_TX_SIZE {
            return Err(ConsensusError::InvalidTransaction(format!(
                "transaction too large: {} bytes",
                tx.data.len()
            )));
        }

        let id = tx.id();
        let mut state = self.state.write().await;
        if state.pending.contains_key(&id) {
            return Err(ConsensusError::KnownTransaction(id));
        }
        state.pending.insert(id, tx);
        Ok(())
    }

    async fn height(&self) -> u64 {
        self.state.read().await.tip_height()
    }

    async fn block_at(&self, height: u64) -> Option<Block> {
        let state = self.state.read().await;
        let id = state.path.get(height as usize)?;
        state.blocks.get(id).map(|stored| stored.block.clone())
    }

    async fn block_id_at(&self, height: u64) -> Option<BlockId> {
        self.state.read().await.path.get(height as usize).copied()
    }

    async fn height_of(&self, id: &BlockId) -> Option<u64> {
        let state = self.state.read().await;
        let stored = state.blocks.get(id)?;
        // Side-chain blocks have a height but are not on the path
        (state.path.get(stored.height as usize) == Some(id)).then_some(stored.height)
    }
}
