//! Consensus seam
//!
//! The gateway never validates blocks or transactions itself. It hands them to
//! a [`ConsensusSet`] and acts on the verdict.

use crate::core::block::Block;
use crate::core::id::{BlockId, TransactionId};
use crate::core::transaction::Transaction;
use async_trait::async_trait;
use thiserror::Error;

/// Rejections reported by the consensus engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Block {0} is already known")]
    KnownBlock(BlockId),
    #[error("Block {block} has unknown parent {parent}")]
    Orphan { block: BlockId, parent: BlockId },
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Transaction {0} is already known")]
    KnownTransaction(TransactionId),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
}

/// Where an accepted block ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// The block is now part of the canonical chain
    Canonical,
    /// The block was stored on a fork that is not (yet) the heaviest
    SideChain,
}

/// The consensus engine as seen by the gateway.
///
/// Heights and ids refer to the current canonical chain only.
#[async_trait]
pub trait ConsensusSet: Send + Sync {
    /// Validate and store a block, possibly switching the canonical chain
    async fn accept_block(&self, block: Block) -> Result<BlockStatus, ConsensusError>;

    /// Hand a transaction to the pending pool
    async fn accept_transaction(&self, tx: Transaction) -> Result<(), ConsensusError>;

    /// Height of the canonical tip (genesis is height 0)
    async fn height(&self) -> u64;

    /// Canonical block at `height`
    async fn block_at(&self, height: u64) -> Option<Block>;

    /// Canonical block id at `height`
    async fn block_id_at(&self, height: u64) -> Option<BlockId> {
        self.block_at(height).await.map(|block| block.id())
    }

    /// Height of `id` if it is on the canonical chain
    async fn height_of(&self, id: &BlockId) -> Option<u64>;
}
