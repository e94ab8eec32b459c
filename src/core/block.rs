//! Block implementation
//!
//! A block links to its parent by id and carries a list of transactions.
//! Validation beyond linkage belongs to the consensus engine.

use crate::core::id::BlockId;
use crate::core::transaction::Transaction;
use crate::crypto::double_sha256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum encoded block size in bytes
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

/// Genesis timestamp, fixed so every node derives the same genesis id
pub const GENESIS_TIMESTAMP: i64 = 1_704_067_200;

/// A block in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Id of the parent block
    pub parent_id: BlockId,
    /// Block creation timestamp
    pub timestamp: DateTime<Utc>,
    /// Free nonce, lets callers build distinct siblings
    pub nonce: u64,
    /// Transactions included in the block
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Create a new block on top of `parent_id`
    pub fn new(parent_id: BlockId, transactions: Vec<Transaction>) -> Self {
        Self {
            parent_id,
            timestamp: Utc::now(),
            nonce: 0,
            transactions,
        }
    }

    /// The genesis block shared by all nodes
    pub fn genesis() -> Self {
        Self {
            parent_id: BlockId::ZERO,
            timestamp: DateTime::<Utc>::from_timestamp(GENESIS_TIMESTAMP, 0).unwrap_or_default(),
            nonce: 0,
            transactions: Vec::new(),
        }
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    /// Calculate the block id
    pub fn id(&self) -> BlockId {
        let tx_ids: String = self.transactions.iter().map(|tx| tx.id().to_hex()).collect();
        let data = format!(
            "{}{}{}{}",
            self.parent_id,
            self.timestamp.timestamp_nanos_opt().unwrap_or(0),
            self.nonce,
            tx_ids
        );
        BlockId::from_bytes(double_sha256(data.as_bytes()))
    }

    /// Size of the block once encoded for the wire
    pub fn encoded_size(&self) -> usize {
        serde_json::to_vec(self).map_or(usize::MAX, |bytes| bytes.len())
    }
}
