//! RPC identifiers, size limits and payload types
//!
//! Identifiers are a contract between client and server and must match
//! exactly on both ends.

use crate::core::{Block, BlockId, MAX_BLOCK_SIZE, MAX_TX_SIZE};
use crate::network::address::MAX_ADDRESS_LEN;
use serde::{Deserialize, Serialize};

/// Protocol version announced by the Ping RPC
pub const PROTOCOL_VERSION: u32 = 1;

/// Oldest protocol version we talk to
pub const MIN_PROTOCOL_VERSION: u32 = 1;

pub const RPC_PING: &str = "Ping";
pub const RPC_ADD_ME: &str = "AddMe";
pub const RPC_SHARE_PEERS: &str = "SharePeers";
pub const RPC_SEND_BLOCKS: &str = "SendBlocks";
pub const RPC_RELAY_BLOCK: &str = "RelayBlock";
pub const RPC_RELAY_TRANSACTION: &str = "RelayTransaction";

/// Encoded size limit for an RPC identifier
pub const MAX_RPC_ID_LEN: usize = 64;

/// Number of block ids sent to SendBlocks
pub const BLOCK_HISTORY_LEN: usize = 32;

/// Most blocks returned by one SendBlocks call
pub const MAX_CATCH_UP_BLOCKS: usize = 50;

/// Most addresses returned by one SharePeers call
pub const MAX_SHARED_PEERS: usize = 32;

/// Encoded size limit for the Ping reply
pub const MAX_VERSION_LEN: usize = 16;

/// Encoded size limit for a single address (quotes and escapes included)
pub const MAX_ENCODED_ADDRESS_LEN: usize = MAX_ADDRESS_LEN * 2 + 2;

/// Encoded size limit for a SharePeers reply
pub const MAX_SHARE_PEERS_LEN: usize = MAX_SHARED_PEERS * (MAX_ENCODED_ADDRESS_LEN + 1) + 2;

/// Encoded size limit for a block history: 64 hex chars, quotes and a comma each
pub const MAX_HISTORY_LEN: usize = BLOCK_HISTORY_LEN * 67 + 2;

/// Encoded size limit for a relayed block
pub const MAX_BLOCK_LEN: usize = MAX_BLOCK_SIZE;

/// Encoded size limit for a relayed transaction, with room for the envelope
pub const MAX_TX_LEN: usize = MAX_TX_SIZE * 2 + 256;

/// Encoded size limit for a SendBlocks reply
pub const MAX_BATCH_LEN: usize = 16 * 1024 * 1024;

/// Reply to SendBlocks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockBatch {
    /// Sequential blocks following the newest shared block
    pub blocks: Vec<Block>,
    /// The sender has more blocks after this batch
    pub more_available: bool,
}

/// Block ids sent to SendBlocks, newest first, genesis last
pub type BlockHistory = Vec<BlockId>;
