//! Chain data seen by the gateway
//!
//! This module contains:
//! - Block and transaction values (opaque to the gateway beyond their ids)
//! - The [`ConsensusSet`] trait the gateway submits them to
//! - [`MemoryChain`], an in-memory consensus set with longest-chain fork choice

pub mod block;
pub mod chain;
pub mod consensus;
pub mod id;
pub mod transaction;

pub use block::{Block, GENESIS_TIMESTAMP, MAX_BLOCK_SIZE};
pub use chain::MemoryChain;
pub use consensus::{BlockStatus, ConsensusError, ConsensusSet};
pub use id::{BlockId, Hash256, TransactionId};
pub use transaction::{Transaction, MAX_TX_SIZE};
