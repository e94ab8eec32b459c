//! Chain Gateway: the peer-to-peer layer of a blockchain node
//!
//! This crate provides:
//! - A framed object transport over TCP
//! - String-keyed RPC dispatch
//! - Peer management with bootstrap, gossip and liveness checks
//! - Chain synchronization against peers
//! - Relay of new blocks and transactions
//!
//! The consensus engine is plugged in through the [`core::ConsensusSet`]
//! trait. [`core::MemoryChain`] is a small in-memory implementation.
//!
//! # Example
//!
//! ```no_run
//! use chain_gateway::core::MemoryChain;
//! use chain_gateway::network::{Address, Gateway, GatewayConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let gateway = Gateway::bind(GatewayConfig::default(), Arc::new(MemoryChain::new())).await?;
//! gateway.serve();
//!
//! let seed = Address::parse("127.0.0.1:9982")?;
//! gateway.bootstrap(&seed).await?;
//! gateway.synchronize().await?;
//! println!("Peers: {:?}", gateway.info().await.peers);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod crypto;
pub mod network;

// Re-export commonly used types
pub use crate::core::{Block, BlockId, ConsensusSet, MemoryChain, Transaction};
pub use crate::network::{Address, Gateway, GatewayConfig, GatewayError, GatewayInfo};
