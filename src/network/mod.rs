//! P2P gateway
//!
//! Provides the networking layer between a consensus engine and its peers.
//!
//! # Features
//! - Framed object connections with size limits and deadlines
//! - RPC dispatch by string identifier
//! - Peer management, bootstrap and address gossip
//! - Chain synchronization
//! - Block and transaction relay

pub mod address;
pub mod addrman;
pub mod connection;
pub mod error;
pub mod message;
pub mod node;
pub mod peer;
pub mod relay;
pub mod rpc;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use address::{Address, AddressError, MAX_ADDRESS_LEN};
pub use addrman::{AddressBook, DEFAULT_ADDRESS_BOOK_CAPACITY};
pub use connection::{Conn, ConnConfig, ObjectCodec, MAGIC};
pub use error::{ErrorKind, GatewayError, GatewayResult};
pub use message::{BlockBatch, BlockHistory, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};
pub use node::{Gateway, GatewayConfig, GatewayInfo};
pub use peer::{Peer, PeerConfig, PeerManager, MAX_PEERS, MAX_STRIKES, MIN_PEERS};
pub use relay::{BroadcastReport, RelayBroadcaster};
pub use rpc::{ReaderRpc, RpcCall, RpcHandler, RpcRegistry, WriterRpc};
pub use sync::{block_history, blocks_after, SyncEngine};
