//! Gateway error types

use crate::core::ConsensusError;
use crate::network::address::{Address, AddressError};
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Every failure the gateway can report
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Connection to {addr} failed: {reason}")]
    ConnectFailed { addr: Address, reason: String },

    #[error("Timed out while {0}")]
    Timeout(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object of {len} bytes exceeds limit of {max} bytes")]
    ObjectTooLarge { len: usize, max: usize },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unknown RPC identifier: {0:?}")]
    UnknownRpc(String),

    #[error("Peer {addr} speaks protocol {version}, need at least {min}")]
    IncompatiblePeer { addr: Address, version: u32, min: u32 },

    #[error("Rejected by consensus: {0}")]
    Validation(#[from] ConsensusError),

    #[error("Peer list is full ({0} peers)")]
    PeerListFull(usize),

    #[error("Invalid peer {addr}: {reason}")]
    InvalidPeer { addr: Address, reason: String },

    #[error("Unknown peer {0}")]
    UnknownPeer(Address),

    #[error("Bootstrap via {seed} failed: {source}")]
    BootstrapFailed {
        seed: Address,
        #[source]
        source: Box<GatewayError>,
    },

    #[error("No peers to talk to")]
    NoPeers,

    #[error("All {attempted} peers failed, last error: {last}")]
    AllPeersFailed {
        attempted: usize,
        last: Box<GatewayError>,
    },

    #[error("Synchronization still progressing after {0} rounds")]
    SyncExhausted(usize),

    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] AddressError),

    #[error("RPC {0:?} is already registered")]
    DuplicateRpc(String),
}

/// Coarse classification used to decide how to react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Dial or transport failure; retry or drop the peer
    Connect,
    /// Malformed or oversized traffic; the connection is closed
    Protocol,
    /// The consensus engine rejected a block or transaction
    Validation,
    /// A bounded resource is full
    Capacity,
    /// A batch operation made no progress anywhere
    Exhausted,
    /// The peer set refused an operation
    Peer,
    /// Bad local input
    Config,
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::ConnectFailed { .. } | GatewayError::Timeout(_) | GatewayError::Io(_) => {
                ErrorKind::Connect
            }
            GatewayError::ObjectTooLarge { .. }
            | GatewayError::Decode(_)
            | GatewayError::UnknownRpc(_)
            | GatewayError::IncompatiblePeer { .. } => ErrorKind::Protocol,
            GatewayError::Validation(_) => ErrorKind::Validation,
            GatewayError::PeerListFull(_) => ErrorKind::Capacity,
            GatewayError::NoPeers
            | GatewayError::AllPeersFailed { .. }
            | GatewayError::SyncExhausted(_) => ErrorKind::Exhausted,
            GatewayError::InvalidPeer { .. }
            | GatewayError::UnknownPeer(_)
            | GatewayError::BootstrapFailed { .. } => ErrorKind::Peer,
            GatewayError::InvalidAddress(_) | GatewayError::DuplicateRpc(_) => ErrorKind::Config,
        }
    }
}
