//! Transaction payloads
//!
//! The gateway treats transactions as opaque values. It only needs an id to
//! de-duplicate relays and a size bound for the wire.

use crate::core::id::TransactionId;
use crate::crypto::sha256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum encoded transaction size in bytes
pub const MAX_TX_SIZE: usize = 100_000;

/// A transaction as forwarded between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Opaque payload interpreted by the consensus engine
    pub data: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
}

impl Transaction {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            timestamp: Utc::now(),
        }
    }

    /// Content-derived transaction id
    pub fn id(&self) -> TransactionId {
        let data = format!("{}{}", self.data, self.timestamp.timestamp_nanos_opt().unwrap_or(0));
        TransactionId::from_bytes(sha256(data.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_depends_on_content() {
        let a = Transaction::new("pay alice");
        let mut b = a.clone();
        assert_eq!(a.id(), b.id());

        b.data = "pay bob".to_string();
        assert_ne!(a.id(), b.id());
    }
}
