//! Cryptographic utilities
//!
//! Only hashing is needed: block and transaction ids are SHA-256 digests.

pub mod hash;

pub use hash::{double_sha256, sha256};
