//! Address book for peer discovery
//!
//! Keeps every address we have heard of, connected or not, together with
//! connection accounting. Addresses that keep failing are "terrible": they
//! are not handed out by [`AddressBook::sample`] and are evicted first when
//! the book is full.

use crate::network::address::Address;
use rand::seq::IteratorRandom;
use std::collections::HashMap;
use std::time::Instant;

/// Default number of addresses kept
pub const DEFAULT_ADDRESS_BOOK_CAPACITY: usize = 1000;

/// Failed attempts (with no success ever) after which an address is terrible
const MAX_FAILED_ATTEMPTS: u32 = 3;

/// Address entry with metadata
#[derive(Debug, Clone)]
pub struct AddrEntry {
    /// Number of connection attempts since the last success
    pub attempts: u32,
    /// Number of successful connections
    pub successes: u32,
    /// Last connection attempt time
    pub last_attempt: Option<Instant>,
    /// Last successful connection time
    pub last_success: Option<Instant>,
}

impl AddrEntry {
    fn new() -> Self {
        Self {
            attempts: 0,
            successes: 0,
            last_attempt: None,
            last_success: None,
        }
    }

    /// Too many attempts with no success
    pub fn is_terrible(&self) -> bool {
        self.successes == 0 && self.attempts >= MAX_FAILED_ATTEMPTS
    }
}

/// Set of known peer addresses
#[derive(Debug)]
pub struct AddressBook {
    entries: HashMap<Address, AddrEntry>,
    capacity: usize,
}

impl AddressBook {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.entries.contains_key(addr)
    }

    pub fn entry(&self, addr: &Address) -> Option<&AddrEntry> {
        self.entries.get(addr)
    }

    /// Insert an address; returns false for duplicates and invalid addresses
    pub fn add(&mut self, addr: Address) -> bool {
        if !addr.is_valid() || self.entries.contains_key(&addr) {
            return false;
        }
        if self.entries.len() >= self.capacity {
            self.evict_one();
        }
        self.entries.insert(addr, AddrEntry::new());
        true
    }

    /// Remove an address; no-op if absent
    pub fn remove(&mut self, addr: &Address) -> bool {
        self.entries.remove(addr).is_some()
    }

    /// Up to `n` distinct addresses in random order, skipping terrible ones
    pub fn sample(&self, n: usize) -> Vec<Address> {
        let mut rng = rand::thread_rng();
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.is_terrible())
            .map(|(addr, _)| addr.clone())
            .choose_multiple(&mut rng, n)
    }

    /// Record a connection attempt that did not succeed
    pub fn attempt(&mut self, addr: &Address) {
        if let Some(entry) = self.entries.get_mut(addr) {
            entry.attempts += 1;
            entry.last_attempt = Some(Instant::now());
        }
    }

    /// Record a successful connection
    pub fn good(&mut self, addr: &Address) {
        if let Some(entry) = self.entries.get_mut(addr) {
            entry.successes += 1;
            entry.attempts = 0;
            entry.last_success = Some(Instant::now());
        }
    }

    /// Drop a terrible entry if there is one, otherwise a random one
    fn evict_one(&mut self) {
        let victim = self
            .entries
            .iter()
            .find(|(_, entry)| entry.is_terrible())
            .map(|(addr, _)| addr.clone())
            .or_else(|| {
                let mut rng = rand::thread_rng();
                self.entries.keys().choose(&mut rng).cloned()
            });

        if let Some(addr) = victim {
            log::debug!("Address book full, evicting {}", addr);
            self.entries.remove(&addr);
        }
    }
}

impl Default for AddressBook {
    fn default() -> Self {
        Self::new(DEFAULT_ADDRESS_BOOK_CAPACITY)
    }
}
