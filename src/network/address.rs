//! Peer addresses
//!
//! An [`Address`] is the `host:port` string used to reach a peer. Equality is
//! structural on the string, so `localhost:9981` and `127.0.0.1:9981` are
//! different addresses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Longest accepted textual address
pub const MAX_ADDRESS_LEN: usize = 255;

/// Reasons an address fails to parse
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("address {0:?} is longer than {MAX_ADDRESS_LEN} bytes")]
    TooLong(String),
    #[error("address {0:?} is not of the form host:port")]
    MissingPort(String),
    #[error("address {0:?} has an empty host")]
    EmptyHost(String),
    #[error("address {0:?} has an invalid port")]
    InvalidPort(String),
    #[error("address {0:?} is a wildcard and cannot be dialed")]
    Unspecified(String),
}

/// A `host:port` peer address.
///
/// Values decoded off the wire are not validated by deserialization; call
/// [`Address::is_valid`] before acting on them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

/// Split `host:port`, accepting bracketed IPv6 hosts.
fn split_host_port(s: &str) -> Option<(&str, &str)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = after.strip_prefix(':')?;
        return Some((host, port));
    }

    let (host, port) = s.rsplit_once(':')?;
    if host.contains(':') || host.contains('[') || host.contains(']') {
        // Unbracketed IPv6 is ambiguous
        return None;
    }
    Some((host, port))
}

impl Address {
    /// Parse and validate a `host:port` string
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        if s.len() > MAX_ADDRESS_LEN {
            return Err(AddressError::TooLong(s.to_string()));
        }
        let (host, port) =
            split_host_port(s).ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(AddressError::EmptyHost(s.to_string()));
        }
        port.parse::<u16>()
            .map_err(|_| AddressError::InvalidPort(s.to_string()))?;
        Ok(Self(s.to_string()))
    }

    /// Build an address from a host and a port
    pub fn from_parts(host: &str, port: u16) -> Result<Self, AddressError> {
        if host.contains(':') && !host.starts_with('[') {
            Self::parse(&format!("[{}]:{}", host, port))
        } else {
            Self::parse(&format!("{}:{}", host, port))
        }
    }

    /// The host part, or an empty string if the address is malformed
    pub fn host(&self) -> &str {
        split_host_port(&self.0).map_or("", |(host, _)| host)
    }

    /// The port part, or an empty string if the address is malformed
    pub fn port(&self) -> &str {
        split_host_port(&self.0).map_or("", |(_, port)| port)
    }

    /// The host is a wildcard IP such as `0.0.0.0` or `::`
    pub fn is_unspecified(&self) -> bool {
        self.host()
            .parse::<IpAddr>()
            .map_or(false, |ip| ip.is_unspecified())
    }

    pub fn is_valid(&self) -> bool {
        Self::parse(&self.0).is_ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        // SocketAddr renders IPv6 with brackets
        Self(addr.to_string())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
