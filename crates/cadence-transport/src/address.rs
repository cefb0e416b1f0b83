//! Endpoint addresses.
//!
//! An [`Address`] is a resolved `host:port` pair. It is the routing key of the
//! transceiver's demux table and, for receivers, the thing that tells the
//! source sub-stream apart from the repair sub-stream.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(SocketAddr);

impl Address {
    /// Parse and resolve `host:port`. Hostnames go through the system
    /// resolver and the first result wins.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::ConfigInvalid("empty address".into()));
        }
        if let Ok(addr) = text.parse::<SocketAddr>() {
            return Ok(Address(addr));
        }
        let mut resolved = text
            .to_socket_addrs()
            .map_err(|e| Error::ConfigInvalid(format!("bad address {text:?}: {e}")))?;
        resolved
            .next()
            .map(Address)
            .ok_or_else(|| Error::ConfigInvalid(format!("address {text:?} resolved to nothing")))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address(addr)
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Address::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
